//! Syzygy endgame tablebase probing.
//!
//! Uses shakmaty-syzygy to probe WDL (Win/Draw/Loss) and DTZ (Distance To
//! Zeroing) tables. Positions are converted from the search's `chess` board
//! through FEN, which only happens at low piece counts where the cost is
//! irrelevant next to the probe itself.
//!
//! Root moves are ranked once before the search; during the search, WDL
//! probes are gated on piece count, probe depth, a reset halfmove clock and
//! absent castling rights, and translate into scores just outside the
//! evaluation range but inside the mate band.

use crate::defs::{Depth, Value, PAWN_VALUE_EG, VALUE_DRAW, VALUE_TB_WIN};
use crate::position::Position;
use crate::search::RootMove;
use chess::Board;
use shakmaty::fen::Fen;
use shakmaty::CastlingMode;
use shakmaty_syzygy::{Dtz, Tablebase, Wdl};
use std::path::Path;

/// Wrapper around a loaded shakmaty-syzygy Tablebase.
pub struct SyzygyTB {
    tb: Tablebase<shakmaty::Chess>,
    max_pieces: usize,
}

/// Result of a WDL probe, from the probed side's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TbWdl {
    Loss,
    BlessedLoss,
    Draw,
    CursedWin,
    Win,
}

impl TbWdl {
    /// Signed magnitude: loss -2 .. win +2.
    #[inline]
    pub fn signum2(self) -> i32 {
        match self {
            TbWdl::Loss => -2,
            TbWdl::BlessedLoss => -1,
            TbWdl::Draw => 0,
            TbWdl::CursedWin => 1,
            TbWdl::Win => 2,
        }
    }

    #[inline]
    pub fn negate(self) -> TbWdl {
        match self {
            TbWdl::Win => TbWdl::Loss,
            TbWdl::CursedWin => TbWdl::BlessedLoss,
            TbWdl::Draw => TbWdl::Draw,
            TbWdl::BlessedLoss => TbWdl::CursedWin,
            TbWdl::Loss => TbWdl::Win,
        }
    }
}

fn convert_wdl(wdl: Wdl) -> TbWdl {
    match wdl {
        Wdl::Win => TbWdl::Win,
        Wdl::CursedWin => TbWdl::CursedWin,
        Wdl::Draw => TbWdl::Draw,
        Wdl::BlessedLoss => TbWdl::BlessedLoss,
        Wdl::Loss => TbWdl::Loss,
    }
}

impl SyzygyTB {
    pub fn new<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut tb = Tablebase::new();
        let count = tb.add_directory(path.as_ref())?;
        let max_pieces = tb.max_pieces();
        println!(
            "info string Syzygy TB loaded: {} tables, max {} pieces",
            count, max_pieces
        );
        Ok(Self { tb, max_pieces })
    }

    #[inline]
    pub fn max_pieces(&self) -> usize {
        self.max_pieces
    }

    fn to_shakmaty(board: &Board) -> Option<shakmaty::Chess> {
        let fen_str = format!("{}", board);
        let fen: Fen = fen_str.parse().ok()?;
        fen.into_position(CastlingMode::Standard).ok()
    }

    /// Probe WDL for the side to move; None is a probe failure and the
    /// caller falls back to a normal search.
    pub fn probe_wdl(&self, board: &Board) -> Option<TbWdl> {
        let pos = Self::to_shakmaty(board)?;
        self.tb
            .probe_wdl_after_zeroing(&pos)
            .ok()
            .map(convert_wdl)
    }

    pub fn probe_dtz(&self, board: &Board) -> Option<i32> {
        let pos = Self::to_shakmaty(board)?;
        match self.tb.probe_dtz(&pos) {
            Ok(maybe_dtz) => {
                let d: Dtz = maybe_dtz.ignore_rounding();
                Some(d.0)
            }
            Err(_) => None,
        }
    }
}

/// Tablebase configuration resolved from the operator options.
#[derive(Clone, Copy)]
pub struct TbConfig {
    pub cardinality: u32,
    pub probe_depth: Depth,
    pub use_rule50: bool,
    pub root_in_tb: bool,
}

impl Default for TbConfig {
    fn default() -> TbConfig {
        TbConfig {
            cardinality: 0,
            probe_depth: 1,
            use_rule50: true,
            root_in_tb: false,
        }
    }
}

/// Translate a successful WDL probe into a search score: a TB win is worth
/// slightly less the later it arrives and the more of our pieces remain,
/// which steers the search toward conversions.
pub fn tb_value(wdl: TbWdl, cfg: &TbConfig, pos: &Position, ply: i32) -> Value {
    let draw_score = if cfg.use_rule50 { 1 } else { 0 };
    let v = wdl.signum2();
    let centi_ply = PAWN_VALUE_EG * ply / 100;
    if v < -draw_score {
        -VALUE_TB_WIN + centi_ply + PAWN_VALUE_EG * pos.piece_count_of(pos.side_to_move()) as i32
    } else if v > draw_score {
        VALUE_TB_WIN - centi_ply - PAWN_VALUE_EG * pos.piece_count_of(!pos.side_to_move()) as i32
    } else if v < 0 {
        -56
    } else {
        VALUE_DRAW
    }
}

/// Should this node probe at all?
pub fn probe_allowed(cfg: &TbConfig, pos: &Position, depth: Depth) -> bool {
    let pieces = pos.piece_count();
    cfg.cardinality > 0
        && pieces <= cfg.cardinality
        && (pieces < cfg.cardinality || depth >= cfg.probe_depth)
        && pos.rule50_count() == 0
        && !pos.can_castle()
}

/// Rank root moves by DTZ/WDL once before the search starts. On success the
/// list is stably reordered so the best TB band comes first; on any probe
/// failure ranks are zeroed and the search proceeds normally.
pub fn rank_root_moves(
    tb: &SyzygyTB,
    cfg: &mut TbConfig,
    pos: &mut Position,
    root_moves: &mut Vec<RootMove>,
) {
    cfg.root_in_tb = false;
    if cfg.cardinality < pos.piece_count() || pos.can_castle() || root_moves.is_empty() {
        return;
    }

    let mut ranked = Vec::with_capacity(root_moves.len());
    for rm in root_moves.iter() {
        let m = rm.first();
        pos.do_move(m);
        let wdl = tb.probe_wdl(pos.board()).map(TbWdl::negate);
        let dtz = tb.probe_dtz(pos.board()).unwrap_or(0).abs();
        pos.undo_move();
        let Some(wdl) = wdl else {
            // Missing table: abandon ranking entirely.
            for rm in root_moves.iter_mut() {
                rm.tb_rank = 0;
            }
            return;
        };
        // Win bands outrank draw bands outrank losses; within a winning
        // band prefer the shortest distance to zeroing.
        let rank = wdl.signum2() * 1000 - dtz.min(999);
        ranked.push((rank, wdl));
    }

    for (rm, (rank, wdl)) in root_moves.iter_mut().zip(ranked) {
        rm.tb_rank = rank;
        rm.tb_score = tb_value(wdl, cfg, pos, 1);
    }
    root_moves.sort_by(|a, b| b.tb_rank.cmp(&a.tb_rank));
    cfg.root_in_tb = true;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wdl_negation_swaps_bands() {
        assert_eq!(TbWdl::Win.negate(), TbWdl::Loss);
        assert_eq!(TbWdl::CursedWin.negate(), TbWdl::BlessedLoss);
        assert_eq!(TbWdl::Draw.negate(), TbWdl::Draw);
        for wdl in [TbWdl::Loss, TbWdl::BlessedLoss, TbWdl::Draw, TbWdl::CursedWin, TbWdl::Win] {
            assert_eq!(wdl.negate().signum2(), -wdl.signum2());
        }
    }

    #[test]
    fn tb_values_sit_inside_the_tb_band() {
        let cfg = TbConfig {
            cardinality: 5,
            ..TbConfig::default()
        };
        let pos = Position::from_fen("8/8/8/4k3/8/4K3/4P3/8 w - - 0 1").unwrap();
        let win = tb_value(TbWdl::Win, &cfg, &pos, 4);
        let loss = tb_value(TbWdl::Loss, &cfg, &pos, 4);
        assert!(win > 0 && win < VALUE_TB_WIN);
        assert!(loss < 0 && loss > -VALUE_TB_WIN);
        assert_eq!(tb_value(TbWdl::Draw, &cfg, &pos, 4), VALUE_DRAW);
        // Cursed wins count as draws under the 50-move rule...
        assert_eq!(tb_value(TbWdl::CursedWin, &cfg, &pos, 4), VALUE_DRAW);
        // ...but as wins when the rule is ignored.
        let cfg_no50 = TbConfig {
            use_rule50: false,
            ..cfg
        };
        assert!(tb_value(TbWdl::CursedWin, &cfg_no50, &pos, 4) > 0);
    }

    #[test]
    fn probe_gating_respects_cardinality_and_clock() {
        let cfg = TbConfig {
            cardinality: 5,
            probe_depth: 4,
            ..TbConfig::default()
        };
        let pos = Position::from_fen("8/8/8/4k3/8/4K3/4P3/8 w - - 0 1").unwrap();
        // 3 pieces, strictly under cardinality: depth does not matter.
        assert!(probe_allowed(&cfg, &pos, 1));
        // Nonzero halfmove clock blocks probing.
        let pos = Position::from_fen("8/8/8/4k3/8/4K3/4P3/8 w - - 5 3").unwrap();
        assert!(!probe_allowed(&cfg, &pos, 10));
        // Castling rights block probing.
        let pos = Position::from_fen("4k3/8/8/8/8/8/8/4K2R w K - 0 1").unwrap();
        assert!(!probe_allowed(&cfg, &pos, 10));
        // Too many pieces.
        let startpos = Position::startpos();
        assert!(!probe_allowed(&cfg, &startpos, 10));
    }
}
