// src/search/mod.rs
//
// Shared search definitions: node types, stack frames, root moves, limits,
// and the startup-initialized reduction table.

pub mod breadcrumbs;
pub mod history;
pub mod lazy_smp;
pub mod movepick;
pub mod syzygy;
pub mod time;
pub mod tt;
pub mod worker;

use crate::defs::{Depth, Value, MAX_MOVES, MAX_PLY, VALUE_INFINITE, VALUE_ZERO};
use chess::ChessMove;
use once_cell::sync::Lazy;
use std::time::Instant;

/// Stack frames below the search root that the continuation-history lookups
/// may touch; frame `ply` lives at `stack[ply + STACK_OFFSET]`.
pub const STACK_OFFSET: usize = 7;
pub const STACK_SIZE: usize = MAX_PLY as usize + 10;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NodeType {
    Root,
    Pv,
    NonPv,
}

impl NodeType {
    #[inline]
    pub fn is_pv(self) -> bool {
        self != NodeType::NonPv
    }

    #[inline]
    pub fn is_root(self) -> bool {
        self == NodeType::Root
    }
}

/// Per-ply frame of the search stack. Frames below the root stay
/// zero-initialized and act as sentinels for the (ss-n) lookups.
#[derive(Clone)]
pub struct StackFrame {
    pub ply: i32,
    pub current_move: Option<ChessMove>,
    pub excluded_move: Option<ChessMove>,
    pub killers: [Option<ChessMove>; 2],
    pub static_eval: Value,
    pub stat_score: i32,
    pub move_count: i32,
    pub in_check: bool,
    pub tt_pv: bool,
    pub tt_hit: bool,
    pub double_extensions: i32,
    /// Index into the continuation-history arena for the move made at this
    /// ply (the sentinel table while no move is made).
    pub cont_hist: usize,
    /// True when the move at this ply was the null move.
    pub null_move: bool,
    pub pv: Vec<ChessMove>,
}

impl StackFrame {
    pub fn new(sentinel_cont_hist: usize) -> StackFrame {
        StackFrame {
            ply: 0,
            current_move: None,
            excluded_move: None,
            killers: [None; 2],
            static_eval: VALUE_ZERO,
            stat_score: 0,
            move_count: 0,
            in_check: false,
            tt_pv: false,
            tt_hit: false,
            double_extensions: 0,
            cont_hist: sentinel_cont_hist,
            null_move: false,
            pv: Vec::new(),
        }
    }
}

/// A root move with its principal variation and bookkeeping for sorting,
/// MultiPV and tablebase ranking.
#[derive(Clone)]
pub struct RootMove {
    pub pv: Vec<ChessMove>,
    pub score: Value,
    pub previous_score: Value,
    pub sel_depth: i32,
    pub tb_rank: i32,
    pub tb_score: Value,
}

impl RootMove {
    pub fn new(m: ChessMove) -> RootMove {
        RootMove {
            pv: vec![m],
            score: -VALUE_INFINITE,
            previous_score: -VALUE_INFINITE,
            sel_depth: 0,
            tb_rank: 0,
            tb_score: VALUE_ZERO,
        }
    }

    #[inline]
    pub fn first(&self) -> ChessMove {
        self.pv[0]
    }
}

/// Descending stable order: TB rank first, then score, then previous score.
pub fn sort_root_moves(moves: &mut [RootMove]) {
    moves.sort_by(|a, b| {
        b.tb_rank
            .cmp(&a.tb_rank)
            .then(b.score.cmp(&a.score))
            .then(b.previous_score.cmp(&a.previous_score))
    });
}

/// Limits parsed from a `go` command.
#[derive(Clone)]
pub struct SearchLimits {
    pub time: [i64; 2],
    pub inc: [i64; 2],
    pub movestogo: i32,
    pub depth: Option<Depth>,
    pub movetime: Option<i64>,
    pub mate: Option<i32>,
    pub nodes: Option<u64>,
    pub perft: Option<Depth>,
    pub infinite: bool,
    pub ponder: bool,
    pub searchmoves: Vec<ChessMove>,
    pub start_time: Instant,
}

impl Default for SearchLimits {
    fn default() -> SearchLimits {
        SearchLimits {
            time: [0; 2],
            inc: [0; 2],
            movestogo: 0,
            depth: None,
            movetime: None,
            mate: None,
            nodes: None,
            perft: None,
            infinite: false,
            ponder: false,
            searchmoves: Vec::new(),
            start_time: Instant::now(),
        }
    }
}

impl SearchLimits {
    pub fn use_time_management(&self) -> bool {
        self.mate.is_none()
            && self.movetime.is_none()
            && self.depth.is_none()
            && self.nodes.is_none()
            && self.perft.is_none()
            && !self.infinite
    }
}

/// Base reduction magnitudes, one per move-count/depth index.
static REDUCTIONS: Lazy<[i32; MAX_MOVES]> = Lazy::new(|| {
    let mut r = [0; MAX_MOVES];
    for (i, slot) in r.iter_mut().enumerate().skip(1) {
        *slot = (21.9 * (i as f64).ln()) as i32;
    }
    r
});

/// Late-move reduction in plies for the given depth and move count.
#[inline]
pub fn reduction(improving: bool, depth: Depth, move_count: i32) -> Depth {
    let d = REDUCTIONS[(depth as usize).min(MAX_MOVES - 1)];
    let m = REDUCTIONS[(move_count as usize).min(MAX_MOVES - 1)];
    (d * m + 534) / 1024 + i32::from(!improving && d * m > 904)
}

/// History bonus for a completed search of the given depth.
#[inline]
pub fn stat_bonus(depth: Depth) -> i32 {
    if depth > 14 {
        73
    } else {
        6 * depth * depth + 229 * depth - 215
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reductions_grow_with_depth_and_move_count() {
        assert_eq!(reduction(true, 1, 1), 0);
        let shallow = reduction(true, 4, 4);
        let deep = reduction(true, 20, 20);
        assert!(deep > shallow);
        // Not improving can only add one extra ply.
        for (d, mc) in [(4, 4), (12, 9), (30, 40)] {
            let base = reduction(true, d, mc);
            let worse = reduction(false, d, mc);
            assert!(worse == base || worse == base + 1);
        }
    }

    #[test]
    fn stat_bonus_caps_at_deep_depths() {
        assert_eq!(stat_bonus(15), 73);
        assert_eq!(stat_bonus(20), 73);
        assert_eq!(stat_bonus(1), 6 + 229 - 215);
        assert!(stat_bonus(14) > stat_bonus(2));
    }

    #[test]
    fn root_move_sort_is_stable_on_ties() {
        use std::str::FromStr;
        let a = ChessMove::from_str("e2e4").unwrap();
        let b = ChessMove::from_str("d2d4").unwrap();
        let c = ChessMove::from_str("g1f3").unwrap();
        let mut rms: Vec<RootMove> = [a, b, c].iter().map(|&m| RootMove::new(m)).collect();
        rms[1].score = 50;
        sort_root_moves(&mut rms);
        assert_eq!(rms[0].first(), b);
        // The tied (-INF) tail keeps its original relative order.
        assert_eq!(rms[1].first(), a);
        assert_eq!(rms[2].first(), c);
    }
}
