// src/search/movepick.rs
//
// Staged move enumerator. Orders: TT move, captures split into good and bad
// by static exchange, refutations (killers, counter move), then quiets. The
// quiescence and ProbCut variants restrict generation to their tactical
// subsets. The generator underneath yields only legal moves, so the search
// needs no extra legality pass; the picker still guarantees no duplicates.
//
// Moves inside a stage are picked lazily with a selection scan, so a cutoff
// on the first capture never pays for sorting the rest.

use crate::defs::{Depth, Value, DEPTH_QS_CHECKS};
use crate::position::{piece_index, piece_value, Position};
use crate::search::history::{Histories, MAX_LPH};
use chess::{ChessMove, MoveGen, Piece, EMPTY};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Kind {
    Main,
    QSearch,
    ProbCut,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Stage {
    TtMove,
    CaptureInit,
    GoodCapture,
    Refutation,
    QuietInit,
    Quiet,
    BadCapture,
    EvasionInit,
    Evasion,
    QsCaptureInit,
    QsCapture,
    QsCheckInit,
    QsCheck,
    ProbCutInit,
    ProbCut,
    Done,
}

/// Read-only ordering inputs for one node.
pub struct OrderingContext<'a> {
    pub hists: &'a Histories,
    /// Continuation-history arena indices for plies -1, -2, -4, -6
    /// (slots 0, 1, 3, 5; the rest unused).
    pub cont_hist: [usize; 6],
    pub ply: i32,
}

pub struct MovePicker {
    kind: Kind,
    stage: Stage,
    tt_move: Option<ChessMove>,
    refutations: [Option<ChessMove>; 3],
    refutation_idx: usize,
    depth: Depth,
    threshold: Value,
    moves: Vec<(ChessMove, i32)>,
    idx: usize,
    bad_captures: Vec<ChessMove>,
    bad_idx: usize,
}

impl MovePicker {
    /// Main-search picker. Falls into evasion staging when in check.
    pub fn new_main(
        pos: &Position,
        tt_move: Option<ChessMove>,
        depth: Depth,
        killers: [Option<ChessMove>; 2],
        counter: Option<ChessMove>,
    ) -> MovePicker {
        let tt_move = tt_move.filter(|&m| pos.legal(m));
        let stage = if tt_move.is_some() {
            Stage::TtMove
        } else if pos.in_check() {
            Stage::EvasionInit
        } else {
            Stage::CaptureInit
        };
        MovePicker {
            kind: Kind::Main,
            stage,
            tt_move,
            refutations: [killers[0], killers[1], counter],
            refutation_idx: 0,
            depth,
            threshold: 0,
            moves: Vec::new(),
            idx: 0,
            bad_captures: Vec::new(),
            bad_idx: 0,
        }
    }

    /// Quiescence picker: captures, promotions, and quiet checks when the
    /// TT depth admits them.
    pub fn new_qsearch(pos: &Position, tt_move: Option<ChessMove>, depth: Depth) -> MovePicker {
        let tt_move = tt_move
            .filter(|&m| pos.legal(m))
            .filter(|&m| {
                pos.in_check() || depth >= DEPTH_QS_CHECKS || pos.capture_or_promotion(m)
            });
        let stage = if tt_move.is_some() {
            Stage::TtMove
        } else if pos.in_check() {
            Stage::EvasionInit
        } else {
            Stage::QsCaptureInit
        };
        MovePicker {
            kind: Kind::QSearch,
            stage,
            tt_move,
            refutations: [None; 3],
            refutation_idx: 0,
            depth,
            threshold: 0,
            moves: Vec::new(),
            idx: 0,
            bad_captures: Vec::new(),
            bad_idx: 0,
        }
    }

    /// ProbCut picker: only captures expected to beat `threshold`.
    pub fn new_probcut(pos: &Position, tt_move: Option<ChessMove>, threshold: Value) -> MovePicker {
        let tt_move = tt_move
            .filter(|&m| pos.legal(m))
            .filter(|&m| pos.capture_or_promotion(m) && pos.see_ge(m, threshold));
        let stage = if tt_move.is_some() {
            Stage::TtMove
        } else {
            Stage::ProbCutInit
        };
        MovePicker {
            kind: Kind::ProbCut,
            stage,
            tt_move,
            refutations: [None; 3],
            refutation_idx: 0,
            depth: 0,
            threshold,
            moves: Vec::new(),
            idx: 0,
            bad_captures: Vec::new(),
            bad_idx: 0,
        }
    }

    fn score_capture(&self, pos: &Position, ctx: &OrderingContext, m: ChessMove) -> i32 {
        let victim = if pos.is_en_passant(m) {
            Piece::Pawn
        } else {
            pos.board().piece_on(m.get_dest()).unwrap_or(Piece::Pawn)
        };
        let piece = pos
            .moved_piece(m)
            .map(|p| piece_index(pos.side_to_move(), p))
            .unwrap_or(0);
        6 * piece_value(victim)
            + ctx
                .hists
                .capture
                .get(piece, m.get_dest().to_index(), victim.to_index())
    }

    fn score_quiet(&self, pos: &Position, ctx: &OrderingContext, m: ChessMove) -> i32 {
        let us = pos.side_to_move();
        let piece = pos
            .moved_piece(m)
            .map(|p| piece_index(us, p))
            .unwrap_or(0);
        let to = m.get_dest().to_index();
        let ch = &ctx.hists.continuation;
        let mut score = ctx.hists.main.get(us, m)
            + 2 * ch.get(ctx.cont_hist[0], piece, to)
            + 2 * ch.get(ctx.cont_hist[1], piece, to)
            + 2 * ch.get(ctx.cont_hist[3], piece, to);
        if (ctx.ply as usize) < MAX_LPH {
            score += 4 * ctx.hists.low_ply.get(ctx.ply as usize, m);
        }
        score
    }

    fn generate_captures(&mut self, pos: &Position, ctx: &OrderingContext) {
        let mut gen = MoveGen::new_legal(pos.board());
        gen.set_iterator_mask(*pos.board().color_combined(!pos.side_to_move()));
        for m in &mut gen {
            if Some(m) == self.tt_move {
                continue;
            }
            let score = self.score_capture(pos, ctx, m);
            self.moves.push((m, score));
        }
        // The destination mask misses en passant and promotions to an empty
        // square; sweep the rest for them.
        gen.set_iterator_mask(!EMPTY);
        for m in &mut gen {
            if Some(m) == self.tt_move {
                continue;
            }
            if pos.is_en_passant(m) || m.get_promotion().is_some() {
                let score = self.score_capture(pos, ctx, m);
                self.moves.push((m, score));
            }
        }
    }

    fn generate_quiets(&mut self, pos: &Position, ctx: &OrderingContext) {
        let mut gen = MoveGen::new_legal(pos.board());
        gen.set_iterator_mask(!*pos.board().color_combined(!pos.side_to_move()));
        for m in &mut gen {
            if Some(m) == self.tt_move
                || self.refutations.contains(&Some(m))
                || pos.is_en_passant(m)
                || m.get_promotion().is_some()
            {
                continue;
            }
            let score = self.score_quiet(pos, ctx, m);
            self.moves.push((m, score));
        }
    }

    fn generate_evasions(&mut self, pos: &Position, ctx: &OrderingContext) {
        for m in MoveGen::new_legal(pos.board()) {
            if Some(m) == self.tt_move {
                continue;
            }
            let score = if pos.capture_or_promotion(m) {
                (1 << 28) + self.score_capture(pos, ctx, m)
            } else {
                self.score_quiet(pos, ctx, m)
            };
            self.moves.push((m, score));
        }
    }

    fn generate_qs_checks(&mut self, pos: &Position) {
        let mut gen = MoveGen::new_legal(pos.board());
        gen.set_iterator_mask(!*pos.board().color_combined(!pos.side_to_move()));
        for m in &mut gen {
            if Some(m) == self.tt_move
                || pos.is_en_passant(m)
                || m.get_promotion().is_some()
                || !pos.gives_check(m)
            {
                continue;
            }
            self.moves.push((m, 0));
        }
    }

    /// Lazy selection: swap the best remaining entry of the current stage
    /// list to the front and return it.
    fn pick_best(&mut self) -> Option<(ChessMove, i32)> {
        if self.idx >= self.moves.len() {
            return None;
        }
        let mut best = self.idx;
        for i in self.idx + 1..self.moves.len() {
            if self.moves[i].1 > self.moves[best].1 {
                best = i;
            }
        }
        self.moves.swap(self.idx, best);
        let picked = self.moves[self.idx];
        self.idx += 1;
        Some(picked)
    }

    pub fn next_move(
        &mut self,
        pos: &Position,
        ctx: &OrderingContext,
        skip_quiets: bool,
    ) -> Option<ChessMove> {
        loop {
            match self.stage {
                Stage::TtMove => {
                    self.stage = match self.kind {
                        _ if pos.in_check() && self.kind != Kind::ProbCut => Stage::EvasionInit,
                        Kind::Main => Stage::CaptureInit,
                        Kind::QSearch => Stage::QsCaptureInit,
                        Kind::ProbCut => Stage::ProbCutInit,
                    };
                    if let Some(m) = self.tt_move {
                        return Some(m);
                    }
                }
                Stage::CaptureInit => {
                    self.generate_captures(pos, ctx);
                    self.stage = Stage::GoodCapture;
                }
                Stage::GoodCapture => match self.pick_best() {
                    Some((m, _)) => {
                        if pos.see_ge(m, 0) {
                            return Some(m);
                        }
                        self.bad_captures.push(m);
                    }
                    None => {
                        self.stage = Stage::Refutation;
                        self.refutation_idx = 0;
                    }
                },
                Stage::Refutation => {
                    while self.refutation_idx < 3 {
                        let candidate = self.refutations[self.refutation_idx];
                        self.refutation_idx += 1;
                        if let Some(m) = candidate {
                            // The counter move may repeat a killer.
                            if self.refutation_idx == 3
                                && self.refutations[..2].contains(&Some(m))
                            {
                                continue;
                            }
                            if Some(m) != self.tt_move
                                && pos.legal(m)
                                && !pos.capture_or_promotion(m)
                            {
                                return Some(m);
                            }
                        }
                    }
                    self.stage = Stage::QuietInit;
                }
                Stage::QuietInit => {
                    if !skip_quiets {
                        let start = self.moves.len();
                        self.idx = start;
                        self.generate_quiets(pos, ctx);
                    }
                    self.stage = Stage::Quiet;
                }
                Stage::Quiet => {
                    if !skip_quiets {
                        if let Some((m, _)) = self.pick_best() {
                            return Some(m);
                        }
                    }
                    self.stage = Stage::BadCapture;
                    self.bad_idx = 0;
                }
                Stage::BadCapture => {
                    if self.bad_idx < self.bad_captures.len() {
                        self.bad_idx += 1;
                        return Some(self.bad_captures[self.bad_idx - 1]);
                    }
                    self.stage = Stage::Done;
                }
                Stage::EvasionInit => {
                    self.generate_evasions(pos, ctx);
                    self.stage = Stage::Evasion;
                }
                Stage::Evasion => match self.pick_best() {
                    Some((m, _)) => return Some(m),
                    None => self.stage = Stage::Done,
                },
                Stage::QsCaptureInit => {
                    self.generate_captures(pos, ctx);
                    self.stage = Stage::QsCapture;
                }
                Stage::QsCapture => match self.pick_best() {
                    Some((m, _)) => return Some(m),
                    None => {
                        if self.depth >= DEPTH_QS_CHECKS {
                            self.stage = Stage::QsCheckInit;
                        } else {
                            self.stage = Stage::Done;
                        }
                    }
                },
                Stage::QsCheckInit => {
                    self.idx = self.moves.len();
                    self.generate_qs_checks(pos);
                    self.stage = Stage::QsCheck;
                }
                Stage::QsCheck => match self.pick_best() {
                    Some((m, _)) => return Some(m),
                    None => self.stage = Stage::Done,
                },
                Stage::ProbCutInit => {
                    self.generate_captures(pos, ctx);
                    self.stage = Stage::ProbCut;
                }
                Stage::ProbCut => match self.pick_best() {
                    Some((m, _)) => {
                        if pos.see_ge(m, self.threshold) {
                            return Some(m);
                        }
                    }
                    None => self.stage = Stage::Done,
                },
                Stage::Done => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::str::FromStr;

    fn ctx(hists: &Histories) -> OrderingContext<'_> {
        let sentinel = hists.continuation.sentinel();
        OrderingContext {
            hists,
            cont_hist: [sentinel; 6],
            ply: 0,
        }
    }

    fn drain(picker: &mut MovePicker, pos: &Position, ctx: &OrderingContext) -> Vec<ChessMove> {
        let mut out = Vec::new();
        while let Some(m) = picker.next_move(pos, ctx, false) {
            out.push(m);
        }
        out
    }

    #[test]
    fn main_picker_emits_every_legal_move_once() {
        let hists = Histories::new();
        let pos = Position::from_fen(
            "r1bqkbnr/pppp1ppp/2n5/4p3/2B1P3/5N2/PPPP1PPP/RNBQK2R w KQkq - 4 4",
        )
        .unwrap();
        let tt = ChessMove::from_str("e1g1").unwrap();
        let killer = ChessMove::from_str("d2d3").unwrap();
        let mut picker = MovePicker::new_main(&pos, Some(tt), 8, [Some(killer), None], None);
        let c = ctx(&hists);
        let emitted = drain(&mut picker, &pos, &c);
        let legal: HashSet<_> = pos.legal_moves().into_iter().collect();
        let unique: HashSet<_> = emitted.iter().copied().collect();
        assert_eq!(unique.len(), emitted.len(), "duplicate move emitted");
        assert_eq!(unique, legal);
        assert_eq!(emitted[0], tt);
    }

    #[test]
    fn evasion_picker_covers_check_positions() {
        let hists = Histories::new();
        // White king in check from a queen.
        let pos = Position::from_fen("4k3/8/8/8/8/8/4q3/4K3 w - - 0 1").unwrap();
        assert!(pos.in_check());
        let mut picker = MovePicker::new_main(&pos, None, 5, [None, None], None);
        let c = ctx(&hists);
        let emitted = drain(&mut picker, &pos, &c);
        let legal: HashSet<_> = pos.legal_moves().into_iter().collect();
        assert_eq!(emitted.iter().copied().collect::<HashSet<_>>(), legal);
    }

    #[test]
    fn skip_quiets_still_yields_tactical_moves() {
        let hists = Histories::new();
        let pos =
            Position::from_fen("rnbqkbnr/ppp1pppp/8/3p4/4P3/8/PPPP1PPP/RNBQKBNR w KQkq - 0 2")
                .unwrap();
        let mut picker = MovePicker::new_main(&pos, None, 8, [None, None], None);
        let c = ctx(&hists);
        let mut tactical = Vec::new();
        while let Some(m) = picker.next_move(&pos, &c, true) {
            tactical.push(m);
        }
        assert!(tactical.iter().any(|&m| pos.is_capture(m)));
        assert!(tactical.iter().all(|&m| pos.capture_or_promotion(m)));
    }

    #[test]
    fn qsearch_picker_is_captures_only_below_check_depth() {
        let hists = Histories::new();
        let pos =
            Position::from_fen("rnbqkbnr/ppp1pppp/8/3p4/4P3/8/PPPP1PPP/RNBQKBNR w KQkq - 0 2")
                .unwrap();
        let mut picker = MovePicker::new_qsearch(&pos, None, -1);
        let c = ctx(&hists);
        let emitted = drain(&mut picker, &pos, &c);
        assert!(!emitted.is_empty());
        assert!(emitted.iter().all(|&m| pos.capture_or_promotion(m)));
    }

    #[test]
    fn probcut_picker_filters_by_exchange_threshold() {
        let hists = Histories::new();
        // Queen can capture a defended pawn; rook can capture a free knight.
        let pos = Position::from_fen("k3n3/8/3p4/2p5/8/4R3/3Q4/K7 w - - 0 1").unwrap();
        let mut picker = MovePicker::new_probcut(&pos, None, 200);
        let c = ctx(&hists);
        let emitted = drain(&mut picker, &pos, &c);
        for m in &emitted {
            assert!(pos.see_ge(*m, 200));
        }
    }

    #[test]
    fn good_captures_precede_bad_captures() {
        let hists = Histories::new();
        // Rook takes free pawn is good; queen takes defended pawn is bad.
        let pos = Position::from_fen("k7/2p5/3p4/8/1p6/8/1R1Q4/K7 w - - 0 1").unwrap();
        let mut picker = MovePicker::new_main(&pos, None, 6, [None, None], None);
        let c = ctx(&hists);
        let emitted = drain(&mut picker, &pos, &c);
        let good = emitted
            .iter()
            .position(|&m| m == ChessMove::from_str("b2b4").unwrap());
        let bad = emitted
            .iter()
            .position(|&m| m == ChessMove::from_str("d2d6").unwrap());
        let (good, bad) = (good.unwrap(), bad.unwrap());
        assert!(good < bad);
    }
}
