// src/search/worker.rs
//
// One search worker: the iterative-deepening driver, the aspiration-window
// loop around the root search, the main negamax recursion with its pruning
// and extension heuristics, the quiescence search, and the history updates
// they feed. Workers share the transposition table and breadcrumbs; all
// history tables and the stack are private.

use crate::book::experience::ExperienceStore;
use crate::defs::*;
use crate::evaluate::{evaluate, ScorePair};
use crate::position::{piece_index, piece_value_eg, reverse_move, Position, NO_PIECE};
use crate::search::breadcrumbs::{Breadcrumbs, ThreadHolding};
use crate::search::history::{Histories, COUNTER_MOVE_PRUNE_THRESHOLD, MAX_LPH};
use crate::search::movepick::{MovePicker, OrderingContext};
use crate::search::syzygy::{self, SyzygyTB, TbConfig};
use crate::search::time::TimeManager;
use crate::search::tt::{encode_move, TranspositionTable};
use crate::search::{
    reduction, sort_root_moves, stat_bonus, NodeType, RootMove, SearchLimits, StackFrame,
    STACK_OFFSET, STACK_SIZE,
};
use crate::uci;
use chess::{ChessMove, Color, Piece, Square};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

const TT_HIT_AVERAGE_WINDOW: u64 = 4096;
const TT_HIT_AVERAGE_RESOLUTION: u64 = 1024;

#[inline]
fn futility_margin(depth: Depth, improving: bool) -> Value {
    214 * (depth - i32::from(improving))
}

#[inline]
fn futility_move_count(improving: bool, depth: Depth) -> i32 {
    (3 + depth * depth) / (2 - i32::from(improving))
}

/// Mix an excluded move into the position key so singular re-searches get
/// their own TT slots.
#[inline]
fn exclusion_key(key: u64, m: ChessMove) -> u64 {
    key ^ (encode_move(m) as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Options snapshot a worker carries through one search.
#[derive(Clone)]
pub struct WorkerOptions {
    pub multi_pv: usize,
    pub dynamic_contempt: i32,
    pub variety: i32,
    /// "multiPV Search": when non-zero forces MultiPV = 2^k.
    pub tactical: u32,
    pub show_wdl: bool,
    pub threads: usize,
    /// Exact-search mode: no pruning, no LMR. Single worker only.
    pub full_search: bool,
    pub use_experience: bool,
}

impl Default for WorkerOptions {
    fn default() -> WorkerOptions {
        WorkerOptions {
            multi_pv: 1,
            dynamic_contempt: 12,
            variety: 0,
            tactical: 0,
            show_wdl: false,
            threads: 1,
            full_search: false,
            use_experience: false,
        }
    }
}

/// Coordinator-owned state every worker can see.
pub struct SharedState {
    pub stop: AtomicBool,
    pub ponder: AtomicBool,
    pub stop_on_ponderhit: AtomicBool,
    pub increase_depth: AtomicBool,
    pub nodes: Vec<AtomicU64>,
    pub tb_hits: Vec<AtomicU64>,
    pub best_move_changes: Vec<AtomicU64>,
    pub best_previous_score: parking_lot::Mutex<Value>,
    pub iter_values: parking_lot::Mutex<[Value; 4]>,
    pub previous_time_reduction: parking_lot::Mutex<f64>,
}

impl SharedState {
    pub fn new(threads: usize) -> SharedState {
        SharedState {
            stop: AtomicBool::new(false),
            ponder: AtomicBool::new(false),
            stop_on_ponderhit: AtomicBool::new(false),
            increase_depth: AtomicBool::new(true),
            nodes: (0..threads).map(|_| AtomicU64::new(0)).collect(),
            tb_hits: (0..threads).map(|_| AtomicU64::new(0)).collect(),
            best_move_changes: (0..threads).map(|_| AtomicU64::new(0)).collect(),
            best_previous_score: parking_lot::Mutex::new(VALUE_INFINITE),
            iter_values: parking_lot::Mutex::new([VALUE_ZERO; 4]),
            previous_time_reduction: parking_lot::Mutex::new(1.0),
        }
    }

    pub fn nodes_searched(&self) -> u64 {
        self.nodes.iter().map(|n| n.load(Ordering::Relaxed)).sum()
    }

    pub fn tb_hits_total(&self) -> u64 {
        self.tb_hits.iter().map(|n| n.load(Ordering::Relaxed)).sum()
    }
}

pub struct Worker {
    pub id: usize,
    pub pos: Position,
    pub root_moves: Vec<RootMove>,
    pub root_depth: Depth,
    pub completed_depth: Depth,
    pub sel_depth: i32,
    pub pv_idx: usize,
    pub pv_last: usize,
    pub histories: Histories,
    stack: Vec<StackFrame>,
    root_color: Color,
    contempt: ScorePair,
    tt_hit_average: u64,
    nmp_guard: bool,
    calls_cnt: i32,
    pub limits: SearchLimits,
    pub options: WorkerOptions,
    shared: Arc<SharedState>,
    tt: Arc<TranspositionTable>,
    breadcrumbs: Arc<Breadcrumbs>,
    time: Arc<TimeManager>,
    syzygy: Option<Arc<SyzygyTB>>,
    pub tb_cfg: TbConfig,
    experience: Option<Arc<ExperienceStore>>,
    tx: Option<Sender<String>>,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        pos: Position,
        root_moves: Vec<RootMove>,
        limits: SearchLimits,
        options: WorkerOptions,
        shared: Arc<SharedState>,
        tt: Arc<TranspositionTable>,
        breadcrumbs: Arc<Breadcrumbs>,
        time: Arc<TimeManager>,
        syzygy: Option<Arc<SyzygyTB>>,
        tb_cfg: TbConfig,
        experience: Option<Arc<ExperienceStore>>,
        tx: Option<Sender<String>>,
    ) -> Worker {
        let histories = Histories::new();
        let sentinel = histories.continuation.sentinel();
        let mut stack = Vec::with_capacity(STACK_SIZE);
        for i in 0..STACK_SIZE {
            let mut frame = StackFrame::new(sentinel);
            frame.ply = (i as i32 - STACK_OFFSET as i32).max(0);
            stack.push(frame);
        }
        let root_color = pos.side_to_move();
        Worker {
            id,
            pos,
            root_moves,
            root_depth: 0,
            completed_depth: 0,
            sel_depth: 0,
            pv_idx: 0,
            pv_last: 0,
            histories,
            stack,
            root_color,
            contempt: (0, 0),
            tt_hit_average: 0,
            nmp_guard: false,
            calls_cnt: 0,
            limits,
            options,
            shared,
            tt,
            breadcrumbs,
            time,
            syzygy,
            tb_cfg,
            experience,
            tx,
        }
    }

    #[inline]
    fn is_main(&self) -> bool {
        self.id == 0
    }

    #[inline]
    fn stopped(&self) -> bool {
        self.shared.stop.load(Ordering::Relaxed)
    }

    #[inline]
    fn count_node(&self) {
        self.shared.nodes[self.id].fetch_add(1, Ordering::Relaxed);
    }

    fn send(&self, line: String) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(line);
        }
    }

    /// Static eval with the root side's contempt trend applied.
    fn static_eval(&self) -> Value {
        let c = if self.pos.side_to_move() == self.root_color {
            self.contempt
        } else {
            (-self.contempt.0, -self.contempt.1)
        };
        evaluate(&self.pos, c)
    }

    /// The main iterative-deepening loop (one per worker).
    pub fn iterative_deepening(&mut self) {
        let mut last_best_move: Option<ChessMove> = None;
        let mut last_best_move_depth: Depth = 0;
        let mut time_reduction = 1.0f64;
        let mut tot_best_move_changes = 0.0f64;
        let mut iter_idx = 0usize;

        let mut alpha;
        let mut beta;
        let mut delta;
        let mut best_value = -VALUE_INFINITE;

        if self.is_main() {
            let prev = *self.shared.best_previous_score.lock();
            let mut iter_values = self.shared.iter_values.lock();
            let seed = if prev == VALUE_INFINITE { VALUE_ZERO } else { prev };
            *iter_values = [seed; 4];
        }

        self.histories.low_ply.shift();
        self.tt_hit_average = TT_HIT_AVERAGE_WINDOW * TT_HIT_AVERAGE_RESOLUTION / 2;

        let mut multi_pv = self.options.multi_pv;
        if self.options.tactical > 0 {
            multi_pv = multi_pv.max(1usize << self.options.tactical.min(8));
        }
        let multi_pv = multi_pv.min(self.root_moves.len());

        let mut search_again_counter = 0;

        loop {
            self.root_depth += 1;
            if self.root_depth >= MAX_PLY || self.stopped() {
                break;
            }
            if let Some(depth_limit) = self.limits.depth {
                if self.is_main() && self.root_depth > depth_limit {
                    break;
                }
            }

            if self.is_main() {
                tot_best_move_changes /= 2.0;
            }

            for rm in self.root_moves.iter_mut() {
                rm.previous_score = rm.score;
            }

            let mut pv_first = 0;
            self.pv_last = 0;

            if !self.shared.increase_depth.load(Ordering::Relaxed) {
                search_again_counter += 1;
            }

            self.pv_idx = 0;
            while self.pv_idx < multi_pv && !self.stopped() {
                if self.pv_idx == self.pv_last {
                    pv_first = self.pv_last;
                    self.pv_last += 1;
                    while self.pv_last < self.root_moves.len()
                        && self.root_moves[self.pv_last].tb_rank
                            == self.root_moves[pv_first].tb_rank
                    {
                        self.pv_last += 1;
                    }
                }

                self.sel_depth = 0;

                if self.root_depth >= 4 {
                    let prev = self.root_moves[self.pv_idx].previous_score;
                    delta = 17;
                    alpha = (prev - delta).max(-VALUE_INFINITE);
                    beta = (prev + delta).min(VALUE_INFINITE);

                    // Dynamic contempt: bias the trend toward the side that
                    // is ahead, saturating as the score grows.
                    let dt = self.options.dynamic_contempt;
                    let tr = dt * (113 * prev / (prev.abs() + 147));
                    self.contempt = (tr, tr / 2);
                } else {
                    delta = VALUE_INFINITE;
                    alpha = -VALUE_INFINITE;
                    beta = VALUE_INFINITE;
                }

                loop {
                    let adjusted_depth = (self.root_depth - search_again_counter).max(1);
                    best_value =
                        self.search(NodeType::Root, STACK_OFFSET, alpha, beta, adjusted_depth, false);

                    // Bring the new best to the front; the stable sort keeps
                    // every -INF-scored move in its previous order.
                    sort_root_moves(&mut self.root_moves[self.pv_idx..self.pv_last]);

                    if self.stopped() {
                        break;
                    }

                    if self.is_main()
                        && multi_pv == 1
                        && (best_value <= alpha || best_value >= beta)
                        && self.time.elapsed_ms() > 3000
                    {
                        let line = self.pv_info_string(self.root_depth, alpha, beta, multi_pv);
                        self.send(line);
                    }

                    if best_value <= alpha {
                        beta = (alpha + beta) / 2;
                        alpha = (best_value - delta).max(-VALUE_INFINITE);
                        if self.is_main() {
                            self.shared
                                .stop_on_ponderhit
                                .store(false, Ordering::Relaxed);
                        }
                    } else if best_value >= beta {
                        beta = (best_value + delta).min(VALUE_INFINITE);
                    } else {
                        break;
                    }

                    delta += delta / 4 + 5;
                }

                sort_root_moves(&mut self.root_moves[pv_first..self.pv_idx + 1]);

                if self.is_main()
                    && (self.stopped()
                        || self.pv_idx + 1 == multi_pv
                        || self.time.elapsed_ms() > 3000)
                {
                    let line = self.pv_info_string(self.root_depth, alpha, beta, multi_pv);
                    self.send(line);
                }

                self.pv_idx += 1;
            }

            if !self.stopped() {
                self.completed_depth = self.root_depth;
            }

            if Some(self.root_moves[0].first()) != last_best_move {
                last_best_move = Some(self.root_moves[0].first());
                last_best_move_depth = self.root_depth;
            }

            // Proven mate within the requested bound?
            if let Some(mate) = self.limits.mate {
                if best_value >= VALUE_MATE_IN_MAX_PLY && VALUE_MATE - best_value <= 2 * mate {
                    self.shared.stop.store(true, Ordering::Release);
                }
            }

            if !self.is_main() {
                continue;
            }

            // Time management: decide whether the next iteration fits.
            if self.limits.use_time_management()
                && !self.stopped()
                && !self.shared.stop_on_ponderhit.load(Ordering::Relaxed)
            {
                let best_previous_score = *self.shared.best_previous_score.lock();
                let iter_value = self.shared.iter_values.lock()[iter_idx];
                let mut falling_eval = (318.0
                    + 6.0 * (best_previous_score - best_value) as f64
                    + 6.0 * (iter_value - best_value) as f64)
                    / 825.0;
                falling_eval = falling_eval.clamp(0.5, 1.5);

                // A best move stable over many iterations earns a time cut.
                time_reduction = if last_best_move_depth + 9 < self.completed_depth {
                    1.92
                } else {
                    0.95
                };
                let previous_time_reduction = *self.shared.previous_time_reduction.lock();
                let reduction_factor =
                    (1.47 + previous_time_reduction) / (2.32 * time_reduction);

                for counter in self.shared.best_move_changes.iter() {
                    tot_best_move_changes += counter.swap(0, Ordering::Relaxed) as f64;
                }
                let best_move_instability = 1.073
                    + (2.25 - 9.9 / self.root_depth as f64).max(1.0) * tot_best_move_changes
                        / self.options.threads as f64;

                let elapsed = self.time.elapsed_ms();
                let optimum = self.time.optimum();
                let threshold = optimum as f64
                    * falling_eval
                    * reduction_factor
                    * best_move_instability;

                if (self.root_moves.len() == 1 && elapsed > optimum / 16)
                    || elapsed as f64 > threshold
                {
                    // Keep pondering through an expired budget; the stop
                    // fires on ponderhit.
                    if self.shared.ponder.load(Ordering::Relaxed) {
                        self.shared
                            .stop_on_ponderhit
                            .store(true, Ordering::Relaxed);
                    } else {
                        self.shared.stop.store(true, Ordering::Release);
                    }
                } else {
                    self.shared.increase_depth.store(
                        !(!self.shared.ponder.load(Ordering::Relaxed)
                            && elapsed as f64 > threshold * 0.58),
                        Ordering::Relaxed,
                    );
                }
            }

            {
                let mut iter_values = self.shared.iter_values.lock();
                iter_values[iter_idx] = best_value;
            }
            iter_idx = (iter_idx + 1) & 3;
        }

        if self.is_main() {
            *self.shared.previous_time_reduction.lock() = time_reduction;
        }
    }

    /// Periodic clock/node-budget poll, main worker only.
    fn check_time(&mut self) {
        self.calls_cnt -= 1;
        if self.calls_cnt > 0 {
            return;
        }
        self.calls_cnt = match self.limits.nodes {
            Some(n) => ((n / 1024) as i32).clamp(1, 1024),
            None => 1024,
        };

        // Never stop while pondering; ponderhit converts the state.
        if self.shared.ponder.load(Ordering::Relaxed) {
            return;
        }

        let elapsed = self.time.elapsed_ms();
        let out_of_time = self.limits.use_time_management()
            && (self.time.out_of_time()
                || self.shared.stop_on_ponderhit.load(Ordering::Relaxed));
        let movetime_hit = self
            .limits
            .movetime
            .map_or(false, |mt| elapsed >= mt);
        let nodes_hit = self
            .limits
            .nodes
            .map_or(false, |n| self.shared.nodes_searched() >= n);
        if out_of_time || movetime_hit || nodes_hit {
            self.shared.stop.store(true, Ordering::Release);
        }
    }

    fn cont_hist_indices(&self, si: usize) -> [usize; 6] {
        let sentinel = self.histories.continuation.sentinel();
        let mut out = [sentinel; 6];
        for (slot, off) in [(0usize, 1usize), (1, 2), (3, 4), (5, 6)] {
            out[slot] = self.stack[si - off].cont_hist;
        }
        out
    }

    #[inline]
    fn prev_square(&self, si: usize) -> Option<Square> {
        self.stack[si - 1].current_move.map(|m| m.get_dest())
    }

    fn update_pv(&mut self, si: usize, m: ChessMove) {
        let child: Vec<ChessMove> = self.stack[si + 1].pv.clone();
        let frame = &mut self.stack[si];
        frame.pv.clear();
        frame.pv.push(m);
        frame.pv.extend(child);
    }

    /// Histories of the move pairs at plies -1, -2, -4 and -6.
    fn update_continuation_histories(&mut self, si: usize, piece: usize, to: usize, bonus: i32) {
        let in_check = self.stack[si].in_check;
        for off in [1usize, 2, 4, 6] {
            if in_check && off > 2 {
                break;
            }
            if si >= off && self.stack[si - off].current_move.is_some() {
                let table = self.stack[si - off].cont_hist;
                self.histories.continuation.update(table, piece, to, bonus);
            }
        }
    }

    fn update_quiet_stats(&mut self, si: usize, m: ChessMove, bonus: i32, depth: Depth) {
        if self.stack[si].killers[0] != Some(m) {
            self.stack[si].killers[1] = self.stack[si].killers[0];
            self.stack[si].killers[0] = Some(m);
        }

        let us = self.pos.side_to_move();
        self.histories.main.update(us, m, bonus);
        let piece = self
            .pos
            .moved_piece(m)
            .map(|p| piece_index(us, p))
            .unwrap_or(NO_PIECE);
        self.update_continuation_histories(si, piece, m.get_dest().to_index(), bonus);

        // Penalty for the reversed move, pawns excluded.
        if self.pos.moved_piece(m) != Some(Piece::Pawn) {
            self.histories.main.update(us, reverse_move(m), -bonus);
        }

        if let Some(prev) = self.stack[si - 1].current_move {
            let prev_sq = prev.get_dest();
            if let Some(prev_piece) = self.pos.board().piece_on(prev_sq) {
                let idx = piece_index(!us, prev_piece);
                self.histories
                    .counter_moves
                    .set(idx, prev_sq.to_index(), m);
            }
        }

        let ply = self.stack[si].ply;
        if depth > 11 && (ply as usize) < MAX_LPH {
            self.histories
                .low_ply
                .update(ply as usize, m, stat_bonus(depth - 7));
        }
    }

    /// All stats for a completed node with a best move.
    #[allow(clippy::too_many_arguments)]
    fn update_all_stats(
        &mut self,
        si: usize,
        best_move: ChessMove,
        best_value: Value,
        beta: Value,
        quiets: &[ChessMove],
        captures: &[ChessMove],
        depth: Depth,
    ) {
        let us = self.pos.side_to_move();
        let bonus1 = stat_bonus(depth + 1);
        let bonus2 = if best_value > beta + PAWN_VALUE_MG {
            bonus1
        } else {
            bonus1.min(stat_bonus(depth))
        };

        if !self.pos.capture_or_promotion(best_move) {
            self.update_quiet_stats(si, best_move, bonus2, depth);
            for &m in quiets {
                self.histories.main.update(us, m, -bonus2);
                let piece = self
                    .pos
                    .moved_piece(m)
                    .map(|p| piece_index(us, p))
                    .unwrap_or(NO_PIECE);
                self.update_continuation_histories(si, piece, m.get_dest().to_index(), -bonus2);
            }
        } else {
            let piece = self
                .pos
                .moved_piece(best_move)
                .map(|p| piece_index(us, p))
                .unwrap_or(NO_PIECE);
            let captured = self
                .pos
                .board()
                .piece_on(best_move.get_dest())
                .unwrap_or(Piece::Pawn);
            self.histories.capture.update(
                piece,
                best_move.get_dest().to_index(),
                captured.to_index(),
                bonus1,
            );
        }

        // Extra penalty for an early refuted move on the previous ply.
        let prev_frame_mc = self.stack[si - 1].move_count;
        let prev_was_early = prev_frame_mc == 1 + i32::from(self.stack[si - 1].tt_hit)
            || self.stack[si - 1].current_move == self.stack[si - 1].killers[0];
        if prev_was_early && self.pos.captured_piece().is_none() {
            if let Some(prev_sq) = self.prev_square(si) {
                if let Some(prev_piece) = self.pos.board().piece_on(prev_sq) {
                    let idx = piece_index(!us, prev_piece);
                    self.update_continuation_histories(
                        si - 1,
                        idx,
                        prev_sq.to_index(),
                        -bonus1,
                    );
                }
            }
        }

        for &m in captures {
            let piece = self
                .pos
                .moved_piece(m)
                .map(|p| piece_index(us, p))
                .unwrap_or(NO_PIECE);
            let captured = self
                .pos
                .board()
                .piece_on(m.get_dest())
                .unwrap_or(Piece::Pawn);
            self.histories.capture.update(
                piece,
                m.get_dest().to_index(),
                captured.to_index(),
                -bonus1,
            );
        }
    }

    /// The main search. `si` indexes the stack frame of the current ply.
    #[allow(clippy::too_many_lines)]
    pub fn search(
        &mut self,
        node: NodeType,
        si: usize,
        mut alpha: Value,
        mut beta: Value,
        mut depth: Depth,
        cut_node: bool,
    ) -> Value {
        let pv_node = node.is_pv();
        let root_node = node.is_root();
        let max_next_depth = if root_node { depth } else { depth + 1 };

        // Step 1: horizon.
        if depth <= 0 {
            let qnode = if pv_node { NodeType::Pv } else { NodeType::NonPv };
            return self.qsearch(qnode, si, alpha, beta, 0);
        }

        debug_assert!(-VALUE_INFINITE <= alpha && alpha < beta && beta <= VALUE_INFINITE);
        debug_assert!(pv_node || alpha == beta - 1);
        debug_assert!(!(pv_node && cut_node));

        let ply = self.stack[si].ply;
        let in_check = self.pos.in_check();
        let prior_capture = self.pos.captured_piece().is_some();
        let us = self.pos.side_to_move();

        self.stack[si].in_check = in_check;
        self.stack[si].move_count = 0;
        self.stack[si].null_move = false;
        let mut best_value = -VALUE_INFINITE;
        let mut best_move: Option<ChessMove> = None;
        let mut game_cycle = false;
        let mut king_danger = false;
        let mut improving;

        if self.is_main() {
            self.check_time();
        }
        self.count_node();

        if pv_node && self.sel_depth < ply + 1 {
            self.sel_depth = ply + 1;
        }

        // Step 2: TT probe (excluded moves get a displaced key).
        let excluded_move = self.stack[si].excluded_move;
        let pos_key = match excluded_move {
            Some(m) => exclusion_key(self.pos.key(), m),
            None => self.pos.key(),
        };
        let (tt_data, tt_slot) = self.tt.probe(pos_key);
        let tt_hit = tt_data.is_some();
        self.stack[si].tt_hit = tt_hit;
        let mut tt_value = tt_data.map_or(VALUE_NONE, |d| {
            value_from_tt(d.value, ply, self.pos.rule50_count())
        });
        let tt_depth = tt_data.map_or(DEPTH_NONE, |d| d.depth);
        let tt_bound = tt_data.map_or(Bound::None, |d| d.bound);
        let mut tt_move = if root_node {
            Some(self.root_moves[self.pv_idx].first())
        } else {
            tt_data.and_then(|d| d.mv)
        };
        if excluded_move.is_none() {
            self.stack[si].tt_pv = pv_node || (tt_hit && tt_data.map_or(false, |d| d.is_pv));
        }

        // Low-ply history bump for the previous move near a PV root.
        if self.stack[si].tt_pv
            && depth > 12
            && ply >= 1
            && ((ply - 1) as usize) < MAX_LPH
            && !prior_capture
        {
            if let Some(prev) = self.stack[si - 1].current_move {
                self.histories
                    .low_ply
                    .update((ply - 1) as usize, prev, stat_bonus(depth - 5));
            }
        }

        // Running average of TT hits, used by an LMR tweak.
        self.tt_hit_average = (TT_HIT_AVERAGE_WINDOW - 1) * self.tt_hit_average
            / TT_HIT_AVERAGE_WINDOW
            + TT_HIT_AVERAGE_RESOLUTION * u64::from(tt_hit);

        if !root_node {
            // Step 3: cycle detection. Either side can force a repetition
            // from here, so a draw bounds the score.
            if self.pos.has_game_cycle(ply) {
                if VALUE_DRAW >= beta {
                    self.tt.save(
                        tt_slot,
                        pos_key,
                        VALUE_DRAW,
                        self.stack[si].tt_pv,
                        Bound::Upper,
                        depth,
                        None,
                        VALUE_NONE,
                    );
                    return VALUE_DRAW;
                }
                game_cycle = true;
                alpha = alpha.max(VALUE_DRAW);
            }

            // Step 4: draws, aborted searches, ply cap.
            if self.pos.is_draw(ply) {
                return VALUE_DRAW;
            }
            if self.stopped() || ply >= MAX_PLY {
                return if ply >= MAX_PLY && !in_check {
                    self.static_eval()
                } else {
                    VALUE_DRAW
                };
            }

            // Step 5: mate-distance pruning.
            if alpha >= mate_in(ply + 1) {
                return mate_in(ply + 1);
            }
        }

        self.stack[si + 1].tt_pv = false;
        self.stack[si + 1].excluded_move = None;
        self.stack[si + 2].killers = [None; 2];
        self.stack[si].double_extensions = self.stack[si - 1].double_extensions;
        if !root_node {
            self.stack[si + 2].stat_score = 0;
        }

        // Step 6: experience injection. The deepest record may supersede the
        // TT; at non-PV nodes records act like completed searches for the
        // history tables.
        if excluded_move.is_none() && self.options.use_experience {
            if let Some(exp) = self.experience.clone() {
                if let Some(chain) = exp.probe(self.pos.key()) {
                    let mut superseded = false;
                    for entry in chain.iter().filter(|e| e.depth >= depth) {
                        if !superseded && (!tt_hit || entry.depth > tt_depth) {
                            let exp_value =
                                value_from_tt(entry.value, ply, self.pos.rule50_count());
                            superseded = true;
                            self.stack[si].tt_hit = true;
                            self.stack[si].tt_pv = true;
                            tt_move = Some(entry.mv);
                            tt_value = exp_value;
                            self.tt.save(
                                tt_slot,
                                pos_key,
                                value_to_tt(exp_value, ply),
                                true,
                                if exp_value >= beta { Bound::Lower } else { Bound::Exact },
                                entry.depth,
                                Some(entry.mv),
                                VALUE_NONE,
                            );
                            if pv_node {
                                break;
                            }
                        }
                        if !pv_node {
                            let exp_value =
                                value_from_tt(entry.value, ply, self.pos.rule50_count());
                            if exp_value >= beta {
                                if !self.pos.capture_or_promotion(entry.mv) {
                                    self.update_quiet_stats(
                                        si,
                                        entry.mv,
                                        stat_bonus(entry.depth),
                                        entry.depth,
                                    );
                                }
                                if self.stack[si - 1].move_count <= 2 && !prior_capture {
                                    if let Some(prev_sq) = self.prev_square(si) {
                                        if let Some(pp) = self.pos.board().piece_on(prev_sq) {
                                            let idx = piece_index(!us, pp);
                                            self.update_continuation_histories(
                                                si - 1,
                                                idx,
                                                prev_sq.to_index(),
                                                -stat_bonus(entry.depth + 1),
                                            );
                                        }
                                    }
                                }
                            } else if !self.pos.capture_or_promotion(entry.mv) {
                                let penalty = -stat_bonus(entry.depth);
                                self.histories.main.update(us, entry.mv, penalty);
                                let piece = self
                                    .pos
                                    .moved_piece(entry.mv)
                                    .map(|p| piece_index(us, p))
                                    .unwrap_or(NO_PIECE);
                                self.update_continuation_histories(
                                    si,
                                    piece,
                                    entry.mv.get_dest().to_index(),
                                    penalty,
                                );
                            }
                        }
                    }
                }
            }
        }
        let tt_hit = self.stack[si].tt_hit;

        // Step 7: TT cutoff at non-PV nodes.
        if !pv_node
            && tt_hit
            && !game_cycle
            && self.pos.rule50_count() < 88
            && tt_depth >= depth
            && tt_value != VALUE_NONE
            && (tt_value != VALUE_DRAW || VALUE_DRAW >= beta)
            && if tt_value >= beta {
                tt_bound.includes_lower()
            } else {
                tt_bound.includes_upper()
            }
        {
            if let Some(ttm) = tt_move {
                if tt_value >= beta {
                    if !self.pos.capture_or_promotion(ttm) {
                        self.update_quiet_stats(si, ttm, stat_bonus(depth), depth);
                    }
                    if self.stack[si - 1].move_count <= 2 && !prior_capture {
                        if let Some(prev_sq) = self.prev_square(si) {
                            if let Some(pp) = self.pos.board().piece_on(prev_sq) {
                                let idx = piece_index(!us, pp);
                                self.update_continuation_histories(
                                    si - 1,
                                    idx,
                                    prev_sq.to_index(),
                                    -stat_bonus(depth + 1),
                                );
                            }
                        }
                    }
                } else if !self.pos.capture_or_promotion(ttm) {
                    let penalty = -stat_bonus(depth);
                    self.histories.main.update(us, ttm, penalty);
                    let piece = self
                        .pos
                        .moved_piece(ttm)
                        .map(|p| piece_index(us, p))
                        .unwrap_or(NO_PIECE);
                    self.update_continuation_histories(
                        si,
                        piece,
                        ttm.get_dest().to_index(),
                        penalty,
                    );
                }
            }
            return tt_value;
        }

        // Step 8: tablebase probe.
        if !root_node && self.syzygy.is_some() && excluded_move.is_none() {
            if syzygy::probe_allowed(&self.tb_cfg, &self.pos, depth) {
                let tb = self.syzygy.as_ref().expect("checked above").clone();
                if self.is_main() {
                    self.calls_cnt = 0;
                }
                if let Some(wdl) = tb.probe_wdl(self.pos.board()) {
                    self.shared.tb_hits[self.id].fetch_add(1, Ordering::Relaxed);
                    let draw_score = if self.tb_cfg.use_rule50 { 1 } else { 0 };
                    let v = wdl.signum2();
                    let tb_score = syzygy::tb_value(wdl, &self.tb_cfg, &self.pos, ply);
                    if v.abs() <= draw_score
                        || !tt_hit
                        || (v < -draw_score && beta > tb_score + 19)
                        || (v > draw_score && alpha < tb_score - 19)
                    {
                        let bound = if v > draw_score {
                            Bound::Lower
                        } else if v < -draw_score {
                            Bound::Upper
                        } else {
                            Bound::Exact
                        };
                        self.tt.save(
                            tt_slot,
                            pos_key,
                            value_to_tt(tb_score, ply),
                            self.stack[si].tt_pv,
                            bound,
                            depth,
                            None,
                            VALUE_NONE,
                        );
                        return tb_score;
                    }
                }
            }
        }

        // Step 9: static evaluation.
        let mut eval;
        if in_check {
            self.stack[si].static_eval = VALUE_NONE;
            eval = VALUE_NONE;
            improving = false;
        } else {
            if tt_hit {
                eval = tt_data.map_or(VALUE_NONE, |d| d.eval);
                if eval == VALUE_NONE {
                    eval = self.static_eval();
                }
                self.stack[si].static_eval = eval;
                // A bounded TT value is a better estimate than the raw eval.
                if tt_value != VALUE_NONE
                    && if tt_value > eval {
                        tt_bound.includes_lower()
                    } else {
                        tt_bound.includes_upper()
                    }
                {
                    eval = tt_value;
                }
            } else {
                if self.stack[si - 1].null_move {
                    eval = -self.stack[si - 1].static_eval;
                } else {
                    eval = self.static_eval();
                }
                self.stack[si].static_eval = eval;
            }

            // Scale down as the halfmove clock eats into the result, twice
            // when a repetition looms.
            let scale = (100 - self.pos.rule50_count()).max(0);
            eval = eval * scale / 100;
            if game_cycle {
                eval = eval * scale / 100;
            }
            self.stack[si].static_eval = eval;

            if !tt_hit && excluded_move.is_none() {
                self.tt.save(
                    tt_slot,
                    pos_key,
                    VALUE_NONE,
                    self.stack[si].tt_pv,
                    Bound::None,
                    DEPTH_NONE,
                    None,
                    eval,
                );
            }

            // Static-eval swing improves quiet ordering of the prior move.
            if self.stack[si - 1].current_move.is_some()
                && !self.stack[si - 1].in_check
                && !prior_capture
            {
                let bonus = (-depth * 4
                    * (self.stack[si - 1].static_eval + self.stack[si].static_eval))
                    .clamp(-1000, 1000);
                let prev = self.stack[si - 1].current_move.expect("checked above");
                self.histories.main.update(!us, prev, bonus);
            }

            // Step 10: improving flag.
            improving = if self.stack[si - 2].static_eval == VALUE_NONE {
                self.stack[si].static_eval > self.stack[si - 4].static_eval
                    || self.stack[si - 4].static_eval == VALUE_NONE
            } else {
                self.stack[si].static_eval > self.stack[si - 2].static_eval
            };
            if self.options.full_search {
                improving = true;
            }

            // Early pruning block.
            if !pv_node
                && excluded_move.is_none()
                && !game_cycle
                && !self.nmp_guard
                && !self.options.full_search
                && eval.abs() < 2 * VALUE_KNOWN_WIN
            {
                if self.root_depth > 10 {
                    king_danger = self.pos.king_danger();
                }

                // Step 11: futility pruning, child node.
                if depth < 6
                    && !king_danger
                    && alpha.abs() < VALUE_KNOWN_WIN
                    && eval - futility_margin(depth, improving) >= beta
                    && eval < VALUE_KNOWN_WIN
                {
                    return eval;
                }

                // Step 12: null-move pruning with verification.
                if !self.stack[si - 1].null_move
                    && self.stack[si - 1].stat_score < 23767
                    && eval >= beta
                    && eval >= self.stack[si].static_eval
                    && self.stack[si].static_eval
                        >= beta - 20 * depth - 22 * i32::from(improving)
                            + 168 * i32::from(self.stack[si].tt_pv)
                            + 159
                    && self.pos.non_pawn_material(us) > 0
                    && !king_danger
                    && !(self.root_depth > 10 && self.pos.legal_move_count() < 6)
                {
                    let r = ((eval - beta) / 205).min(3) + depth / 3 + 4;

                    if depth < 11
                        || tt_value >= beta
                        || tt_depth < depth - r
                        || !tt_bound.includes_upper()
                    {
                        self.stack[si].current_move = None;
                        self.stack[si].null_move = true;
                        self.stack[si].cont_hist = self.histories.continuation.sentinel();

                        self.pos.do_null_move();
                        let null_value = -self.search(
                            NodeType::NonPv,
                            si + 1,
                            -beta,
                            -beta + 1,
                            depth - r,
                            !cut_node,
                        );
                        self.pos.undo_null_move();
                        self.stack[si].null_move = false;

                        if null_value >= beta {
                            // Never return unproven mate or TB scores.
                            let null_value = null_value.min(VALUE_TB_WIN_IN_MAX_PLY);

                            if beta.abs() < VALUE_KNOWN_WIN
                                && depth < 11
                                && beta
                                    <= self.qsearch(NodeType::NonPv, si, beta - 1, beta, 0)
                            {
                                return null_value;
                            }

                            // Verification search at high depths.
                            self.nmp_guard = true;
                            let v = self.search(
                                NodeType::NonPv,
                                si,
                                beta - 1,
                                beta,
                                depth - r,
                                false,
                            );
                            self.nmp_guard = false;

                            if v >= beta {
                                return null_value;
                            }
                        }
                    }
                }

                // Step 13: ProbCut.
                let prob_cut_beta = beta + 209 - 44 * i32::from(improving);
                if depth > 4
                    && beta.abs() < VALUE_TB_WIN_IN_MAX_PLY
                    && !(tt_hit && tt_depth >= depth - 3)
                {
                    let saved_tt_pv = self.stack[si].tt_pv;
                    self.stack[si].tt_pv = false;
                    let mut picker = MovePicker::new_probcut(
                        &self.pos,
                        tt_move,
                        prob_cut_beta - self.stack[si].static_eval,
                    );
                    let mut prob_cut_count = 0;
                    let cont_hist = self.cont_hist_indices(si);
                    loop {
                        if prob_cut_count >= 2 + 2 * i32::from(cut_node) {
                            break;
                        }
                        let m = {
                            let ctx = OrderingContext {
                                hists: &self.histories,
                                cont_hist,
                                ply,
                            };
                            picker.next_move(&self.pos, &ctx, false)
                        };
                        let Some(m) = m else { break };
                        if Some(m) == excluded_move {
                            continue;
                        }
                        prob_cut_count += 1;

                        self.stack[si].current_move = Some(m);
                        let piece = self
                            .pos
                            .moved_piece(m)
                            .map(|p| piece_index(us, p))
                            .unwrap_or(NO_PIECE);
                        self.stack[si].cont_hist = self
                            .histories
                            .continuation
                            .index(piece, m.get_dest().to_index());

                        self.pos.do_move(m);
                        let mut value = -self.qsearch(
                            NodeType::NonPv,
                            si + 1,
                            -prob_cut_beta,
                            -prob_cut_beta + 1,
                            0,
                        );
                        if value >= prob_cut_beta {
                            value = -self.search(
                                NodeType::NonPv,
                                si + 1,
                                -prob_cut_beta,
                                -prob_cut_beta + 1,
                                depth - 4,
                                !cut_node,
                            );
                        }
                        self.pos.undo_move();

                        if value >= prob_cut_beta {
                            let value = value.min(VALUE_TB_WIN_IN_MAX_PLY);
                            self.tt.save(
                                tt_slot,
                                pos_key,
                                value_to_tt(value, ply),
                                saved_tt_pv,
                                Bound::Lower,
                                depth - 3,
                                Some(m),
                                self.stack[si].static_eval,
                            );
                            return value;
                        }
                    }
                    self.stack[si].tt_pv = saved_tt_pv;
                }
            }
        }

        // Step 14: internal iterative reduction when a PV node has no TT move.
        if pv_node && depth >= 6 && tt_move.is_none() && !in_check && !self.options.full_search {
            depth -= 2;
        }

        // Moves loop setup.
        let tt_capture = tt_move.map_or(false, |m| self.pos.capture_or_promotion(m));
        let cont_hist = self.cont_hist_indices(si);
        let counter_move = self.prev_square(si).and_then(|sq| {
            self.pos
                .board()
                .piece_on(sq)
                .map(|p| piece_index(!us, p))
                .and_then(|idx| self.histories.counter_moves.get(idx, sq.to_index()))
        });
        let killers = self.stack[si].killers;
        let mut picker = MovePicker::new_main(&self.pos, tt_move, depth, killers, counter_move);

        let likely_fail_low = pv_node
            && tt_move.is_some()
            && tt_bound.includes_upper()
            && tt_depth >= depth;

        // Held for the whole moves loop; the claim is the signal other
        // workers read.
        let crumbs = self.breadcrumbs.clone();
        let _holding = ThreadHolding::new(&crumbs, self.id, pos_key, ply);
        let marked = _holding.marked();

        let mut move_count = 0;
        let mut quiets_searched: Vec<ChessMove> = Vec::with_capacity(64);
        let mut captures_searched: Vec<ChessMove> = Vec::with_capacity(32);
        let mut move_count_pruning = false;
        let mut singular_quiet_lmr = false;
        let mut double_extension = false;
        let mut value;

        // Step 15: iterate the picker until exhaustion or a beta cutoff.
        loop {
            let m = {
                let ctx = OrderingContext {
                    hists: &self.histories,
                    cont_hist,
                    ply,
                };
                picker.next_move(&self.pos, &ctx, move_count_pruning)
            };
            let Some(m) = m else { break };

            if Some(m) == excluded_move {
                continue;
            }

            // At root, honor searchmoves and the MultiPV band.
            if root_node
                && !self.root_moves[self.pv_idx..self.pv_last]
                    .iter()
                    .any(|rm| rm.first() == m)
            {
                continue;
            }

            move_count += 1;
            self.stack[si].move_count = move_count;

            if root_node && self.is_main() && self.time.elapsed_ms() > 3000 {
                self.send(format!(
                    "info depth {} currmove {} currmovenumber {}",
                    depth,
                    m,
                    move_count + self.pv_idx as i32
                ));
            }
            if pv_node {
                self.stack[si + 1].pv.clear();
            }

            let cap_or_promo = self.pos.capture_or_promotion(m);
            let moved_piece = self
                .pos
                .moved_piece(m)
                .map(|p| piece_index(us, p))
                .unwrap_or(NO_PIECE);
            let gives_check = self.pos.gives_check(m);

            // A checking move that leaves no replies is mate: score it
            // before any pruning or reductions can touch it, and without
            // entering the make/search/undo path below.
            let mut is_mate = false;
            if gives_check {
                self.pos.do_move(m);
                is_mate = self.pos.legal_move_count() == 0;
                self.pos.undo_move();
            }

            if is_mate {
                self.stack[si].current_move = Some(m);
                self.stack[si].cont_hist = self
                    .histories
                    .continuation
                    .index(moved_piece, m.get_dest().to_index());
                value = mate_in(ply + 1);
                if pv_node {
                    self.stack[si + 1].pv.clear();
                }
            } else {
                let mut extension: Depth = 0;
                let mut new_depth = depth - 1;

                let do_pruning_and_extensions = !self.options.full_search;
                if do_pruning_and_extensions {
                    // Step 16: shallow-depth pruning.
                    if !pv_node
                        && self.pos.non_pawn_material(us) > 0
                        && best_value > VALUE_TB_LOSS_IN_MAX_PLY
                    {
                        move_count_pruning =
                            move_count >= futility_move_count(improving, depth);

                        let lmr_depth =
                            (new_depth - reduction(improving, depth, move_count)).max(0);

                        if cap_or_promo || gives_check {
                            let captured = self
                                .pos
                                .board()
                                .piece_on(m.get_dest())
                                .unwrap_or(Piece::Pawn);
                            if !gives_check
                                && lmr_depth < 1
                                && self.histories.capture.get(
                                    moved_piece,
                                    m.get_dest().to_index(),
                                    captured.to_index(),
                                ) < 0
                            {
                                continue;
                            }
                            if !self.pos.see_ge(m, -218 * depth) {
                                continue;
                            }
                        } else {
                            let to = m.get_dest().to_index();
                            let ch = &self.histories.continuation;
                            let hist_sum = ch.get(cont_hist[0], moved_piece, to)
                                + ch.get(cont_hist[1], moved_piece, to)
                                + ch.get(cont_hist[3], moved_piece, to);
                            if lmr_depth < 5 && hist_sum < -3000 * depth + 3000 {
                                continue;
                            }
                            if lmr_depth < 3
                                && !in_check
                                && self.stack[si].static_eval + 174 + 157 * lmr_depth <= alpha
                            {
                                continue;
                            }
                            if !self.pos.see_ge(m, -21 * lmr_depth * (lmr_depth + 1)) {
                                continue;
                            }
                        }
                    }

                    // Step 17: extensions.
                    if game_cycle && (depth < 5 || pv_node) {
                        extension = 2;
                    } else if !root_node
                        && depth >= 7
                        && Some(m) == tt_move
                        && excluded_move.is_none()
                        && tt_value != VALUE_NONE
                        && beta.abs() < VALUE_TB_WIN_IN_MAX_PLY
                        && tt_bound.includes_lower()
                        && tt_depth >= depth - 3
                    {
                        // Singular extension: if every other move fails low
                        // against a lowered bound, the TT move is singular.
                        let singular_beta = (tt_value - 2 * depth).max(VALUE_TB_LOSS_IN_MAX_PLY);
                        let singular_depth = (depth - 1) / 2;

                        self.stack[si].excluded_move = Some(m);
                        value = self.search(
                            NodeType::NonPv,
                            si,
                            singular_beta - 1,
                            singular_beta,
                            singular_depth,
                            cut_node,
                        );
                        self.stack[si].excluded_move = None;

                        if value < singular_beta {
                            extension = 1;
                            singular_quiet_lmr = !tt_capture;

                            if !pv_node
                                && value < singular_beta - 93
                                && self.stack[si].double_extensions < 3
                            {
                                extension = 2;
                                double_extension = true;
                            }
                        } else if !pv_node
                            && !((ply & 1) == 1 && self.stack[si - 1].move_count > 1)
                        {
                            // Multi-cut: the reduced search failed high
                            // without the TT move, so several moves beat
                            // beta here.
                            if singular_beta >= beta {
                                return singular_beta.min(VALUE_TB_WIN_IN_MAX_PLY);
                            } else if tt_value >= beta {
                                self.stack[si].excluded_move = Some(m);
                                value = self.search(
                                    NodeType::NonPv,
                                    si,
                                    beta - 1,
                                    beta,
                                    (depth + 3) / 2,
                                    cut_node,
                                );
                                self.stack[si].excluded_move = None;
                                if value >= beta {
                                    return beta;
                                }
                            }
                        }
                    }

                    // Check extension.
                    if extension == 0
                        && gives_check
                        && depth > 6
                        && self.stack[si].static_eval.abs() > 100
                    {
                        extension = 1;
                    }

                    new_depth += extension;
                }
                self.stack[si].double_extensions =
                    self.stack[si - 1].double_extensions + i32::from(extension == 2);

                self.stack[si].current_move = Some(m);
                self.stack[si].cont_hist = self
                    .histories
                    .continuation
                    .index(moved_piece, m.get_dest().to_index());

                // Step 18: make the move.
                self.pos.do_move(m);

                // Step 19: late-move reductions.
                let do_lmr_step = !self.options.full_search;
                let mut did_lmr = false;
                let do_full_depth_search;
                if do_lmr_step
                    && depth >= 3
                    && !game_cycle
                    && !gives_check
                    && move_count > 1 + 2 * i32::from(root_node)
                    && self.sel_depth > depth
                    && (!pv_node || ply > 1 || self.id % 4 != 3)
                    && (!cap_or_promo || (cut_node && self.stack[si - 1].move_count > 1))
                {
                    let mut r = reduction(improving, depth, move_count);

                    if pv_node || self.stack[si - 1].move_count == 1 {
                        r -= 1;
                    }

                    if self.tt_hit_average
                        > 537 * TT_HIT_AVERAGE_RESOLUTION * TT_HIT_AVERAGE_WINDOW / 1024
                    {
                        r -= 1;
                    }

                    // On or near the PV, unless a fail-low looms.
                    if self.stack[si].tt_pv && !likely_fail_low {
                        r -= 2;
                    }

                    if self.root_depth > 10 && self.pos.king_danger() {
                        r -= 1;
                    }

                    // A busy opponent suggests a sharp position.
                    if self.stack[si - 1].move_count > 13 {
                        r -= 1;
                    }

                    if singular_quiet_lmr {
                        r -= 1;
                    }

                    if cut_node && Some(m) != killers[0] {
                        r += 2;
                    }

                    if tt_capture {
                        r += 1;
                    }

                    // Another worker already mining this subtree.
                    if marked {
                        r += 1;
                    }

                    let to = m.get_dest().to_index();
                    let ch = &self.histories.continuation;
                    let stat_score = self.histories.main.get(us, m)
                        + ch.get(cont_hist[0], moved_piece, to)
                        + ch.get(cont_hist[1], moved_piece, to)
                        + ch.get(cont_hist[3], moved_piece, to)
                        - 4923;
                    self.stack[si].stat_score = stat_score;

                    r -= stat_score / 14721;

                    if !pv_node && self.stack[si - 1].move_count > 1 {
                        let rr = (new_depth as f64 / (2.0 + ply as f64 / 2.8)) as i32;
                        r -= rr;
                    }

                    let allow_deeper = r < -1
                        && (move_count <= 5 || (depth > 6 && pv_node))
                        && !double_extension;
                    let d = (new_depth - r).clamp(1, new_depth + i32::from(allow_deeper));

                    value = -self.search(NodeType::NonPv, si + 1, -(alpha + 1), -alpha, d, true);

                    do_full_depth_search = value > alpha && d < new_depth;
                    did_lmr = true;
                } else {
                    do_full_depth_search = !do_lmr_step || !pv_node || move_count > 1;
                    value = -VALUE_INFINITE;
                }

                // Step 20: full-depth zero-window re-search.
                if do_full_depth_search {
                    value = -self.search(
                        NodeType::NonPv,
                        si + 1,
                        -(alpha + 1),
                        -alpha,
                        new_depth,
                        !cut_node,
                    );

                    if did_lmr && !cap_or_promo {
                        let bonus = if value > alpha {
                            stat_bonus(new_depth)
                        } else {
                            -stat_bonus(new_depth)
                        };
                        self.update_continuation_histories(
                            si,
                            moved_piece,
                            m.get_dest().to_index(),
                            bonus,
                        );
                    }
                }

                // Step 21: full PV search for the first move and fail-highs.
                if pv_node && (move_count == 1 || (value > alpha && (root_node || value < beta))) {
                    self.stack[si + 1].pv.clear();
                    value = -self.search(
                        NodeType::Pv,
                        si + 1,
                        -beta,
                        -alpha,
                        new_depth.min(max_next_depth),
                        false,
                    );
                }

                // Step 22: undo.
                self.pos.undo_move();
            }

            debug_assert!(value > -VALUE_INFINITE && value < VALUE_INFINITE);

            // Step 23: an aborted search's value cannot be trusted.
            if self.stopped() {
                return VALUE_ZERO;
            }

            if root_node {
                let rm_idx = self
                    .root_moves
                    .iter()
                    .position(|rm| rm.first() == m)
                    .expect("root move list contains every searched root move");
                if move_count == 1 || value > alpha {
                    let sel_depth = self.sel_depth;
                    let child_pv: Vec<ChessMove> = self.stack[si + 1].pv.clone();
                    let rm = &mut self.root_moves[rm_idx];
                    rm.score = value;
                    rm.sel_depth = sel_depth;
                    rm.pv.truncate(1);
                    rm.pv.extend(child_pv);
                    if move_count > 1 {
                        self.shared.best_move_changes[self.id].fetch_add(1, Ordering::Relaxed);
                    }
                } else {
                    self.root_moves[rm_idx].score = -VALUE_INFINITE;
                }
            }

            if value > best_value {
                best_value = value;
                if value > alpha {
                    best_move = Some(m);
                    if pv_node && !root_node {
                        self.update_pv(si, m);
                    }
                    if pv_node && value < beta {
                        alpha = value;
                    } else {
                        break; // fail high
                    }
                }
            }

            if Some(m) != best_move {
                if cap_or_promo && captures_searched.len() < 32 {
                    captures_searched.push(m);
                } else if !cap_or_promo && quiets_searched.len() < 64 {
                    quiets_searched.push(m);
                }
            }
        }

        // Step 24: mate and stalemate.
        if move_count == 0 {
            best_value = if excluded_move.is_some() {
                alpha
            } else if in_check {
                mated_in(ply)
            } else {
                VALUE_DRAW
            };
        } else if let Some(bm) = best_move {
            self.update_all_stats(
                si,
                bm,
                best_value,
                beta,
                &quiets_searched,
                &captures_searched,
                depth,
            );
        } else if (depth >= 3 || pv_node) && !prior_capture {
            // The countermove that led here refuted everything we tried.
            if let Some(prev_sq) = self.prev_square(si) {
                if let Some(pp) = self.pos.board().piece_on(prev_sq) {
                    let idx = piece_index(!us, pp);
                    self.update_continuation_histories(
                        si - 1,
                        idx,
                        prev_sq.to_index(),
                        stat_bonus(depth),
                    );
                }
            }
        }

        // Step 25: TT PV flag propagation.
        if best_value <= alpha {
            self.stack[si].tt_pv =
                self.stack[si].tt_pv || (self.stack[si - 1].tt_pv && depth > 3);
        } else if depth > 3 {
            self.stack[si].tt_pv = self.stack[si].tt_pv && self.stack[si + 1].tt_pv;
        }

        // Step 26: TT write.
        if excluded_move.is_none() && !(root_node && self.pv_idx > 0) {
            let bound = if best_value >= beta {
                Bound::Lower
            } else if pv_node && best_move.is_some() {
                Bound::Exact
            } else {
                Bound::Upper
            };
            self.tt.save(
                tt_slot,
                pos_key,
                value_to_tt(best_value, ply),
                self.stack[si].tt_pv,
                bound,
                depth,
                best_move,
                self.stack[si].static_eval,
            );
        }

        debug_assert!(best_value > -VALUE_INFINITE && best_value < VALUE_INFINITE);
        best_value
    }

    /// Quiescence search for depth <= 0: captures, promotions, and (at the
    /// checking depth) quiet checks, on top of a stand-pat bound.
    pub fn qsearch(
        &mut self,
        node: NodeType,
        si: usize,
        mut alpha: Value,
        beta: Value,
        depth: Depth,
    ) -> Value {
        let pv_node = node.is_pv();
        debug_assert!(depth <= 0);
        debug_assert!(pv_node || alpha == beta - 1);

        let old_alpha = alpha;
        let ply = self.stack[si].ply;
        let in_check = self.pos.in_check();
        self.stack[si].in_check = in_check;
        self.stack[si].null_move = false;
        let us = self.pos.side_to_move();
        let mut game_cycle = false;
        let mut best_move: Option<ChessMove> = None;

        if pv_node {
            self.stack[si].pv.clear();
        }

        self.count_node();

        if self.pos.has_game_cycle(ply) {
            if VALUE_DRAW >= beta {
                return VALUE_DRAW;
            }
            alpha = alpha.max(VALUE_DRAW);
            game_cycle = true;
        }

        if self.pos.is_draw(ply) {
            return VALUE_DRAW;
        }

        if ply >= MAX_PLY {
            return if !in_check { self.static_eval() } else { VALUE_DRAW };
        }

        if alpha >= mate_in(ply + 1) {
            return mate_in(ply + 1);
        }

        // Only two TT depth classes exist down here.
        let tt_depth = if in_check || depth >= DEPTH_QS_CHECKS {
            DEPTH_QS_CHECKS
        } else {
            DEPTH_QS_NO_CHECKS
        };

        let pos_key = self.pos.key();
        let (tt_data, tt_slot) = self.tt.probe(pos_key);
        let tt_hit = tt_data.is_some();
        self.stack[si].tt_hit = tt_hit;
        let tt_value = tt_data.map_or(VALUE_NONE, |d| {
            value_from_tt(d.value, ply, self.pos.rule50_count())
        });
        let tt_bound = tt_data.map_or(Bound::None, |d| d.bound);
        let tt_move = tt_data.and_then(|d| d.mv);
        let pv_hit = tt_hit && tt_data.map_or(false, |d| d.is_pv);

        if !pv_node
            && tt_hit
            && !game_cycle
            && self.pos.rule50_count() < 88
            && tt_data.map_or(DEPTH_NONE, |d| d.depth) >= tt_depth
            && tt_value != VALUE_NONE
            && (tt_value != VALUE_DRAW || VALUE_DRAW >= beta)
            && if tt_value >= beta {
                tt_bound.includes_lower()
            } else {
                tt_bound.includes_upper()
            }
        {
            return tt_value;
        }

        // Stand pat.
        let mut best_value;
        let mut futility_base;
        if in_check {
            self.stack[si].static_eval = VALUE_NONE;
            best_value = -VALUE_INFINITE;
            futility_base = -VALUE_INFINITE;
        } else {
            if tt_hit {
                let mut ev = tt_data.map_or(VALUE_NONE, |d| d.eval);
                if ev == VALUE_NONE {
                    ev = self.static_eval();
                }
                self.stack[si].static_eval = ev;
                best_value = ev;
                if tt_value != VALUE_NONE
                    && if tt_value > best_value {
                        tt_bound.includes_lower()
                    } else {
                        tt_bound.includes_upper()
                    }
                {
                    best_value = tt_value;
                }
            } else {
                best_value = if self.stack[si - 1].null_move {
                    -self.stack[si - 1].static_eval
                } else {
                    self.static_eval()
                };
                self.stack[si].static_eval = best_value;
            }

            let scale = (100 - self.pos.rule50_count()).max(0);
            best_value = best_value * scale / 100;
            if game_cycle {
                best_value = best_value * scale / 100;
            }
            self.stack[si].static_eval = best_value;

            if best_value >= beta {
                if !tt_hit {
                    self.tt.save(
                        tt_slot,
                        pos_key,
                        value_to_tt(best_value, ply),
                        false,
                        Bound::Lower,
                        DEPTH_NONE,
                        None,
                        self.stack[si].static_eval,
                    );
                }
                return best_value;
            }

            if pv_node && best_value > alpha {
                alpha = best_value;
            }

            futility_base = best_value + 155;
        }

        let cont_hist = self.cont_hist_indices(si);
        let mut picker = MovePicker::new_qsearch(&self.pos, tt_move, tt_depth);
        let mut move_count = 0;

        loop {
            let m = {
                let ctx = OrderingContext {
                    hists: &self.histories,
                    cont_hist,
                    ply,
                };
                picker.next_move(&self.pos, &ctx, false)
            };
            let Some(m) = m else { break };

            let gives_check = self.pos.gives_check(m);
            let cap_or_promo = self.pos.capture_or_promotion(m);
            move_count += 1;

            if !pv_node && best_value > VALUE_TB_LOSS_IN_MAX_PLY {
                // Futility and move-count pruning.
                if !gives_check
                    && futility_base > -VALUE_KNOWN_WIN
                    && m.get_promotion().is_none()
                {
                    if move_count > 2 {
                        continue;
                    }
                    let captured = if self.pos.is_en_passant(m) {
                        Piece::Pawn
                    } else {
                        self.pos.board().piece_on(m.get_dest()).unwrap_or(Piece::Pawn)
                    };
                    let futility_value = futility_base + piece_value_eg(captured);
                    if futility_value <= alpha {
                        best_value = best_value.max(futility_value);
                        continue;
                    }
                    if futility_base <= alpha && !self.pos.see_ge(m, 1) {
                        best_value = best_value.max(futility_base);
                        continue;
                    }
                }

                if !self.pos.see_ge(m, 0) {
                    continue;
                }
            }

            let moved_piece = self
                .pos
                .moved_piece(m)
                .map(|p| piece_index(us, p))
                .unwrap_or(NO_PIECE);

            self.stack[si].current_move = Some(m);
            self.stack[si].cont_hist = self
                .histories
                .continuation
                .index(moved_piece, m.get_dest().to_index());

            // Continuation-history pruning of hopeless quiets.
            if !cap_or_promo
                && !pv_node
                && best_value > VALUE_TB_LOSS_IN_MAX_PLY
                && self.histories.continuation.get(
                    cont_hist[0],
                    moved_piece,
                    m.get_dest().to_index(),
                ) < COUNTER_MOVE_PRUNE_THRESHOLD
                && self.histories.continuation.get(
                    cont_hist[1],
                    moved_piece,
                    m.get_dest().to_index(),
                ) < COUNTER_MOVE_PRUNE_THRESHOLD
            {
                continue;
            }

            self.pos.do_move(m);
            let value = -self.qsearch(node, si + 1, -beta, -alpha, depth - 1);
            self.pos.undo_move();

            debug_assert!(value > -VALUE_INFINITE && value < VALUE_INFINITE);

            if value > best_value {
                best_value = value;
                if value > alpha {
                    best_move = Some(m);
                    if pv_node {
                        self.update_pv(si, m);
                    }
                    if pv_node && value < beta {
                        alpha = value;
                    } else {
                        break;
                    }
                }
            }
        }

        // Opening variety: jitter near-level leaves to diversify play.
        let variety = self.options.variety;
        if variety > 0 && best_value + variety * PAWN_VALUE_EG / 100 >= 0 {
            best_value += rand::thread_rng().gen_range(0..=variety);
        }

        if in_check && best_value == -VALUE_INFINITE {
            return mated_in(ply);
        }

        let bound = if best_value >= beta {
            Bound::Lower
        } else if pv_node && best_value > old_alpha {
            Bound::Exact
        } else {
            Bound::Upper
        };
        self.tt.save(
            tt_slot,
            pos_key,
            value_to_tt(best_value, ply),
            pv_hit,
            bound,
            tt_depth,
            best_move,
            self.stack[si].static_eval,
        );

        debug_assert!(best_value > -VALUE_INFINITE && best_value < VALUE_INFINITE);
        best_value
    }

    /// Format a full `info ... pv ...` block for the current root state.
    pub fn pv_info_string(
        &self,
        depth: Depth,
        alpha: Value,
        beta: Value,
        multi_pv: usize,
    ) -> String {
        let elapsed = self.time.elapsed_ms().max(1) as u64;
        let nodes = self.shared.nodes_searched();
        let tb_hits = self.shared.tb_hits_total()
            + if self.tb_cfg.root_in_tb {
                self.root_moves.len() as u64
            } else {
                0
            };
        let mut out = String::new();

        for i in 0..multi_pv.min(self.root_moves.len()) {
            let rm = &self.root_moves[i];
            let updated = rm.score != -VALUE_INFINITE;
            if depth == 1 && !updated && i > 0 {
                continue;
            }
            let d = if updated { depth } else { (depth - 1).max(1) };
            let mut v = if updated { rm.score } else { rm.previous_score };
            if v == -VALUE_INFINITE {
                v = VALUE_ZERO;
            }
            let tb = self.tb_cfg.root_in_tb && v.abs() < VALUE_TB_WIN - 6 * PAWN_VALUE_EG;
            if tb {
                v = rm.tb_score;
            }

            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!(
                "info depth {} seldepth {} multipv {} score {}",
                d,
                rm.sel_depth,
                i + 1,
                uci::value_string(v)
            ));
            if self.options.show_wdl {
                out.push_str(&uci::wdl_string(v, self.pos.game_ply()));
            }
            if !tb && i == self.pv_idx {
                if v >= beta {
                    out.push_str(" lowerbound");
                } else if v <= alpha {
                    out.push_str(" upperbound");
                }
            }
            out.push_str(&format!(
                " nodes {} nps {}",
                nodes,
                nodes * 1000 / elapsed
            ));
            if elapsed > 1000 {
                out.push_str(&format!(" hashfull {}", self.tt.hashfull()));
            }
            out.push_str(&format!(" tbhits {} time {} pv", tb_hits, elapsed));
            for m in &rm.pv {
                out.push_str(&format!(" {}", m));
            }
        }
        out
    }

    /// Try to harvest a ponder move from the TT when the PV is one ply.
    pub fn extract_ponder_from_tt(&mut self) -> bool {
        if self.root_moves[0].pv.len() != 1 {
            return self.root_moves[0].pv.len() > 1;
        }
        let m = self.root_moves[0].first();
        if !self.pos.legal(m) {
            return false;
        }
        self.pos.do_move(m);
        let (tt_data, _) = self.tt.probe(self.pos.key());
        if let Some(ponder) = tt_data.and_then(|d| d.mv) {
            if self.pos.legal(ponder) {
                self.root_moves[0].pv.push(ponder);
            }
        }
        self.pos.undo_move();
        self.root_moves[0].pv.len() > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn make_worker(fen: &str, limits: SearchLimits) -> (Worker, mpsc::Receiver<String>) {
        let pos = Position::from_fen(fen).unwrap();
        let root_moves: Vec<RootMove> = pos.legal_moves().into_iter().map(RootMove::new).collect();
        let shared = Arc::new(SharedState::new(1));
        let tt = Arc::new(TranspositionTable::new(8));
        let breadcrumbs = Arc::new(Breadcrumbs::new());
        let time = Arc::new(TimeManager::new(&limits, pos.side_to_move(), 0, 30));
        let (tx, rx) = mpsc::channel();
        let worker = Worker::new(
            0,
            pos,
            root_moves,
            limits,
            WorkerOptions::default(),
            shared,
            tt,
            breadcrumbs,
            time,
            None,
            TbConfig::default(),
            None,
            Some(tx),
        );
        (worker, rx)
    }

    #[test]
    fn finds_mate_in_one() {
        let limits = SearchLimits {
            depth: Some(4),
            ..SearchLimits::default()
        };
        let (mut worker, _rx) = make_worker("6k1/5ppp/8/8/8/8/5PPP/R5K1 w - - 0 1", limits);
        worker.iterative_deepening();
        let best = worker.root_moves[0].first();
        assert_eq!(best.to_string(), "a1a8");
        assert!(worker.root_moves[0].score >= VALUE_MATE - 2);
    }

    #[test]
    fn threefold_shuffle_scores_draw() {
        let limits = SearchLimits {
            depth: Some(6),
            ..SearchLimits::default()
        };
        let (mut worker, _rx) = make_worker(
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1",
            limits.clone(),
        );
        // Nf3 Nf6 Ng1 Ng8 Nf3 Nf6 Ng1 Ng8: back at the start for the third
        // time; any further shuffling is a draw by repetition.
        use std::str::FromStr;
        for uci in ["g1f3", "g8f6", "f3g1", "f6g8", "g1f3", "g8f6", "f3g1", "f6g8"] {
            worker.pos.do_move(ChessMove::from_str(uci).unwrap());
        }
        assert!(worker.pos.is_draw(1));
    }

    #[test]
    fn search_respects_stop_flag() {
        let limits = SearchLimits::default();
        let (mut worker, _rx) = make_worker(
            "r1bqkbnr/pppp1ppp/2n5/4p3/2B1P3/5N2/PPPP1PPP/RNBQK2R w KQkq - 4 4",
            limits,
        );
        worker.pv_last = worker.root_moves.len();
        worker.shared.stop.store(true, Ordering::Release);
        let v = worker.search(NodeType::Root, STACK_OFFSET, -VALUE_INFINITE, VALUE_INFINITE, 5, false);
        // A stopped search returns zero and publishes nothing.
        assert_eq!(v, VALUE_ZERO);
    }

    #[test]
    fn single_worker_fixed_depth_is_deterministic() {
        let fen = "r2qkbnr/ppp2ppp/2np4/4p3/2B1P1b1/2N2N2/PPPP1PPP/R1BQK2R w KQkq - 4 5";
        let limits = SearchLimits {
            depth: Some(5),
            ..SearchLimits::default()
        };
        let (mut w1, _rx1) = make_worker(fen, limits.clone());
        w1.iterative_deepening();
        let (mut w2, _rx2) = make_worker(fen, limits);
        w2.iterative_deepening();
        assert_eq!(w1.root_moves[0].first(), w2.root_moves[0].first());
        assert_eq!(w1.root_moves[0].score, w2.root_moves[0].score);
    }

    #[test]
    fn qsearch_stands_pat_in_quiet_positions() {
        let limits = SearchLimits::default();
        let (mut worker, _rx) = make_worker(
            "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1",
            limits,
        );
        let v = worker.qsearch(
            NodeType::Pv,
            STACK_OFFSET,
            -VALUE_INFINITE + 1,
            VALUE_INFINITE - 1,
            0,
        );
        // No captures available: the stand-pat eval comes straight back.
        assert!(v.abs() < 200);
    }
}
