// src/search/lazy_smp.rs
//
// Worker pool and coordinator. On `go` the coordinator consults the books,
// builds per-worker copies of the root state, spawns N-1 helper threads and
// runs the main worker itself; on completion it joins everything, votes for
// the best worker, feeds the experience store and emits `bestmove`. All
// cross-worker state is the shared TT, the breadcrumb array and a handful of
// atomic flags.

use crate::book::experience::{ExperienceStore, EXP_MIN_DEPTH};
use crate::book::{BookSlotOptions, OpeningBook};
use crate::defs::{Value, VALUE_INFINITE, VALUE_MATE_IN_MAX_PLY};
use crate::position::Position;
use crate::search::breadcrumbs::Breadcrumbs;
use crate::search::syzygy::{self, SyzygyTB, TbConfig};
use crate::search::time::TimeManager;
use crate::search::tt::TranspositionTable;
use crate::search::worker::{SharedState, Worker, WorkerOptions};
use crate::search::{RootMove, SearchLimits};
use crate::uci;
use chess::ChessMove;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Everything the operator can configure that the search consults.
#[derive(Clone)]
pub struct EngineConfig {
    pub threads: usize,
    pub multi_pv: usize,
    pub move_overhead: i64,
    pub dynamic_contempt: i32,
    pub never_clear_hash: bool,
    pub variety: i32,
    pub tactical: u32,
    pub show_wdl: bool,
    pub syzygy_probe_depth: i32,
    pub syzygy_probe_limit: u32,
    pub syzygy_50_move_rule: bool,
    pub book1: BookSlotOptions,
    pub book2: BookSlotOptions,
    pub exp_book: bool,
    pub exp_book_max_moves: i32,
    pub exp_book_min_depth: i32,
    pub exp_book_eval_importance: i32,
    pub exp_book_best_move: bool,
    pub exp_readonly: bool,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            threads: 1,
            multi_pv: 1,
            move_overhead: 30,
            dynamic_contempt: 12,
            never_clear_hash: false,
            variety: 0,
            tactical: 0,
            show_wdl: false,
            syzygy_probe_depth: 1,
            syzygy_probe_limit: 7,
            syzygy_50_move_rule: true,
            book1: BookSlotOptions::default(),
            book2: BookSlotOptions::default(),
            exp_book: false,
            exp_book_max_moves: 16,
            exp_book_min_depth: EXP_MIN_DEPTH,
            exp_book_eval_importance: 5,
            exp_book_best_move: true,
            exp_readonly: false,
        }
    }
}

pub struct Searcher {
    pub tt: Arc<TranspositionTable>,
    pub breadcrumbs: Arc<Breadcrumbs>,
    pub config: EngineConfig,
    pub syzygy: Option<Arc<SyzygyTB>>,
    pub experience: Arc<ExperienceStore>,
    books: [OpeningBook; 2],
    shared: Mutex<Option<Arc<SharedState>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Searcher {
    pub fn new(tt: Arc<TranspositionTable>, experience: Arc<ExperienceStore>) -> Searcher {
        Searcher {
            tt,
            breadcrumbs: Arc::new(Breadcrumbs::new()),
            config: EngineConfig::default(),
            syzygy: None,
            experience,
            books: [OpeningBook::open(""), OpeningBook::open("")],
            shared: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn load_book(&mut self, slot: usize, path: &str) {
        self.books[slot] = OpeningBook::open(path);
    }

    pub fn set_syzygy_path(&mut self, path: &str) {
        self.syzygy = SyzygyTB::new(path).ok().map(Arc::new);
    }

    /// Resize the shared hash; only possible with no search in flight.
    pub fn resize_tt(&mut self, size_mb: usize) {
        self.wait_for_search_finished();
        if let Some(tt) = Arc::get_mut(&mut self.tt) {
            tt.resize(size_mb);
        }
    }

    /// Raise the stop flag of the running search, if any.
    pub fn stop(&self) {
        if let Some(shared) = self.shared.lock().as_ref() {
            shared.stop.store(true, Ordering::Release);
        }
    }

    /// The ponder move was played: convert into a normal timed search.
    pub fn ponderhit(&self) {
        if let Some(shared) = self.shared.lock().as_ref() {
            if shared.stop_on_ponderhit.load(Ordering::Relaxed) {
                shared.stop.store(true, Ordering::Release);
            }
            shared.ponder.store(false, Ordering::Release);
        }
    }

    /// Block until the current search (if any) has fully finished.
    pub fn wait_for_search_finished(&self) {
        let handle = self.handle.lock().take();
        if let Some(h) = handle {
            let _ = h.join();
        }
    }

    /// Reset state between games unless the operator forbids it.
    pub fn new_game(&self) {
        self.wait_for_search_finished();
        if !self.config.never_clear_hash {
            self.tt.clear();
        }
        let _ = self.experience.save();
        self.experience.resume_learning();
    }

    fn tb_config(&self, max_pieces: u32) -> TbConfig {
        let mut cardinality = self.config.syzygy_probe_limit.min(max_pieces);
        let mut probe_depth = self.config.syzygy_probe_depth;
        if cardinality < self.config.syzygy_probe_limit {
            probe_depth = 0;
        }
        if self.syzygy.is_none() {
            cardinality = 0;
        }
        TbConfig {
            cardinality,
            probe_depth,
            use_rule50: self.config.syzygy_50_move_rule,
            root_in_tb: false,
        }
    }

    /// Probe the opening books and the experience book in order; a hit
    /// skips the search entirely.
    fn probe_books(
        &mut self,
        pos: &Position,
        root_moves: &[RootMove],
        tx: &Sender<String>,
    ) -> Option<ChessMove> {
        let half_moves = pos.game_ply() / 2;

        for slot in 0..2 {
            let opts = if slot == 0 {
                self.config.book1.clone()
            } else {
                self.config.book2.clone()
            };
            if opts.enabled && half_moves < opts.depth {
                if let Some(m) = self.books[slot].probe(pos.board(), opts.best_move) {
                    if root_moves.iter().any(|rm| rm.first() == m) {
                        return Some(m);
                    }
                }
            }
        }

        if self.config.exp_book && half_moves < self.config.exp_book_max_moves {
            if let Some(chain) = self.experience.probe(pos.key()) {
                let mut quality: Vec<(ChessMove, Value, i32, i32)> = Vec::new();
                for e in chain
                    .iter()
                    .filter(|e| e.depth >= self.config.exp_book_min_depth)
                {
                    let (q, veto) = e.quality(pos, self.config.exp_book_eval_importance);
                    if q > 0 && !veto {
                        quality.push((e.mv, e.value, e.depth, q));
                    }
                }
                quality.sort_by(|a, b| b.3.cmp(&a.3));

                if !quality.is_empty() {
                    // Show the candidates to the GUI, weakest first.
                    for (count, (mv, value, depth, _)) in quality.iter().rev().enumerate() {
                        let _ = tx.send(format!(
                            "info depth {} seldepth {} multipv 1 score {} nodes {} nps 0 tbhits 0 time 0 pv {}",
                            depth,
                            depth,
                            uci::value_string(*value),
                            count + 1,
                            mv
                        ));
                    }

                    let pick = if !self.config.exp_book_best_move && quality.len() > 1 {
                        let limit = (quality.len() / 2).max(2).min(quality.len());
                        quality[rand::thread_rng().gen_range(0..limit)].0
                    } else {
                        quality[0].0
                    };
                    if root_moves.iter().any(|rm| rm.first() == pick) {
                        return Some(pick);
                    }
                }
            }
        }
        None
    }

    /// Handle `go`: set up shared state and launch the search thread.
    pub fn start_search(&mut self, pos: Position, limits: SearchLimits, tx: Sender<String>) {
        self.wait_for_search_finished();

        let threads = self.config.threads.max(1);
        let shared = Arc::new(SharedState::new(threads));
        shared.ponder.store(limits.ponder, Ordering::Release);
        *self.shared.lock() = Some(shared.clone());

        if !limits.infinite {
            self.tt.new_search();
        } else {
            self.tt.infinite_search();
        }

        // Root move set, honoring searchmoves.
        let mut root_moves: Vec<RootMove> = pos
            .legal_moves()
            .into_iter()
            .filter(|m| limits.searchmoves.is_empty() || limits.searchmoves.contains(m))
            .map(RootMove::new)
            .collect();

        if root_moves.is_empty() {
            // Checkmate or stalemate at the root: report and go idle.
            let score = if pos.in_check() { "mate 0" } else { "cp 0" };
            let _ = tx.send(format!("info depth 0 score {}", score));
            return;
        }

        // Books first; a hit short-circuits the whole search.
        if !limits.infinite && limits.mate.is_none() {
            if let Some(book_move) = self.probe_books(&pos, &root_moves, &tx) {
                let idx = root_moves
                    .iter()
                    .position(|rm| rm.first() == book_move)
                    .expect("book move filtered against root moves");
                root_moves.swap(0, idx);
                let _ = tx.send(format!("bestmove {}", book_move));
                return;
            }
        }

        let mut tb_cfg = self.tb_config(self.syzygy.as_ref().map_or(0, |tb| tb.max_pieces() as u32));
        if let Some(tb) = &self.syzygy {
            let mut root_pos = pos.clone();
            syzygy::rank_root_moves(tb, &mut tb_cfg, &mut root_pos, &mut root_moves);
        }

        let time = Arc::new(TimeManager::new(
            &limits,
            pos.side_to_move(),
            pos.game_ply(),
            self.config.move_overhead,
        ));

        let options = WorkerOptions {
            multi_pv: self.config.multi_pv,
            dynamic_contempt: self.config.dynamic_contempt,
            variety: self.config.variety,
            tactical: self.config.tactical,
            show_wdl: self.config.show_wdl,
            threads,
            // Exact-search mode only makes sense with a lone worker.
            full_search: self.config.tactical > 0 && threads == 1,
            use_experience: self.config.exp_book,
        };

        let tt = self.tt.clone();
        let breadcrumbs = self.breadcrumbs.clone();
        let syzygy = self.syzygy.clone();
        let experience = self.experience.clone();
        let exp_enabled = self.config.exp_book;

        let handle = std::thread::spawn(move || {
            let mut helpers: Vec<JoinHandle<Worker>> = Vec::new();
            for id in 1..threads {
                let mut worker = Worker::new(
                    id,
                    pos.clone(),
                    root_moves.clone(),
                    limits.clone(),
                    options.clone(),
                    shared.clone(),
                    tt.clone(),
                    breadcrumbs.clone(),
                    time.clone(),
                    syzygy.clone(),
                    tb_cfg,
                    if exp_enabled { Some(experience.clone()) } else { None },
                    None,
                );
                helpers.push(std::thread::spawn(move || {
                    worker.iterative_deepening();
                    worker
                }));
            }

            let mut main = Worker::new(
                0,
                pos,
                root_moves,
                limits.clone(),
                options.clone(),
                shared.clone(),
                tt.clone(),
                breadcrumbs.clone(),
                time.clone(),
                syzygy,
                tb_cfg,
                if exp_enabled { Some(experience.clone()) } else { None },
                Some(tx.clone()),
            );
            main.iterative_deepening();

            // The protocol forbids printing bestmove while pondering or in
            // an infinite search; spin until the GUI releases us.
            while !shared.stop.load(Ordering::Acquire)
                && (shared.ponder.load(Ordering::Relaxed) || limits.infinite)
            {
                std::thread::yield_now();
            }
            shared.stop.store(true, Ordering::Release);

            let mut workers: Vec<Worker> = vec![main];
            for h in helpers {
                if let Ok(w) = h.join() {
                    workers.push(w);
                }
            }

            let best = if options.multi_pv == 1
                && limits.depth.is_none()
                && options.tactical == 0
            {
                best_worker_index(&workers)
            } else {
                0
            };

            // Feed the experience store from the finished search.
            if exp_enabled
                && !experience.is_learning_paused()
                && workers[best].completed_depth >= EXP_MIN_DEPTH
            {
                let key = workers[best].pos.key();
                let best_rm = &workers[best].root_moves[0];
                experience.add_pv_experience(
                    key,
                    best_rm.first(),
                    best_rm.score,
                    workers[best].completed_depth,
                );
                for (i, w) in workers.iter().enumerate() {
                    if i != best && w.root_moves[0].first() != best_rm.first() {
                        experience.add_multipv_experience(
                            key,
                            w.root_moves[0].first(),
                            w.root_moves[0].score,
                            w.completed_depth,
                        );
                    }
                }
                let _ = experience.save();
            }

            *shared.best_previous_score.lock() = workers[best].root_moves[0].score;

            // A different worker winning the vote owes the GUI a fresh PV.
            if best != 0 {
                let line = workers[best].pv_info_string(
                    workers[best].completed_depth,
                    -VALUE_INFINITE,
                    VALUE_INFINITE,
                    1,
                );
                let _ = tx.send(line);
            }

            let best_worker = &mut workers[best];
            let best_move = best_worker.root_moves[0].first();
            let mut line = format!("bestmove {}", best_move);
            if best_worker.root_moves[0].pv.len() > 1 || best_worker.extract_ponder_from_tt() {
                line.push_str(&format!(" ponder {}", best_worker.root_moves[0].pv[1]));
            }
            let _ = tx.send(line);
        });
        *self.handle.lock() = Some(handle);
    }
}

/// Vote for the worker whose result to report: deeper searches earn more
/// votes, scores break ties, and proven mates win outright.
fn best_worker_index(workers: &[Worker]) -> usize {
    let min_score = workers
        .iter()
        .map(|w| w.root_moves[0].score)
        .min()
        .unwrap_or(0);

    let mut votes: HashMap<ChessMove, i64> = HashMap::new();
    for w in workers {
        let entry = votes.entry(w.root_moves[0].first()).or_insert(0);
        *entry += (w.root_moves[0].score - min_score + 14) as i64 * w.completed_depth as i64;
    }

    let mut best = 0;
    for (i, w) in workers.iter().enumerate().skip(1) {
        let best_score = workers[best].root_moves[0].score;
        let score = w.root_moves[0].score;
        if best_score >= VALUE_MATE_IN_MAX_PLY {
            // Keep the shortest proven mate.
            if score > best_score {
                best = i;
            }
        } else if score >= VALUE_MATE_IN_MAX_PLY
            || votes[&w.root_moves[0].first()] > votes[&workers[best].root_moves[0].first()]
        {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::worker::SharedState;

    #[test]
    fn config_defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.threads, 1);
        assert_eq!(cfg.multi_pv, 1);
        assert!(cfg.syzygy_50_move_rule);
    }

    #[test]
    fn shared_state_counts_across_workers() {
        let shared = SharedState::new(3);
        shared.nodes[0].store(10, Ordering::Relaxed);
        shared.nodes[2].store(5, Ordering::Relaxed);
        assert_eq!(shared.nodes_searched(), 15);
    }
}
