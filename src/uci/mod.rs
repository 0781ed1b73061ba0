// src/uci/mod.rs
//
// Text-protocol front end: option registry, command dispatch, and score
// formatting. Search output flows through an mpsc channel to a dedicated
// printer thread so workers never block on stdout.

use crate::defs::{
    Value, PAWN_VALUE_EG, VALUE_MATE, VALUE_MATE_IN_MAX_PLY, VALUE_MATED_IN_MAX_PLY,
};
use crate::book::experience::ExperienceStore;
use crate::position::Position;
use crate::search::lazy_smp::Searcher;
use crate::search::tt::TranspositionTable;
use crate::search::SearchLimits;
use chess::{ChessMove, Color};
use std::io::{self, BufRead};
use std::str::FromStr;
use std::sync::{mpsc, Arc};
use std::time::Instant;

/// Centipawn/mate score in protocol form, normalized to pawn = 100.
pub fn value_string(v: Value) -> String {
    if v >= VALUE_MATE_IN_MAX_PLY {
        format!("mate {}", (VALUE_MATE - v + 1) / 2)
    } else if v <= VALUE_MATED_IN_MAX_PLY {
        format!("mate {}", -(VALUE_MATE + v) / 2)
    } else {
        format!("cp {}", v * 100 / PAWN_VALUE_EG)
    }
}

// Coefficients fitted against self-play at various material/ply mixes.
fn win_rate_model(v: Value, ply: i32) -> i32 {
    let m = ((ply as f64) / 2.0 + 1.0).min(240.0) / 64.0;
    let a_coeffs = [-8.244_042_95, 64.238_923_42, -95.730_564_62, 153.864_786_79];
    let b_coeffs = [-3.371_543_71, 28.444_891_98, -56.676_577_41, 72.058_588_36];
    let a = ((a_coeffs[0] * m + a_coeffs[1]) * m + a_coeffs[2]) * m + a_coeffs[3];
    let b = ((b_coeffs[0] * m + b_coeffs[1]) * m + b_coeffs[2]) * m + b_coeffs[3];
    let x = f64::from(v.clamp(-1000, 1000));
    (0.5 + 1000.0 / (1.0 + ((a - x) / b).exp())) as i32
}

/// ` wdl W D L` suffix for info lines.
pub fn wdl_string(v: Value, game_ply: i32) -> String {
    let wdl_w = win_rate_model(v, game_ply);
    let wdl_l = win_rate_model(-v, game_ply);
    let wdl_d = 1000 - wdl_w - wdl_l;
    format!(" wdl {} {} {}", wdl_w, wdl_d, wdl_l)
}

pub struct UciHandler {
    searcher: Searcher,
    pos: Position,
    tx: mpsc::Sender<String>,
}

impl UciHandler {
    pub fn new() -> anyhow::Result<Self> {
        let tt = Arc::new(TranspositionTable::new(64));
        let experience = Arc::new(ExperienceStore::open("experience.bin"));
        let searcher = Searcher::new(tt, experience);
        let (tx, rx) = mpsc::channel::<String>();

        std::thread::spawn(move || {
            while let Ok(msg) = rx.recv() {
                println!("{}", msg);
            }
        });

        Ok(Self {
            searcher,
            pos: Position::startpos(),
            tx,
        })
    }

    pub fn run(&mut self) {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(cmd) = line else { break };
            let cmd = cmd.trim();
            if cmd.is_empty() {
                continue;
            }
            if !self.handle_command(cmd) {
                break;
            }
        }
        self.searcher.stop();
        self.searcher.wait_for_search_finished();
        let _ = self.searcher.experience.save();
    }

    /// Returns false when the session should end.
    fn handle_command(&mut self, command: &str) -> bool {
        let parts: Vec<&str> = command.split_whitespace().collect();
        match parts.first().copied() {
            Some("uci") => {
                println!("id name Vireo 0.1");
                println!("id author Vireo team");
                println!("option name Hash type spin default 64 min 1 max 65536");
                println!("option name Threads type spin default 1 min 1 max 256");
                println!("option name MultiPV type spin default 1 min 1 max 500");
                println!("option name Move Overhead type spin default 30 min 0 max 5000");
                println!("option name Ponder type check default false");
                println!("option name Dynamic Contempt type spin default 12 min -128 max 127");
                println!("option name NeverClearHash type check default false");
                println!("option name Variety type spin default 0 min 0 max 40");
                println!("option name multiPV Search type spin default 0 min 0 max 8");
                println!("option name UCI_ShowWDL type check default false");
                println!("option name SyzygyPath type string default <empty>");
                println!("option name SyzygyProbeDepth type spin default 1 min 1 max 100");
                println!("option name SyzygyProbeLimit type spin default 7 min 0 max 7");
                println!("option name Syzygy50MoveRule type check default true");
                println!("option name Book1 type check default false");
                println!("option name Book1 File type string default <empty>");
                println!("option name Book1 Depth type spin default 255 min 1 max 350");
                println!("option name Book1 BestBookMove type check default true");
                println!("option name Book2 type check default false");
                println!("option name Book2 File type string default <empty>");
                println!("option name Book2 Depth type spin default 255 min 1 max 350");
                println!("option name Experience Book type check default false");
                println!("option name Experience Book Max Moves type spin default 16 min 1 max 100");
                println!("option name Experience Book Min Depth type spin default 4 min 1 max 255");
                println!(
                    "option name Experience Book Eval Importance type spin default 5 min 0 max 10"
                );
                println!("option name Experience Book Best Move type check default true");
                println!("option name Experience Readonly type check default false");
                println!("uciok");
                true
            }
            Some("isready") => {
                println!("readyok");
                true
            }
            Some("ucinewgame") => {
                self.pos = Position::startpos();
                self.searcher.new_game();
                true
            }
            Some("setoption") => {
                self.handle_setoption(&parts[1..]);
                true
            }
            Some("position") => {
                self.handle_position(&parts[1..]);
                true
            }
            Some("go") => {
                self.handle_go(&parts[1..]);
                true
            }
            Some("stop") => {
                self.searcher.stop();
                true
            }
            Some("ponderhit") => {
                self.searcher.ponderhit();
                true
            }
            Some("quit") => false,
            _ => true,
        }
    }

    fn handle_setoption(&mut self, parts: &[&str]) {
        let Some(value_idx) = parts.iter().position(|&p| p == "value") else {
            return;
        };
        if parts.first() != Some(&"name") || value_idx + 1 > parts.len() {
            return;
        }
        let name = parts[1..value_idx].join(" ").to_lowercase();
        let value = parts[(value_idx + 1)..].join(" ");
        let cfg = &mut self.searcher.config;

        // Invalid values are clamped or ignored, never fatal.
        match name.as_str() {
            "hash" => {
                if let Ok(mb) = value.parse::<usize>() {
                    self.searcher.resize_tt(mb.clamp(1, 65536));
                }
            }
            "threads" => {
                if let Ok(n) = value.parse::<usize>() {
                    cfg.threads = n.clamp(1, 256);
                }
            }
            "multipv" => {
                if let Ok(n) = value.parse::<usize>() {
                    cfg.multi_pv = n.clamp(1, 500);
                }
            }
            "move overhead" => {
                if let Ok(ov) = value.parse::<i64>() {
                    cfg.move_overhead = ov.clamp(0, 5000);
                }
            }
            "ponder" => {}
            "dynamic contempt" => {
                if let Ok(dc) = value.parse::<i32>() {
                    cfg.dynamic_contempt = dc.clamp(-128, 127);
                }
            }
            "neverclearhash" => cfg.never_clear_hash = value == "true",
            "variety" => {
                if let Ok(v) = value.parse::<i32>() {
                    cfg.variety = v.clamp(0, 40);
                }
            }
            "multipv search" => {
                if let Ok(k) = value.parse::<u32>() {
                    cfg.tactical = k.min(8);
                }
            }
            "uci_showwdl" => cfg.show_wdl = value == "true",
            "syzygypath" => {
                if !value.is_empty() && value != "<empty>" {
                    self.searcher.set_syzygy_path(&value);
                }
            }
            "syzygyprobedepth" => {
                if let Ok(d) = value.parse::<i32>() {
                    cfg.syzygy_probe_depth = d.clamp(1, 100);
                }
            }
            "syzygyprobelimit" => {
                if let Ok(l) = value.parse::<u32>() {
                    cfg.syzygy_probe_limit = l.min(7);
                }
            }
            "syzygy50moverule" => cfg.syzygy_50_move_rule = value == "true",
            "book1" => cfg.book1.enabled = value == "true",
            "book1 file" => {
                cfg.book1.path = value.clone();
                self.searcher.load_book(0, &value);
            }
            "book1 depth" => {
                if let Ok(d) = value.parse::<i32>() {
                    cfg.book1.depth = d.clamp(1, 350);
                }
            }
            "book1 bestbookmove" => cfg.book1.best_move = value == "true",
            "book2" => cfg.book2.enabled = value == "true",
            "book2 file" => {
                cfg.book2.path = value.clone();
                self.searcher.load_book(1, &value);
            }
            "book2 depth" => {
                if let Ok(d) = value.parse::<i32>() {
                    cfg.book2.depth = d.clamp(1, 350);
                }
            }
            "experience book" => cfg.exp_book = value == "true",
            "experience book max moves" => {
                if let Ok(n) = value.parse::<i32>() {
                    cfg.exp_book_max_moves = n.clamp(1, 100);
                }
            }
            "experience book min depth" => {
                if let Ok(d) = value.parse::<i32>() {
                    cfg.exp_book_min_depth = d.clamp(1, 255);
                }
            }
            "experience book eval importance" => {
                if let Ok(w) = value.parse::<i32>() {
                    cfg.exp_book_eval_importance = w.clamp(0, 10);
                }
            }
            "experience book best move" => cfg.exp_book_best_move = value == "true",
            "experience readonly" => {
                cfg.exp_readonly = value == "true";
                self.searcher.experience.set_readonly(cfg.exp_readonly);
            }
            _ => {}
        }
    }

    fn handle_position(&mut self, parts: &[&str]) {
        let mut i = 0;
        if parts.first() == Some(&"startpos") {
            self.pos = Position::startpos();
            i = 1;
        } else if parts.first() == Some(&"fen") {
            let mut fen_parts = Vec::new();
            i = 1;
            while i < parts.len() && parts[i] != "moves" {
                fen_parts.push(parts[i]);
                i += 1;
            }
            match Position::from_fen(&fen_parts.join(" ")) {
                Ok(pos) => self.pos = pos,
                Err(_) => return,
            }
        }

        if parts.get(i) == Some(&"moves") {
            for token in &parts[(i + 1)..] {
                let Ok(m) = ChessMove::from_str(token) else {
                    break;
                };
                if !self.pos.legal(m) {
                    break;
                }
                self.pos.do_move(m);
            }
        }
    }

    fn handle_go(&mut self, parts: &[&str]) {
        let mut limits = SearchLimits {
            start_time: Instant::now(),
            ..SearchLimits::default()
        };

        let mut i = 0;
        while i < parts.len() {
            let arg = |idx: usize| parts.get(idx + 1).and_then(|s| s.parse::<i64>().ok());
            match parts[i] {
                "wtime" => {
                    limits.time[Color::White.to_index()] = arg(i).unwrap_or(0);
                    i += 1;
                }
                "btime" => {
                    limits.time[Color::Black.to_index()] = arg(i).unwrap_or(0);
                    i += 1;
                }
                "winc" => {
                    limits.inc[Color::White.to_index()] = arg(i).unwrap_or(0);
                    i += 1;
                }
                "binc" => {
                    limits.inc[Color::Black.to_index()] = arg(i).unwrap_or(0);
                    i += 1;
                }
                "movestogo" => {
                    limits.movestogo = arg(i).unwrap_or(0) as i32;
                    i += 1;
                }
                "depth" => {
                    limits.depth = arg(i).map(|d| d as i32);
                    i += 1;
                }
                "nodes" => {
                    limits.nodes = arg(i).map(|n| n as u64);
                    i += 1;
                }
                "movetime" => {
                    limits.movetime = arg(i);
                    i += 1;
                }
                "mate" => {
                    limits.mate = arg(i).map(|m| m as i32);
                    i += 1;
                }
                "perft" => {
                    limits.perft = arg(i).map(|d| d as i32);
                    i += 1;
                }
                "infinite" => limits.infinite = true,
                "ponder" => limits.ponder = true,
                "searchmoves" => {
                    for token in &parts[(i + 1)..] {
                        let Ok(m) = ChessMove::from_str(token) else {
                            break;
                        };
                        limits.searchmoves.push(m);
                        i += 1;
                    }
                }
                _ => {}
            }
            i += 1;
        }

        if let Some(depth) = limits.perft {
            self.run_perft(depth.max(1));
            return;
        }

        self.searcher
            .start_search(self.pos.clone(), limits, self.tx.clone());
    }

    fn run_perft(&mut self, depth: i32) {
        let start = Instant::now();
        let mut total = 0u64;
        for m in self.pos.legal_moves() {
            self.pos.do_move(m);
            let cnt = if depth > 1 { self.pos.perft(depth - 1) } else { 1 };
            self.pos.undo_move();
            println!("{}: {}", m, cnt);
            total += cnt;
        }
        let elapsed = start.elapsed().as_millis().max(1);
        println!();
        println!(
            "Nodes searched: {} ({} nps)",
            total,
            total as u128 * 1000 / elapsed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::{mate_in, mated_in};

    #[test]
    fn score_strings_for_cp_and_mate() {
        assert_eq!(value_string(0), "cp 0");
        assert_eq!(value_string(PAWN_VALUE_EG), "cp 100");
        assert_eq!(value_string(mate_in(1)), "mate 1");
        assert_eq!(value_string(mate_in(4)), "mate 2");
        assert_eq!(value_string(mated_in(2)), "mate -1");
    }

    #[test]
    fn wdl_components_sum_to_1000() {
        for v in [-800, -120, 0, 35, 400] {
            for ply in [0, 20, 80, 200] {
                let s = wdl_string(v, ply);
                let nums: Vec<i32> = s
                    .split_whitespace()
                    .skip(1)
                    .map(|t| t.parse().unwrap())
                    .collect();
                assert_eq!(nums.len(), 3);
                assert_eq!(nums.iter().sum::<i32>(), 1000);
            }
        }
        // A winning score should show a winning distribution.
        let s = wdl_string(500, 30);
        let nums: Vec<i32> = s.split_whitespace().skip(1).map(|t| t.parse().unwrap()).collect();
        assert!(nums[0] > nums[2]);
    }
}
