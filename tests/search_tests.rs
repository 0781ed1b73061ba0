// Search-level scenario tests: end-to-end behavior of the coordinator and
// the worker on small, fully determined positions.

use std::str::FromStr;
use std::sync::mpsc;
use std::time::Duration;

use chess::ChessMove;
use vireo::book::experience::ExperienceStore;
use vireo::defs::*;
use vireo::position::Position;
use vireo::search::lazy_smp::Searcher;
use vireo::search::tt::TranspositionTable;
use vireo::search::SearchLimits;
use std::sync::Arc;

fn make_searcher() -> Searcher {
    let tt = Arc::new(TranspositionTable::new(8));
    let exp = Arc::new(ExperienceStore::open(
        std::env::temp_dir().join("vireo_search_tests_exp.bin"),
    ));
    exp.set_readonly(true);
    Searcher::new(tt, exp)
}

fn collect_output(rx: &mpsc::Receiver<String>, until_bestmove: bool) -> Vec<String> {
    let mut lines = Vec::new();
    loop {
        match rx.recv_timeout(Duration::from_secs(30)) {
            Ok(line) => {
                let done = until_bestmove && line.starts_with("bestmove");
                lines.push(line);
                if done {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    lines
}

#[test]
fn mate_in_one_is_found_and_reported() {
    let mut searcher = make_searcher();
    let pos = Position::from_fen("6k1/5ppp/8/8/8/8/5PPP/R5K1 w - - 0 1").unwrap();
    let limits = SearchLimits {
        depth: Some(4),
        ..SearchLimits::default()
    };
    let (tx, rx) = mpsc::channel();
    searcher.start_search(pos, limits, tx);
    let lines = collect_output(&rx, true);
    searcher.wait_for_search_finished();

    let bestmove = lines.last().expect("search must emit bestmove");
    assert!(bestmove.starts_with("bestmove a1a8"), "got: {}", bestmove);
    assert!(
        lines.iter().any(|l| l.contains("score mate 1")),
        "expected a mate 1 info line, got: {:?}",
        lines
    );
}

#[test]
fn stalemate_root_reports_depth_zero_and_no_bestmove() {
    let mut searcher = make_searcher();
    let pos = Position::from_fen("7k/5Q2/6K1/8/8/8/8/8 b - - 0 1").unwrap();
    let (tx, rx) = mpsc::channel();
    searcher.start_search(pos, SearchLimits::default(), tx);
    searcher.wait_for_search_finished();

    let lines = collect_output(&rx, false);
    assert_eq!(lines, vec!["info depth 0 score cp 0".to_string()]);
}

#[test]
fn checkmated_root_reports_mate_zero() {
    let mut searcher = make_searcher();
    // Back-rank mate already delivered; side to move is mated.
    let pos = Position::from_fen("R5k1/5ppp/8/8/8/8/5PPP/6K1 b - - 0 1").unwrap();
    let (tx, rx) = mpsc::channel();
    searcher.start_search(pos, SearchLimits::default(), tx);
    searcher.wait_for_search_finished();

    let lines = collect_output(&rx, false);
    assert_eq!(lines, vec!["info depth 0 score mate 0".to_string()]);
}

#[test]
fn perft_five_from_startpos_matches_published_value() {
    let mut pos = Position::startpos();
    assert_eq!(pos.perft(5), 4_865_609);
}

#[test]
fn repetition_line_scores_draw_at_depth_six() {
    // 1.Nf3 Nf6 2.Ng1 Ng8 3.Nf3 Nf6 4.Ng1 and Black's Ng8 now repeats the
    // start position for the third time.
    let mut pos = Position::startpos();
    for uci in ["g1f3", "g8f6", "f3g1", "f6g8", "g1f3", "g8f6", "f3g1"] {
        pos.do_move(ChessMove::from_str(uci).unwrap());
    }

    let mut searcher = make_searcher();
    let limits = SearchLimits {
        depth: Some(6),
        searchmoves: vec![ChessMove::from_str("f6g8").unwrap()],
        ..SearchLimits::default()
    };
    let (tx, rx) = mpsc::channel();
    searcher.start_search(pos.clone(), limits, tx);
    let lines = collect_output(&rx, true);
    searcher.wait_for_search_finished();

    let deepest_score = lines
        .iter()
        .rev()
        .find(|l| l.contains(" score "))
        .expect("search must emit scored info lines");
    assert!(
        deepest_score.contains("score cp 0"),
        "repetition line should score as a draw, got: {}",
        deepest_score
    );

    // And the position after the repetition move is a draw outright.
    pos.do_move(ChessMove::from_str("f6g8").unwrap());
    assert!(pos.is_draw(1));
}

#[test]
fn aspiration_widening_is_bounded() {
    // The window growth schedule delta += delta/4 + 5 reaches the full
    // score range in O(log) steps, bounding re-searches per depth.
    let mut delta: i64 = 17;
    let mut steps = 0;
    while delta < VALUE_INFINITE as i64 {
        delta += delta / 4 + 5;
        steps += 1;
        assert!(steps < 40, "window widening must terminate quickly");
    }
    let bound = 1.0 + ((VALUE_INFINITE as f64) / 17.0).ln() / (1.25f64).ln();
    assert!((steps as f64) <= bound);
}

#[test]
fn tt_mate_scores_clamp_under_fifty_move_pressure() {
    let tt = TranspositionTable::new(1);
    let key = 0xABCD_EF01_2345_6789;
    let (_, slot) = tt.probe(key);
    // A mate-in-10 found at ply 5, stored node-relative.
    tt.save(
        slot,
        key,
        value_to_tt(VALUE_MATE - 10, 5),
        false,
        Bound::Exact,
        12,
        None,
        0,
    );
    let (hit, _) = tt.probe(key);
    let stored = hit.expect("entry must round-trip").value;
    // Fresh halfmove clock: the mate distance survives.
    assert_eq!(value_from_tt(stored, 5, 0), VALUE_MATE - 10);
    // With 95 clock plies burned the mate cannot be delivered in time.
    assert_eq!(value_from_tt(stored, 5, 95), VALUE_MATE_IN_MAX_PLY - 1);
}

#[test]
fn deterministic_best_move_with_single_worker_and_no_variety() {
    let fen = "r1bqk2r/pppp1ppp/2n2n2/2b1p3/2B1P3/2PP1N2/PP3PPP/RNBQK2R w KQkq - 0 6";
    let limits = SearchLimits {
        depth: Some(6),
        ..SearchLimits::default()
    };

    let mut results = Vec::new();
    for _ in 0..2 {
        let mut searcher = make_searcher();
        let pos = Position::from_fen(fen).unwrap();
        let (tx, rx) = mpsc::channel();
        searcher.start_search(pos, limits.clone(), tx);
        let lines = collect_output(&rx, true);
        searcher.wait_for_search_finished();
        results.push(lines.last().expect("bestmove required").clone());
    }
    assert_eq!(results[0], results[1]);
}

#[test]
fn reported_pv_is_a_legal_move_sequence() {
    let mut searcher = make_searcher();
    let fen = "r2qkbnr/ppp2ppp/2np4/4p3/2B1P1b1/2N2N2/PPPP1PPP/R1BQK2R w KQkq - 4 5";
    let pos = Position::from_fen(fen).unwrap();
    let limits = SearchLimits {
        depth: Some(6),
        ..SearchLimits::default()
    };
    let (tx, rx) = mpsc::channel();
    searcher.start_search(pos, limits, tx);
    let lines = collect_output(&rx, true);
    searcher.wait_for_search_finished();

    let pv_line = lines
        .iter()
        .rev()
        .find(|l| l.contains(" pv "))
        .expect("expected a pv info line");
    let moves: Vec<&str> = pv_line
        .split(" pv ")
        .nth(1)
        .unwrap()
        .split_whitespace()
        .collect();
    assert!(!moves.is_empty());

    let mut replay = Position::from_fen(fen).unwrap();
    for token in moves {
        let m = ChessMove::from_str(token).expect("pv move must parse");
        assert!(replay.legal(m), "pv move {} must be legal", token);
        replay.do_move(m);
    }
}
