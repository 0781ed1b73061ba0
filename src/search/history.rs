// src/search/history.rs
//
// Per-worker move-ordering statistics: butterfly (main) history, capture
// history, continuation history, low-ply history and counter moves. Killers
// live in the search stack. Every counter is updated with the gravity
// formula `x += bonus - x*|bonus|/range`, which saturates inside the signed
// range without explicit clamping.

use crate::position::{from_to, PIECE_NB, SQUARE_NB};
use chess::{ChessMove, Color};

pub const MAIN_HISTORY_RANGE: i32 = 13365;
pub const LOW_PLY_RANGE: i32 = 10692;
pub const CAPTURE_RANGE: i32 = 10692;
pub const CONTINUATION_RANGE: i32 = 29952;

/// Plies near the root covered by the low-ply history.
pub const MAX_LPH: usize = 4;

pub const COUNTER_MOVE_PRUNE_THRESHOLD: i32 = 0;

#[inline]
fn gravity(entry: &mut i16, bonus: i32, range: i32) {
    let b = bonus.clamp(-range, range);
    let v = *entry as i32 + b - (*entry as i32) * b.abs() / range;
    *entry = v as i16;
}

/// Main history, indexed by side and from-to.
pub struct ButterflyHistory {
    table: Box<[[i16; SQUARE_NB * SQUARE_NB]; 2]>,
}

impl ButterflyHistory {
    pub fn new() -> ButterflyHistory {
        ButterflyHistory {
            table: Box::new([[0; SQUARE_NB * SQUARE_NB]; 2]),
        }
    }

    pub fn clear(&mut self) {
        for side in self.table.iter_mut() {
            side.fill(0);
        }
    }

    #[inline]
    pub fn get(&self, color: Color, m: ChessMove) -> i32 {
        self.table[color.to_index()][from_to(m)] as i32
    }

    #[inline]
    pub fn update(&mut self, color: Color, m: ChessMove, bonus: i32) {
        gravity(
            &mut self.table[color.to_index()][from_to(m)],
            bonus,
            MAIN_HISTORY_RANGE,
        );
    }
}

/// History for captures, indexed by (moving piece, to-square, captured type).
pub struct CaptureHistory {
    table: Box<[[[i16; 6]; SQUARE_NB]; PIECE_NB]>,
}

impl CaptureHistory {
    pub fn new() -> CaptureHistory {
        CaptureHistory {
            table: Box::new([[[0; 6]; SQUARE_NB]; PIECE_NB]),
        }
    }

    pub fn clear(&mut self) {
        for piece in self.table.iter_mut() {
            for sq in piece.iter_mut() {
                sq.fill(0);
            }
        }
    }

    #[inline]
    pub fn get(&self, piece: usize, to: usize, captured: usize) -> i32 {
        self.table[piece][to][captured] as i32
    }

    #[inline]
    pub fn update(&mut self, piece: usize, to: usize, captured: usize, bonus: i32) {
        gravity(&mut self.table[piece][to][captured], bonus, CAPTURE_RANGE);
    }
}

/// Continuation history: one (piece, to) table per previous (piece, to)
/// pair, kept in a flat arena so stack frames can carry a plain index.
/// The final table is a write-tolerant sentinel for frames with no move.
pub struct ContinuationHistory {
    tables: Vec<[i16; PIECE_NB * SQUARE_NB]>,
}

impl ContinuationHistory {
    pub fn new() -> ContinuationHistory {
        ContinuationHistory {
            tables: vec![[0; PIECE_NB * SQUARE_NB]; PIECE_NB * SQUARE_NB + 1],
        }
    }

    pub fn clear(&mut self) {
        for t in self.tables.iter_mut() {
            t.fill(0);
        }
    }

    /// Arena index of the table keyed by the move (piece, to).
    #[inline]
    pub fn index(&self, piece: usize, to: usize) -> usize {
        piece * SQUARE_NB + to
    }

    #[inline]
    pub fn sentinel(&self) -> usize {
        PIECE_NB * SQUARE_NB
    }

    #[inline]
    pub fn get(&self, table: usize, piece: usize, to: usize) -> i32 {
        self.tables[table][piece * SQUARE_NB + to] as i32
    }

    #[inline]
    pub fn update(&mut self, table: usize, piece: usize, to: usize, bonus: i32) {
        gravity(
            &mut self.tables[table][piece * SQUARE_NB + to],
            bonus,
            CONTINUATION_RANGE,
        );
    }
}

/// From-to history for the first few plies from the root; seeds ordering
/// before the deeper tables warm up.
pub struct LowPlyHistory {
    table: Box<[[i16; SQUARE_NB * SQUARE_NB]; MAX_LPH]>,
}

impl LowPlyHistory {
    pub fn new() -> LowPlyHistory {
        LowPlyHistory {
            table: Box::new([[0; SQUARE_NB * SQUARE_NB]; MAX_LPH]),
        }
    }

    pub fn clear(&mut self) {
        for row in self.table.iter_mut() {
            row.fill(0);
        }
    }

    /// Iteration aging: row i becomes row i-2, the top rows are zeroed.
    pub fn shift(&mut self) {
        for i in 0..MAX_LPH - 2 {
            self.table[i] = self.table[i + 2];
        }
        for i in MAX_LPH - 2..MAX_LPH {
            self.table[i].fill(0);
        }
    }

    #[inline]
    pub fn get(&self, ply: usize, m: ChessMove) -> i32 {
        self.table[ply][from_to(m)] as i32
    }

    #[inline]
    pub fn update(&mut self, ply: usize, m: ChessMove, bonus: i32) {
        gravity(&mut self.table[ply][from_to(m)], bonus, LOW_PLY_RANGE);
    }
}

/// Refutation move per (previous piece, previous to-square).
pub struct CounterMoveHistory {
    table: Box<[[Option<ChessMove>; SQUARE_NB]; PIECE_NB]>,
}

impl CounterMoveHistory {
    pub fn new() -> CounterMoveHistory {
        CounterMoveHistory {
            table: Box::new([[None; SQUARE_NB]; PIECE_NB]),
        }
    }

    pub fn clear(&mut self) {
        for row in self.table.iter_mut() {
            row.fill(None);
        }
    }

    #[inline]
    pub fn get(&self, piece: usize, to: usize) -> Option<ChessMove> {
        self.table[piece][to]
    }

    #[inline]
    pub fn set(&mut self, piece: usize, to: usize, m: ChessMove) {
        self.table[piece][to] = Some(m);
    }
}

/// All of one worker's private move-ordering state.
pub struct Histories {
    pub main: ButterflyHistory,
    pub capture: CaptureHistory,
    pub continuation: ContinuationHistory,
    pub low_ply: LowPlyHistory,
    pub counter_moves: CounterMoveHistory,
}

impl Histories {
    pub fn new() -> Histories {
        Histories {
            main: ButterflyHistory::new(),
            capture: CaptureHistory::new(),
            continuation: ContinuationHistory::new(),
            low_ply: LowPlyHistory::new(),
            counter_moves: CounterMoveHistory::new(),
        }
    }

    pub fn clear(&mut self) {
        self.main.clear();
        self.capture.clear();
        self.continuation.clear();
        self.low_ply.clear();
        self.counter_moves.clear();
    }
}

impl Default for Histories {
    fn default() -> Histories {
        Histories::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn gravity_saturates_within_range() {
        let mut h = ButterflyHistory::new();
        let m = ChessMove::from_str("e2e4").unwrap();
        for _ in 0..1000 {
            h.update(Color::White, m, MAIN_HISTORY_RANGE);
        }
        assert!(h.get(Color::White, m) <= MAIN_HISTORY_RANGE);
        for _ in 0..2000 {
            h.update(Color::White, m, -MAIN_HISTORY_RANGE);
        }
        assert!(h.get(Color::White, m) >= -MAIN_HISTORY_RANGE);
    }

    #[test]
    fn gravity_is_monotone_toward_bonus() {
        let mut h = CaptureHistory::new();
        h.update(0, 10, 1, 500);
        let once = h.get(0, 10, 1);
        h.update(0, 10, 1, 500);
        let twice = h.get(0, 10, 1);
        assert!(once > 0 && twice > once);
    }

    #[test]
    fn continuation_sentinel_is_isolated() {
        let mut c = ContinuationHistory::new();
        let sentinel = c.sentinel();
        c.update(sentinel, 3, 20, 1000);
        // Real tables are untouched by sentinel writes.
        assert_eq!(c.get(c.index(3, 20), 3, 20), 0);
        assert!(c.get(sentinel, 3, 20) > 0);
    }

    #[test]
    fn low_ply_shift_moves_rows_down() {
        let mut l = LowPlyHistory::new();
        let m = ChessMove::from_str("d2d4").unwrap();
        l.update(2, m, 800);
        let v = l.get(2, m);
        assert!(v > 0);
        l.shift();
        assert_eq!(l.get(0, m), v);
        assert_eq!(l.get(2, m), 0);
    }

    #[test]
    fn counter_move_round_trip() {
        let mut cm = CounterMoveHistory::new();
        let m = ChessMove::from_str("g8f6").unwrap();
        assert_eq!(cm.get(4, 28), None);
        cm.set(4, 28, m);
        assert_eq!(cm.get(4, 28), Some(m));
    }
}
