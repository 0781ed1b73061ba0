// src/book/mod.rs

pub mod experience;

use chess::{Board, ChessMove, Piece, Square};
use rand::Rng;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Polyglot-format opening book. Entries are 16 bytes, sorted by key, probed
/// with a binary search; sibling entries for the same key are gathered so a
/// non-deterministic pick can weight by entry count.
pub struct OpeningBook {
    file: Option<File>,
}

impl OpeningBook {
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let file = File::open(path).ok();
        Self { file }
    }

    pub fn is_loaded(&self) -> bool {
        self.file.is_some()
    }

    /// Probe the book. With `best_move` set the heaviest entry wins,
    /// otherwise the pick is weighted by the recorded weights.
    pub fn probe(&mut self, board: &Board, best_move: bool) -> Option<ChessMove> {
        let key = self.polyglot_key(board);
        let entries = self.entries_for(key)?;
        if entries.is_empty() {
            return None;
        }

        let raw = if best_move {
            entries.iter().max_by_key(|e| e.1).map(|e| e.0)?
        } else {
            let total: u32 = entries.iter().map(|e| e.1 as u32).sum();
            if total == 0 {
                entries[0].0
            } else {
                let mut roll = rand::thread_rng().gen_range(0..total);
                let mut chosen = entries[0].0;
                for &(mv, weight) in &entries {
                    if roll < weight as u32 {
                        chosen = mv;
                        break;
                    }
                    roll -= weight as u32;
                }
                chosen
            }
        };
        self.parse_polyglot_move(raw, board)
    }

    /// All (raw move, weight) entries recorded for `key`.
    fn entries_for(&mut self, key: u64) -> Option<Vec<(u16, u16)>> {
        let file = self.file.as_mut()?;
        let count = (file.metadata().ok()?.len() / 16) as i64;
        let mut low = 0i64;
        let mut high = count - 1;
        let mut found = None;

        while low <= high {
            let mid = (low + high) / 2;
            let entry_key = Self::read_entry(file, mid)?.0;
            if entry_key < key {
                low = mid + 1;
            } else if entry_key > key {
                high = mid - 1;
            } else {
                found = Some(mid);
                break;
            }
        }
        let hit = found?;

        // Walk to the first entry with this key, then collect the run.
        let mut first = hit;
        while first > 0 && Self::read_entry(file, first - 1)?.0 == key {
            first -= 1;
        }
        let mut entries = Vec::new();
        let mut idx = first;
        while idx < count {
            let (k, mv, weight) = Self::read_entry(file, idx)?;
            if k != key {
                break;
            }
            entries.push((mv, weight));
            idx += 1;
        }
        Some(entries)
    }

    fn read_entry(file: &mut File, index: i64) -> Option<(u64, u16, u16)> {
        file.seek(SeekFrom::Start(index as u64 * 16)).ok()?;
        let mut buf = [0u8; 16];
        file.read_exact(&mut buf).ok()?;
        let key = u64::from_be_bytes(buf[0..8].try_into().ok()?);
        let mv = u16::from_be_bytes(buf[8..10].try_into().ok()?);
        let weight = u16::from_be_bytes(buf[10..12].try_into().ok()?);
        Some((key, mv, weight))
    }

    fn parse_polyglot_move(&self, m: u16, board: &Board) -> Option<ChessMove> {
        let to_idx = (m & 0x3F) as u8;
        let from_idx = ((m >> 6) & 0x3F) as u8;
        let promo_idx = ((m >> 12) & 0x7) as u8;

        let from = unsafe {
            // SAFETY: from_idx is masked to 0-63, valid for Square
            Square::new(from_idx)
        };
        let to = unsafe {
            // SAFETY: to_idx is masked to 0-63, valid for Square
            Square::new(to_idx)
        };

        let promo = match promo_idx {
            1 => Some(Piece::Knight),
            2 => Some(Piece::Bishop),
            3 => Some(Piece::Rook),
            4 => Some(Piece::Queen),
            _ => None,
        };

        let mv = ChessMove::new(from, to, promo);
        if board.legal(mv) {
            Some(mv)
        } else {
            None
        }
    }

    fn polyglot_key(&self, board: &Board) -> u64 {
        board.get_hash()
    }
}

/// Settings for one book slot (`Book1` / `Book2`).
#[derive(Clone)]
pub struct BookSlotOptions {
    pub enabled: bool,
    pub depth: i32,
    pub best_move: bool,
    pub path: String,
}

impl Default for BookSlotOptions {
    fn default() -> BookSlotOptions {
        BookSlotOptions {
            enabled: false,
            depth: 255,
            best_move: true,
            path: String::new(),
        }
    }
}
