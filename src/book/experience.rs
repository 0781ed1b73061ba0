// src/book/experience.rs
//
// Persistent experience store: per-position chains of (move, value, depth)
// records learned from previous searches. Before a search the store can act
// as a book; during a search sufficiently deep records seed the TT and the
// quiet histories. The store is shared across workers through a concurrent
// map and written back to disk when a game ends.
//
// File format: little-endian 16-byte records
//   key:u64 | move:u16 | depth:i16 | value:i16 | pad:u16

use crate::defs::{Depth, Value};
use crate::position::Position;
use crate::search::tt::{decode_move, encode_move};
use chess::ChessMove;
use dashmap::DashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub const EXP_MIN_DEPTH: Depth = 4;
const RECORD_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpEntry {
    pub mv: ChessMove,
    pub value: Value,
    pub depth: Depth,
}

impl ExpEntry {
    /// Judge this record as a book candidate: positive scores are playable,
    /// vetoed entries never are. Deeper and better-scoring records rank
    /// higher; `eval_importance` shifts the balance toward the score.
    pub fn quality(&self, pos: &Position, eval_importance: i32) -> (i32, bool) {
        let veto = !pos.legal(self.mv);
        let w = eval_importance.clamp(0, 10);
        let score = self.depth * (10 - w) + self.value * w / 10;
        (score, veto)
    }
}

pub struct ExperienceStore {
    entries: DashMap<u64, Vec<ExpEntry>>,
    path: PathBuf,
    readonly: AtomicBool,
    dirty: AtomicBool,
    learning_paused: AtomicBool,
}

impl ExperienceStore {
    pub fn open<P: AsRef<Path>>(path: P) -> ExperienceStore {
        let store = ExperienceStore {
            entries: DashMap::new(),
            path: path.as_ref().to_path_buf(),
            readonly: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            learning_paused: AtomicBool::new(false),
        };
        store.load();
        store
    }

    fn load(&self) {
        let Ok(bytes) = fs::read(&self.path) else {
            return;
        };
        for rec in bytes.chunks_exact(RECORD_SIZE) {
            let key = u64::from_le_bytes(rec[0..8].try_into().expect("record layout"));
            let mv16 = u16::from_le_bytes(rec[8..10].try_into().expect("record layout"));
            let depth = i16::from_le_bytes(rec[10..12].try_into().expect("record layout"));
            let value = i16::from_le_bytes(rec[12..14].try_into().expect("record layout"));
            let Some(mv) = decode_move(mv16) else {
                continue;
            };
            self.insert(
                key,
                ExpEntry {
                    mv,
                    value: value as Value,
                    depth: depth as Depth,
                },
            );
        }
        self.dirty.store(false, Ordering::Relaxed);
    }

    pub fn set_readonly(&self, readonly: bool) {
        self.readonly.store(readonly, Ordering::Relaxed);
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly.load(Ordering::Relaxed)
    }

    pub fn pause_learning(&self) {
        self.learning_paused.store(true, Ordering::Relaxed);
    }

    pub fn resume_learning(&self) {
        self.learning_paused.store(false, Ordering::Relaxed);
    }

    pub fn is_learning_paused(&self) -> bool {
        self.learning_paused.load(Ordering::Relaxed)
    }

    /// All records for a position key, deepest first.
    pub fn probe(&self, key: u64) -> Option<Vec<ExpEntry>> {
        let chain = self.entries.get(&key)?;
        let mut out = chain.clone();
        out.sort_by(|a, b| b.depth.cmp(&a.depth));
        Some(out)
    }

    fn insert(&self, key: u64, entry: ExpEntry) {
        let mut chain = self.entries.entry(key).or_default();
        match chain.iter_mut().find(|e| e.mv == entry.mv) {
            // Keep the deepest record per move.
            Some(existing) => {
                if entry.depth >= existing.depth {
                    *existing = entry;
                }
            }
            None => chain.push(entry),
        }
    }

    /// Record the principal variation result of a finished search.
    pub fn add_pv_experience(&self, key: u64, mv: ChessMove, value: Value, depth: Depth) {
        if self.is_readonly() || self.is_learning_paused() || depth < EXP_MIN_DEPTH {
            return;
        }
        self.insert(key, ExpEntry { mv, value, depth });
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Record a non-best root line (from MultiPV or helper workers).
    pub fn add_multipv_experience(&self, key: u64, mv: ChessMove, value: Value, depth: Depth) {
        self.add_pv_experience(key, mv, value, depth);
    }

    /// Flush to disk if anything changed since the last save.
    pub fn save(&self) -> anyhow::Result<()> {
        if self.is_readonly() || !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let mut out = Vec::with_capacity(self.entries.len() * RECORD_SIZE);
        for item in self.entries.iter() {
            for e in item.value() {
                out.extend_from_slice(&item.key().to_le_bytes());
                out.extend_from_slice(&encode_move(e.mv).to_le_bytes());
                out.extend_from_slice(&(e.depth as i16).to_le_bytes());
                out.extend_from_slice(&(e.value as i16).to_le_bytes());
                out.extend_from_slice(&[0u8; 2]);
            }
        }
        let mut file = fs::File::create(&self.path)?;
        file.write_all(&out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vireo_exp_test_{}.bin", tag))
    }

    #[test]
    fn probe_returns_deepest_first() {
        let store = ExperienceStore::open(temp_path("order"));
        let a = ChessMove::from_str("e2e4").unwrap();
        let b = ChessMove::from_str("d2d4").unwrap();
        store.add_pv_experience(99, a, 30, 8);
        store.add_pv_experience(99, b, 10, 12);
        let chain = store.probe(99).unwrap();
        assert_eq!(chain[0].mv, b);
        assert_eq!(chain[1].mv, a);
        let _ = fs::remove_file(temp_path("order"));
    }

    #[test]
    fn shallow_records_are_ignored() {
        let store = ExperienceStore::open(temp_path("shallow"));
        let m = ChessMove::from_str("e2e4").unwrap();
        store.add_pv_experience(7, m, 30, EXP_MIN_DEPTH - 1);
        assert!(store.probe(7).is_none());
        let _ = fs::remove_file(temp_path("shallow"));
    }

    #[test]
    fn deeper_record_replaces_same_move() {
        let store = ExperienceStore::open(temp_path("replace"));
        let m = ChessMove::from_str("g1f3").unwrap();
        store.add_pv_experience(5, m, 10, 6);
        store.add_pv_experience(5, m, 42, 10);
        let chain = store.probe(5).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].value, 42);
        assert_eq!(chain[0].depth, 10);
        let _ = fs::remove_file(temp_path("replace"));
    }

    #[test]
    fn save_and_reload_round_trip() {
        let path = temp_path("roundtrip");
        {
            let store = ExperienceStore::open(&path);
            let m = ChessMove::from_str("e7e8q").unwrap();
            store.add_pv_experience(123456, m, -250, 9);
            store.save().unwrap();
        }
        let store = ExperienceStore::open(&path);
        let chain = store.probe(123456).unwrap();
        assert_eq!(chain[0].mv, ChessMove::from_str("e7e8q").unwrap());
        assert_eq!(chain[0].value, -250);
        assert_eq!(chain[0].depth, 9);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn readonly_blocks_learning_and_saving() {
        let path = temp_path("readonly");
        let store = ExperienceStore::open(&path);
        store.set_readonly(true);
        store.add_pv_experience(1, ChessMove::from_str("e2e4").unwrap(), 0, 10);
        assert!(store.probe(1).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn quality_vetoes_illegal_moves() {
        let store = ExperienceStore::open(temp_path("quality"));
        let pos = Position::startpos();
        let legal = ExpEntry {
            mv: ChessMove::from_str("e2e4").unwrap(),
            value: 20,
            depth: 10,
        };
        let illegal = ExpEntry {
            mv: ChessMove::from_str("e2e5").unwrap(),
            value: 20,
            depth: 10,
        };
        assert!(!legal.quality(&pos, 5).1);
        assert!(illegal.quality(&pos, 5).1);
        let _ = fs::remove_file(temp_path("quality"));
    }
}
