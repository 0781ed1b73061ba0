// src/search/tt.rs
//
// Shared lock-free transposition table. Entries are packed into two atomic
// words per slot, three slots per 64-byte cluster. Readers snapshot both
// words and re-validate the key tag on each; a torn or raced read shows up
// as a tag mismatch and is treated as a miss. Writers use plain relaxed
// stores; the search treats the table strictly as a hint and re-verifies
// every move it gets from here.
//
// Word 0: key32 | move16 | value16
// Word 1: key32 | eval16 | depth8 | gen5+pv1+bound2

use crate::defs::{Bound, Depth, Value, DEPTH_OFFSET};
use chess::{ChessMove, Piece, Square};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

pub const CLUSTER_SIZE: usize = 3;
const GENERATION_DELTA: u8 = 8; // low 3 bits of genbound hold pv + bound

struct Entry {
    word0: AtomicU64,
    word1: AtomicU64,
}

impl Entry {
    const fn empty() -> Entry {
        Entry {
            word0: AtomicU64::new(0),
            word1: AtomicU64::new(0),
        }
    }
}

#[repr(align(64))]
struct Cluster {
    entries: [Entry; CLUSTER_SIZE],
}

/// Decoded view of one probed entry.
#[derive(Clone, Copy)]
pub struct TtData {
    pub value: Value,
    pub eval: Value,
    pub depth: Depth,
    pub bound: Bound,
    pub mv: Option<ChessMove>,
    pub is_pv: bool,
}

/// Handle to the slot a probe landed on; the caller stores back through it.
#[derive(Clone, Copy)]
pub struct TtSlot {
    cluster: usize,
    index: usize,
}

pub struct TranspositionTable {
    clusters: Vec<Cluster>,
    generation: AtomicU8,
}

#[inline]
pub fn encode_move(m: ChessMove) -> u16 {
    let src = m.get_source().to_index() as u16;
    let dst = m.get_dest().to_index() as u16;
    let promo = match m.get_promotion() {
        Some(Piece::Knight) => 1,
        Some(Piece::Bishop) => 2,
        Some(Piece::Rook) => 3,
        Some(Piece::Queen) => 4,
        _ => 0,
    };
    (promo << 12) | (dst << 6) | src
}

#[inline]
pub fn decode_move(val: u16) -> Option<ChessMove> {
    if val == 0 {
        return None;
    }
    let src = unsafe {
        // SAFETY: val & 0x3F is always 0-63, valid for Square
        Square::new((val & 0x3F) as u8)
    };
    let dst = unsafe {
        // SAFETY: (val >> 6) & 0x3F is always 0-63, valid for Square
        Square::new(((val >> 6) & 0x3F) as u8)
    };
    let promo = match (val >> 12) & 0x7 {
        1 => Some(Piece::Knight),
        2 => Some(Piece::Bishop),
        3 => Some(Piece::Rook),
        4 => Some(Piece::Queen),
        _ => None,
    };
    Some(ChessMove::new(src, dst, promo))
}

impl TranspositionTable {
    pub fn new(size_mb: usize) -> TranspositionTable {
        let bytes = size_mb.max(1) * 1024 * 1024;
        let count = (bytes / std::mem::size_of::<Cluster>()).next_power_of_two();
        let mut clusters = Vec::with_capacity(count);
        for _ in 0..count {
            clusters.push(Cluster {
                entries: [Entry::empty(), Entry::empty(), Entry::empty()],
            });
        }
        TranspositionTable {
            clusters,
            generation: AtomicU8::new(GENERATION_DELTA),
        }
    }

    pub fn resize(&mut self, size_mb: usize) {
        *self = TranspositionTable::new(size_mb);
    }

    pub fn clear(&self) {
        for cluster in &self.clusters {
            for entry in &cluster.entries {
                entry.word0.store(0, Ordering::Relaxed);
                entry.word1.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Advance the generation so old entries age out of replacement fights.
    pub fn new_search(&self) {
        self.generation
            .fetch_add(GENERATION_DELTA, Ordering::Relaxed);
    }

    /// Analysis mode: keep the current generation so entries never age.
    pub fn infinite_search(&self) {}

    #[inline]
    fn generation(&self) -> u8 {
        self.generation.load(Ordering::Relaxed)
    }

    #[inline]
    fn relative_age(&self, genbound: u8) -> i32 {
        // Wrapping distance in generations, bound bits masked out.
        ((self
            .generation()
            .wrapping_sub(genbound))
            & !(GENERATION_DELTA - 1)) as i32
    }

    /// Look up `key`. Returns the decoded entry on a hit, and always a slot
    /// the caller may later `save` through (the replacement victim on miss).
    pub fn probe(&self, key: u64) -> (Option<TtData>, TtSlot) {
        let cluster_idx = (key as usize) & (self.clusters.len() - 1);
        let key32 = (key >> 32) as u32;
        let cluster = &self.clusters[cluster_idx];

        let mut victim = 0;
        let mut victim_score = i32::MAX;
        for (i, entry) in cluster.entries.iter().enumerate() {
            let w0 = entry.word0.load(Ordering::Relaxed);
            let w1 = entry.word1.load(Ordering::Relaxed);
            let tag0 = (w0 >> 32) as u32;
            let tag1 = (w1 >> 32) as u32;
            if tag0 == key32 && tag1 == key32 && w0 != 0 {
                let genbound = (w1 & 0xFF) as u8;
                let data = TtData {
                    value: (w0 as u16) as i16 as Value,
                    eval: ((w1 >> 16) & 0xFFFF) as u16 as i16 as Value,
                    depth: ((w1 >> 8) & 0xFF) as i32 + DEPTH_OFFSET,
                    bound: Bound::from_bits(genbound),
                    mv: decode_move(((w0 >> 16) & 0xFFFF) as u16),
                    is_pv: genbound & 4 != 0,
                };
                return (Some(data), TtSlot { cluster: cluster_idx, index: i });
            }
            // Replacement: prefer shallow entries from old generations.
            let depth8 = ((w1 >> 8) & 0xFF) as i32;
            let score = depth8 - 2 * self.relative_age((w1 & 0xFF) as u8);
            if w0 == 0 {
                // Empty slot wins outright.
                victim = i;
                victim_score = i32::MIN;
            } else if score < victim_score {
                victim = i;
                victim_score = score;
            }
        }
        (None, TtSlot { cluster: cluster_idx, index: victim })
    }

    /// Store through a slot returned by `probe`. Values must already be
    /// ply-adjusted with `value_to_tt`.
    #[allow(clippy::too_many_arguments)]
    pub fn save(
        &self,
        slot: TtSlot,
        key: u64,
        value: Value,
        is_pv: bool,
        bound: Bound,
        depth: Depth,
        mv: Option<ChessMove>,
        eval: Value,
    ) {
        let key32 = (key >> 32) as u32;
        let entry = &self.clusters[slot.cluster].entries[slot.index];

        let w0 = entry.word0.load(Ordering::Relaxed);
        let same_key = (w0 >> 32) as u32 == key32 && w0 != 0;
        let old_move = ((w0 >> 16) & 0xFFFF) as u16;
        let old_depth = ((entry.word1.load(Ordering::Relaxed) >> 8) & 0xFF) as i32 + DEPTH_OFFSET;

        // Keep an existing move for the same position if the new search
        // produced none.
        let move16 = match mv {
            Some(m) => encode_move(m),
            None if same_key => old_move,
            None => 0,
        };

        // Don't overwrite deeper data of the same position with much
        // shallower results, except exact bounds which are always welcome.
        if same_key && bound != Bound::Exact && depth < old_depth - 4 {
            return;
        }

        let genbound =
            self.generation() | (u8::from(is_pv) << 2) | (bound as u8);
        let new_w0 = ((key32 as u64) << 32)
            | ((move16 as u64) << 16)
            | ((value as i16 as u16) as u64);
        let new_w1 = ((key32 as u64) << 32)
            | (((eval as i16 as u16) as u64) << 16)
            | ((((depth - DEPTH_OFFSET) as u8) as u64) << 8)
            | (genbound as u64);
        entry.word0.store(new_w0, Ordering::Relaxed);
        entry.word1.store(new_w1, Ordering::Relaxed);
    }

    /// Permille of sampled slots holding current-generation data.
    pub fn hashfull(&self) -> usize {
        let sampled = self.clusters.len().min(334);
        let gen = self.generation();
        let mut filled = 0;
        for cluster in &self.clusters[..sampled] {
            for entry in &cluster.entries {
                let w1 = entry.word1.load(Ordering::Relaxed);
                let w0 = entry.word0.load(Ordering::Relaxed);
                if w0 != 0 && (w1 & 0xFF) as u8 & !(GENERATION_DELTA - 1) == gen {
                    filled += 1;
                }
            }
        }
        filled * 1000 / (sampled * CLUSTER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defs::VALUE_NONE;
    use std::str::FromStr;

    #[test]
    fn probe_miss_then_hit_round_trip() {
        let tt = TranspositionTable::new(1);
        let key = 0xDEAD_BEEF_CAFE_F00D;
        let (hit, slot) = tt.probe(key);
        assert!(hit.is_none());
        let m = ChessMove::from_str("e2e4").unwrap();
        tt.save(slot, key, 123, true, Bound::Exact, 9, Some(m), -45);
        let (hit, _) = tt.probe(key);
        let data = hit.expect("stored entry should hit");
        assert_eq!(data.value, 123);
        assert_eq!(data.eval, -45);
        assert_eq!(data.depth, 9);
        assert_eq!(data.bound, Bound::Exact);
        assert_eq!(data.mv, Some(m));
        assert!(data.is_pv);
    }

    #[test]
    fn key_mismatch_reads_as_miss() {
        let tt = TranspositionTable::new(1);
        let key = 0x1234_5678_9ABC_DEF0;
        let (_, slot) = tt.probe(key);
        tt.save(slot, key, 10, false, Bound::Lower, 3, None, 0);
        // Same cluster index (low bits), different tag (high bits).
        let other = key ^ 0xFFFF_0000_0000_0000;
        let (hit, _) = tt.probe(other);
        assert!(hit.is_none());
    }

    #[test]
    fn negative_values_survive_packing() {
        let tt = TranspositionTable::new(1);
        let key = 42;
        let (_, slot) = tt.probe(key);
        tt.save(slot, key, -31500, false, Bound::Upper, -5, None, -1);
        let (hit, _) = tt.probe(key);
        let data = hit.unwrap();
        assert_eq!(data.value, -31500);
        assert_eq!(data.eval, -1);
        assert_eq!(data.depth, -5);
    }

    #[test]
    fn same_key_keeps_old_move_when_new_store_has_none() {
        let tt = TranspositionTable::new(1);
        let key = 777;
        let m = ChessMove::from_str("g1f3").unwrap();
        let (_, slot) = tt.probe(key);
        tt.save(slot, key, 50, false, Bound::Lower, 6, Some(m), 0);
        let (_, slot) = tt.probe(key);
        tt.save(slot, key, 60, false, Bound::Lower, 7, None, 0);
        let (hit, _) = tt.probe(key);
        assert_eq!(hit.unwrap().mv, Some(m));
    }

    #[test]
    fn deeper_entries_resist_shallow_overwrites() {
        let tt = TranspositionTable::new(1);
        let key = 999;
        let (_, slot) = tt.probe(key);
        tt.save(slot, key, 80, false, Bound::Lower, 20, None, 0);
        let (_, slot) = tt.probe(key);
        tt.save(slot, key, -5, false, Bound::Upper, 2, None, 0);
        let (hit, _) = tt.probe(key);
        assert_eq!(hit.unwrap().depth, 20);
    }

    #[test]
    fn value_none_round_trips() {
        let tt = TranspositionTable::new(1);
        let key = 31337;
        let (_, slot) = tt.probe(key);
        tt.save(slot, key, VALUE_NONE, false, Bound::None, DEPTH_OFFSET, None, 17);
        let (hit, _) = tt.probe(key);
        assert_eq!(hit.unwrap().value, VALUE_NONE);
    }
}
