// src/search/breadcrumbs.rs
//
// Small fixed array of (worker, key) markers. A worker entering the moves
// loop of a shallow node claims the slot for its position key; a second
// worker arriving at the same key sees the mark and may reduce a little
// harder. Everything is relaxed atomics: a lost race costs at worst one
// suboptimal reduction, never a wrong score.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const SLOTS: usize = 1024;
/// Only nodes this close to the root leave breadcrumbs.
pub const BREADCRUMB_MAX_PLY: i32 = 8;

struct Slot {
    // Worker id + 1; zero means free.
    owner: AtomicUsize,
    key: AtomicU64,
}

pub struct Breadcrumbs {
    slots: Vec<Slot>,
}

impl Breadcrumbs {
    pub fn new() -> Breadcrumbs {
        let mut slots = Vec::with_capacity(SLOTS);
        for _ in 0..SLOTS {
            slots.push(Slot {
                owner: AtomicUsize::new(0),
                key: AtomicU64::new(0),
            });
        }
        Breadcrumbs { slots }
    }
}

impl Default for Breadcrumbs {
    fn default() -> Breadcrumbs {
        Breadcrumbs::new()
    }
}

/// RAII claim over a breadcrumb slot for the duration of one moves loop.
pub struct ThreadHolding<'a> {
    slot: Option<&'a Slot>,
    owning: bool,
    other_worker: bool,
}

impl<'a> ThreadHolding<'a> {
    pub fn new(crumbs: &'a Breadcrumbs, worker_id: usize, key: u64, ply: i32) -> ThreadHolding<'a> {
        if ply >= BREADCRUMB_MAX_PLY {
            return ThreadHolding {
                slot: None,
                owning: false,
                other_worker: false,
            };
        }
        let slot = &crumbs.slots[(key as usize) & (SLOTS - 1)];
        let mut owning = false;
        let mut other_worker = false;
        let tag = worker_id + 1;
        let owner = slot.owner.load(Ordering::Relaxed);
        if owner == 0 {
            slot.owner.store(tag, Ordering::Relaxed);
            slot.key.store(key, Ordering::Relaxed);
            owning = true;
        } else if owner != tag && slot.key.load(Ordering::Relaxed) == key {
            other_worker = true;
        }
        ThreadHolding {
            slot: Some(slot),
            owning,
            other_worker,
        }
    }

    /// Another worker is already searching this subtree.
    #[inline]
    pub fn marked(&self) -> bool {
        self.other_worker
    }
}

impl Drop for ThreadHolding<'_> {
    fn drop(&mut self) {
        if self.owning {
            if let Some(slot) = self.slot {
                slot.owner.store(0, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_and_release() {
        let crumbs = Breadcrumbs::new();
        {
            let holding = ThreadHolding::new(&crumbs, 0, 12345, 2);
            assert!(!holding.marked());
            // Second worker on the same key sees the mark.
            let other = ThreadHolding::new(&crumbs, 1, 12345, 2);
            assert!(other.marked());
            // Same worker re-entering is not "another" worker.
            let same = ThreadHolding::new(&crumbs, 0, 12345, 2);
            assert!(!same.marked());
        }
        // Slot was released on drop; a new claim owns it cleanly.
        let fresh = ThreadHolding::new(&crumbs, 1, 12345, 2);
        assert!(!fresh.marked());
    }

    #[test]
    fn deep_nodes_never_touch_slots() {
        let crumbs = Breadcrumbs::new();
        let _deep = ThreadHolding::new(&crumbs, 0, 777, BREADCRUMB_MAX_PLY);
        let probe = ThreadHolding::new(&crumbs, 1, 777, 2);
        assert!(!probe.marked());
    }

    #[test]
    fn different_keys_sharing_a_slot_do_not_mark() {
        let crumbs = Breadcrumbs::new();
        let key_a = 5;
        let key_b = 5 + SLOTS as u64; // same slot index, different key
        let _a = ThreadHolding::new(&crumbs, 0, key_a, 1);
        let b = ThreadHolding::new(&crumbs, 1, key_b, 1);
        assert!(!b.marked());
    }
}
