//! Per-search scratch state and the pool that recycles it.
//!
//! A [`SearchWorkspace`] bundles the candidate queue, the tree-descent queue,
//! the visited table, and the traversal counters for one in-flight query.
//! Workspaces are rented from a fixed-size [`WorkspacePool`] (one slot per
//! worker thread) and returned when the query finishes; `reset` is O(1)
//! amortized so a rental costs nothing beyond the pool handoff.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use ordered_float::OrderedFloat;
use parking_lot::{Condvar, Mutex};

use crate::config::MIN_HASH_TABLE_EXPONENT;

/// Open-addressed visited table of size `2^exponent`.
///
/// Clearing bumps a generation counter instead of zeroing slots (the same
/// trick the dense visited sets use), and the table doubles itself when it
/// passes half load, re-homing the current generation's entries. The actual
/// exponent after growth is what gets persisted into the config.
#[derive(Debug)]
pub struct VisitedTable {
    slots: Vec<u64>,
    exponent: u32,
    generation: u32,
    used: usize,
}

impl VisitedTable {
    pub fn new(exponent: u32) -> Self {
        let exponent = exponent.max(MIN_HASH_TABLE_EXPONENT);
        Self {
            slots: vec![0u64; 1 << exponent],
            exponent,
            generation: 1,
            used: 0,
        }
    }

    /// Size exponent actually allocated (≥ the configured one after growth).
    pub fn exponent(&self) -> u32 {
        self.exponent
    }

    /// Empty the table. O(1) except on generation wrap-around.
    pub fn reset(&mut self) {
        if self.generation == u32::MAX {
            self.slots.fill(0);
            self.generation = 1;
        } else {
            self.generation += 1;
        }
        self.used = 0;
    }

    #[inline]
    fn start_slot(&self, vid: i32) -> usize {
        // Fibonacci hashing spreads consecutive vids across the table.
        ((vid as u32 as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15) >> (64 - self.exponent)) as usize
    }

    /// Mark `vid` visited. Returns `true` iff it was already visited.
    pub fn check_and_set(&mut self, vid: i32) -> bool {
        let mask = self.slots.len() - 1;
        let mut idx = self.start_slot(vid);
        loop {
            let slot = self.slots[idx];
            if (slot >> 32) as u32 != self.generation {
                self.slots[idx] = ((self.generation as u64) << 32) | (vid as u32 as u64);
                self.used += 1;
                if self.used * 2 > self.slots.len() {
                    self.grow();
                }
                return false;
            }
            if slot as u32 == vid as u32 {
                return true;
            }
            idx = (idx + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let old = std::mem::replace(&mut self.slots, vec![0u64; 2 << self.exponent]);
        self.exponent += 1;
        let mask = self.slots.len() - 1;
        for slot in old {
            if (slot >> 32) as u32 == self.generation {
                let vid = slot as u32 as i32;
                let mut idx = self.start_slot(vid);
                while (self.slots[idx] >> 32) as u32 == self.generation {
                    idx = (idx + 1) & mask;
                }
                self.slots[idx] = slot;
            }
        }
    }
}

/// Candidate cell ordered by distance (vid breaks ties); used through
/// `Reverse` for min-heap behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HeapCell {
    pub dist: OrderedFloat<f32>,
    pub vid: i32,
}

impl HeapCell {
    #[inline]
    pub fn new(vid: i32, dist: f32) -> Self {
        Self {
            dist: OrderedFloat(dist),
            vid,
        }
    }
}

/// Tree-descent cell: a pending subtree keyed by its boundary-distance
/// estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TreeCell {
    pub dist: OrderedFloat<f32>,
    pub tree: u32,
    pub node: i32,
}

/// Scratch state for one best-first search.
#[derive(Debug)]
pub struct SearchWorkspace {
    /// Candidate queue fed by tree seeds and graph expansion.
    pub ng_queue: BinaryHeap<Reverse<HeapCell>>,
    /// Pending far-subtree queue for the tree descent.
    pub tree_queue: BinaryHeap<Reverse<TreeCell>>,
    pub visited: VisitedTable,
    /// Total leaves whose distance was computed (tree + graph).
    pub checked_leaves: usize,
    /// Leaves reached through tree descent only.
    pub tree_checked_leaves: usize,
    /// Consecutive graph expansions that beat no bound.
    pub no_better_propagation: usize,
    /// Leaf budget for the current query.
    pub max_check: usize,
}

impl SearchWorkspace {
    pub fn new(hash_exponent: u32) -> Self {
        Self {
            ng_queue: BinaryHeap::new(),
            tree_queue: BinaryHeap::new(),
            visited: VisitedTable::new(hash_exponent),
            checked_leaves: 0,
            tree_checked_leaves: 0,
            no_better_propagation: 0,
            max_check: 0,
        }
    }

    /// Prepare for a new query. O(1) amortized.
    pub fn reset(&mut self, max_check: usize) {
        self.ng_queue.clear();
        self.tree_queue.clear();
        self.visited.reset();
        self.checked_leaves = 0;
        self.tree_checked_leaves = 0;
        self.no_better_propagation = 0;
        self.max_check = max_check;
    }
}

/// Fixed-size pool of search workspaces.
///
/// `rent` blocks until a workspace is free; the returned guard hands the
/// workspace back on drop, so a panicking search cannot leak a slot.
#[derive(Debug)]
pub struct WorkspacePool {
    free: Mutex<Vec<SearchWorkspace>>,
    available: Condvar,
}

impl WorkspacePool {
    pub fn new(slots: usize, hash_exponent: u32) -> Self {
        let slots = slots.max(1);
        Self {
            free: Mutex::new(
                (0..slots)
                    .map(|_| SearchWorkspace::new(hash_exponent))
                    .collect(),
            ),
            available: Condvar::new(),
        }
    }

    /// Borrow a workspace, blocking until one is available.
    pub fn rent(&self) -> RentedWorkspace<'_> {
        let mut free = self.free.lock();
        while free.is_empty() {
            self.available.wait(&mut free);
        }
        let ws = free.pop().expect("non-empty after wait");
        RentedWorkspace {
            pool: self,
            ws: Some(ws),
        }
    }

    fn give_back(&self, ws: SearchWorkspace) {
        self.free.lock().push(ws);
        self.available.notify_one();
    }
}

/// A workspace on loan from a [`WorkspacePool`].
#[derive(Debug)]
pub struct RentedWorkspace<'a> {
    pool: &'a WorkspacePool,
    ws: Option<SearchWorkspace>,
}

impl std::ops::Deref for RentedWorkspace<'_> {
    type Target = SearchWorkspace;

    fn deref(&self) -> &SearchWorkspace {
        self.ws.as_ref().expect("workspace present until drop")
    }
}

impl std::ops::DerefMut for RentedWorkspace<'_> {
    fn deref_mut(&mut self) -> &mut SearchWorkspace {
        self.ws.as_mut().expect("workspace present until drop")
    }
}

impl Drop for RentedWorkspace<'_> {
    fn drop(&mut self) {
        if let Some(ws) = self.ws.take() {
            self.pool.give_back(ws);
        }
    }
}
