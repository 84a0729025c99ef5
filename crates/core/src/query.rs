//! Query-side types: the bounded top-k result buffer and the query vector
//! carrier.
//!
//! [`QueryResultSet`] is a fixed-capacity max-heap seeded with sentinel
//! entries, so `worst_dist()` is an O(1) read of the heap root and
//! `add_point` is a replace-top. Within one query `worst_dist()` is
//! monotonically non-increasing.

use ordered_float::OrderedFloat;

use crate::distance::DistCalcMethod;
use crate::element::{normalize_row, VectorValue};

/// A scored vector id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeDist {
    pub vid: i32,
    pub dist: f32,
}

impl NodeDist {
    /// Heap ordering: by distance, ties broken toward the larger vid so the
    /// smaller vid wins a replace-top comparison.
    #[inline]
    fn heap_key(&self) -> (OrderedFloat<f32>, i32) {
        (OrderedFloat(self.dist), self.vid)
    }
}

/// Bounded min-distance top-k buffer.
///
/// Starts filled with `(vid = -1, dist = +∞)` sentinels; sentinels that
/// survive to the end are excluded from [`QueryResultSet::results`].
#[derive(Debug)]
pub struct QueryResultSet {
    entries: Vec<NodeDist>,
    sorted: bool,
}

impl QueryResultSet {
    pub fn new(k: usize) -> Self {
        let mut rs = Self {
            entries: Vec::new(),
            sorted: false,
        };
        rs.reset(k);
        rs
    }

    /// Re-seed the buffer with `k` sentinel entries.
    pub fn reset(&mut self, k: usize) {
        self.entries.clear();
        self.entries.resize(
            k.max(1),
            NodeDist {
                vid: -1,
                dist: f32::MAX,
            },
        );
        self.sorted = false;
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Current k-th smallest distance, `+∞` while under-full.
    #[inline]
    pub fn worst_dist(&self) -> f32 {
        self.entries[0].dist
    }

    /// Offer `(vid, dist)`. Returns `true` iff the point displaced the
    /// current worst entry and entered the top-k.
    pub fn add_point(&mut self, vid: i32, dist: f32) -> bool {
        debug_assert!(!self.sorted);
        let candidate = NodeDist { vid, dist };
        if candidate.heap_key() >= self.entries[0].heap_key() {
            return false;
        }
        self.entries[0] = candidate;
        self.sift_down(0);
        true
    }

    /// Finalize: ascending by distance, vids breaking ties.
    pub fn sort_result(&mut self) {
        self.entries.sort_unstable_by_key(|e| e.heap_key());
        self.sorted = true;
    }

    /// Finalized entries, sentinels excluded. Call after `sort_result`.
    pub fn results(&self) -> &[NodeDist] {
        debug_assert!(self.sorted);
        let valid = self.entries.iter().take_while(|e| e.vid >= 0).count();
        &self.entries[..valid]
    }

    /// All slots including sentinels, in heap order.
    pub fn raw_entries(&self) -> &[NodeDist] {
        &self.entries
    }

    fn sift_down(&mut self, mut i: usize) {
        let n = self.entries.len();
        loop {
            let (l, r) = (2 * i + 1, 2 * i + 2);
            let mut largest = i;
            if l < n && self.entries[l].heap_key() > self.entries[largest].heap_key() {
                largest = l;
            }
            if r < n && self.entries[r].heap_key() > self.entries[largest].heap_key() {
                largest = r;
            }
            if largest == i {
                return;
            }
            self.entries.swap(i, largest);
            i = largest;
        }
    }
}

/// The two representations a query carries: the original target and an
/// optional quantized one. The engine measures distances against the
/// quantized target and treats the quantization itself as opaque.
#[derive(Debug, Clone)]
pub struct QueryVectors<T> {
    target: Vec<T>,
    quantized: Option<Vec<T>>,
}

impl<T: VectorValue> QueryVectors<T> {
    /// Copy the caller's query, normalizing for cosine distance.
    pub fn new(target: &[T], method: DistCalcMethod) -> Self {
        let mut target = target.to_vec();
        if method == DistCalcMethod::Cosine {
            normalize_row(&mut target);
        }
        Self {
            target,
            quantized: None,
        }
    }

    /// A query over a row already stored by the engine (pre-normalized).
    pub fn from_stored(row: &[T]) -> Self {
        Self {
            target: row.to_vec(),
            quantized: None,
        }
    }

    /// Attach an opaque quantized representation.
    pub fn with_quantized(mut self, quantized: Vec<T>) -> Self {
        self.quantized = Some(quantized);
        self
    }

    pub fn target(&self) -> &[T] {
        &self.target
    }

    /// The representation distances are measured against.
    #[inline]
    pub fn quantized_target(&self) -> &[T] {
        self.quantized.as_deref().unwrap_or(&self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_dist_sentinel_while_underfull() {
        let mut rs = QueryResultSet::new(3);
        assert_eq!(rs.worst_dist(), f32::MAX);
        assert!(rs.add_point(0, 1.0));
        assert_eq!(rs.worst_dist(), f32::MAX);
        assert!(rs.add_point(1, 2.0));
        assert!(rs.add_point(2, 3.0));
        assert_eq!(rs.worst_dist(), 3.0);
    }

    #[test]
    fn test_add_point_rejects_worse() {
        let mut rs = QueryResultSet::new(2);
        assert!(rs.add_point(0, 1.0));
        assert!(rs.add_point(1, 2.0));
        assert!(!rs.add_point(2, 5.0));
        assert!(rs.add_point(3, 0.5));
        rs.sort_result();
        let vids: Vec<i32> = rs.results().iter().map(|e| e.vid).collect();
        assert_eq!(vids, vec![3, 0]);
    }

    #[test]
    fn test_worst_dist_monotone_non_increasing() {
        let mut rs = QueryResultSet::new(4);
        let mut prev = rs.worst_dist();
        for (vid, dist) in [(0, 9.0), (1, 3.0), (2, 7.0), (3, 1.0), (4, 2.0), (5, 8.0)] {
            rs.add_point(vid, dist);
            assert!(rs.worst_dist() <= prev);
            prev = rs.worst_dist();
        }
    }

    #[test]
    fn test_sort_result_ascending_without_sentinels() {
        let mut rs = QueryResultSet::new(5);
        rs.add_point(10, 0.3);
        rs.add_point(11, 0.1);
        rs.sort_result();
        let out = rs.results();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].vid, 11);
        assert_eq!(out[1].vid, 10);
        assert!(out[0].dist <= out[1].dist);
    }

    #[test]
    fn test_tie_break_prefers_smaller_vid() {
        let mut rs = QueryResultSet::new(1);
        assert!(rs.add_point(5, 1.0));
        assert!(!rs.add_point(9, 1.0));
        assert!(rs.add_point(2, 1.0));
        rs.sort_result();
        assert_eq!(rs.results()[0].vid, 2);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut rs = QueryResultSet::new(2);
        rs.add_point(0, 1.0);
        rs.sort_result();
        rs.reset(3);
        assert_eq!(rs.capacity(), 3);
        assert_eq!(rs.worst_dist(), f32::MAX);
    }

    #[test]
    fn test_query_vectors_cosine_normalizes() {
        let q = QueryVectors::new(&[3.0f32, 4.0], DistCalcMethod::Cosine);
        assert!((q.target()[0] - 0.6).abs() < 1e-6);
        assert_eq!(q.quantized_target(), q.target());
    }

    #[test]
    fn test_query_vectors_quantized_override() {
        let q = QueryVectors::new(&[1.0f32, 0.0], DistCalcMethod::L2)
            .with_quantized(vec![0.5, 0.5]);
        assert_eq!(q.target(), &[1.0, 0.0]);
        assert_eq!(q.quantized_target(), &[0.5, 0.5]);
    }
}
