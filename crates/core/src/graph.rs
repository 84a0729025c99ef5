//! Fixed-degree neighborhood graph.
//!
//! Adjacency is one K-wide row of vector ids per node, ranked by ascending
//! distance to the row owner, with `-1` terminating short rows. Cells are
//! atomics so edge reciprocation can run under sharded per-row mutexes while
//! concurrent searches read the rows; row extension and compaction take the
//! outer write lock.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicI32, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::GRAPH_ROW_LOCK_SHARDS;
use crate::distance::DistFn;
use crate::element::VectorValue;
use crate::error::{EngineError, Result};
use crate::persistence::{read_i32, write_i32};
use crate::prefetch::fetch_ahead;
use crate::query::NodeDist;
use crate::store::BlockStore;

/// Adjacency rows guarded by the graph's outer lock.
#[derive(Debug, Default)]
pub struct AdjacencyRows {
    cells: Vec<AtomicI32>,
    rows: usize,
    k: usize,
    capacity: usize,
}

impl AdjacencyRows {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// The K-wide neighbor row for `vid`.
    #[inline]
    pub fn row(&self, vid: i32) -> &[AtomicI32] {
        let i = vid as usize;
        debug_assert!(i < self.rows);
        &self.cells[i * self.k..(i + 1) * self.k]
    }

    /// Hint that `vid`'s row will be read shortly. Best-effort.
    #[inline(always)]
    pub fn prefetch_row(&self, vid: i32) {
        let row = self.row(vid);
        fetch_ahead(
            row.as_ptr().cast(),
            row.len() * std::mem::size_of::<AtomicI32>(),
        );
    }

    /// Copy a row out, stopping at the first `-1`.
    pub fn row_snapshot(&self, vid: i32) -> Vec<i32> {
        self.row(vid)
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .take_while(|&n| n >= 0)
            .collect()
    }
}

/// The neighborhood graph: adjacency rows plus the sharded row locks used
/// during edge insertion.
#[derive(Debug)]
pub struct NeighborhoodGraph {
    data: RwLock<AdjacencyRows>,
    row_locks: Vec<Mutex<()>>,
}

impl Default for NeighborhoodGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl NeighborhoodGraph {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(AdjacencyRows::default()),
            row_locks: (0..GRAPH_ROW_LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, AdjacencyRows> {
        self.data.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, AdjacencyRows> {
        self.data.write()
    }

    /// Allocate `rows` empty rows of width `k`.
    pub fn initialize(&self, rows: usize, k: usize, capacity: usize) {
        let mut data = self.data.write();
        *data = AdjacencyRows {
            cells: (0..rows * k).map(|_| AtomicI32::new(-1)).collect(),
            rows,
            k,
            capacity,
        };
    }

    /// Extend by `n` empty rows. Fails with `MemoryOverflow` past capacity,
    /// leaving the rows unchanged.
    pub fn add_batch(&self, n: usize) -> Result<()> {
        let mut data = self.data.write();
        if data.rows + n > data.capacity {
            return Err(EngineError::MemoryOverflow);
        }
        let add = n * data.k;
        data.cells.reserve(add);
        for _ in 0..add {
            data.cells.push(AtomicI32::new(-1));
        }
        data.rows += n;
        Ok(())
    }

    /// Truncate the logical row count. Used to restore invariants after a
    /// partial append failure.
    pub fn set_rows(&self, rows: usize) {
        let mut data = self.data.write();
        debug_assert!(rows <= data.rows);
        let k = data.k;
        data.cells.truncate(rows * k);
        data.rows = rows;
    }

    /// Replace `vid`'s row with the best `k` of (existing neighbors ∪
    /// `candidates`), ranked ascending, self-loops and duplicates dropped.
    pub fn rebuild_row<T: VectorValue>(
        &self,
        data: &AdjacencyRows,
        store: &BlockStore<T>,
        dist: DistFn<T>,
        vid: i32,
        candidates: &[NodeDist],
    ) {
        let _row = self.lock_row(vid);
        let owner = store.row(vid);
        let mut merged: Vec<NodeDist> = Vec::with_capacity(data.k + candidates.len());
        for &n in data.row_snapshot(vid).iter() {
            if n != vid && (n as usize) < store.rows() {
                merged.push(NodeDist {
                    vid: n,
                    dist: dist(owner, store.row(n)),
                });
            }
        }
        merged.extend(
            candidates
                .iter()
                .filter(|c| c.vid >= 0 && c.vid != vid)
                .copied(),
        );
        merged.sort_unstable_by(|a, b| a.dist.total_cmp(&b.dist).then(a.vid.cmp(&b.vid)));
        merged.dedup_by_key(|c| c.vid);
        let row = data.row(vid);
        for (slot, cell) in row.iter().enumerate() {
            let value = merged.get(slot).map_or(-1, |c| c.vid);
            cell.store(value, Ordering::Relaxed);
        }
    }

    /// Offer `insert_vid` (at `insert_dist` from `owner`) into `owner`'s
    /// row. Walks the ranked row, shifts the tail right, and drops the last
    /// entry when the row would overflow. No-op if the row would not
    /// improve or already holds `insert_vid`.
    pub fn insert_neighbor<T: VectorValue>(
        &self,
        data: &AdjacencyRows,
        store: &BlockStore<T>,
        dist: DistFn<T>,
        owner: i32,
        insert_vid: i32,
        insert_dist: f32,
    ) {
        if owner == insert_vid {
            return;
        }
        let _row = self.lock_row(owner);
        let row = data.row(owner);
        let owner_row = store.row(owner);
        let mut current: Vec<i32> = row.iter().map(|c| c.load(Ordering::Relaxed)).collect();
        let mut insert_at = None;
        for (pos, &n) in current.iter().enumerate() {
            if n == insert_vid {
                return;
            }
            if n < 0 {
                insert_at = Some(pos);
                break;
            }
            let d = dist(owner_row, store.row(n));
            if insert_dist < d || (insert_dist == d && insert_vid < n) {
                insert_at = Some(pos);
                break;
            }
        }
        let Some(pos) = insert_at else { return };
        // The displaced tail may still contain insert_vid; drop it rather
        // than letting the id appear twice.
        current.pop();
        if let Some(dup) = current[pos..].iter().position(|&n| n == insert_vid) {
            current.remove(pos + dup);
            current.push(-1);
        }
        current.insert(pos, insert_vid);
        for (cell, &value) in row.iter().zip(current.iter()) {
            cell.store(value, Ordering::Relaxed);
        }
    }

    /// Compact the graph through the refine permutation: new row `j` is old
    /// row `indices[j]` with tombstoned neighbors dropped and survivors
    /// remapped through `reverse`, re-ranked by distance in the new store.
    pub fn refine<T: VectorValue>(
        &self,
        old_store: &BlockStore<T>,
        dist: DistFn<T>,
        indices: &[i32],
        reverse: &[i32],
        is_deleted: impl Fn(i32) -> bool + Sync,
        pool: &rayon::ThreadPool,
    ) -> Vec<Vec<i32>> {
        use rayon::prelude::*;
        let data = self.data.read();
        let k = data.k;
        pool.install(|| {
            indices
                .par_iter()
                .map(|&old| {
                    let owner = old_store.row(old);
                    let mut kept: Vec<NodeDist> = data
                        .row_snapshot(old)
                        .into_iter()
                        .filter(|&n| n != old && !is_deleted(n))
                        .map(|n| NodeDist {
                            vid: reverse[n as usize],
                            dist: dist(owner, old_store.row(n)),
                        })
                        .collect();
                    kept.sort_unstable_by(|a, b| a.dist.total_cmp(&b.dist).then(a.vid.cmp(&b.vid)));
                    let mut row: Vec<i32> = kept.iter().map(|c| c.vid).collect();
                    row.resize(k, -1);
                    row
                })
                .collect()
        })
    }

    /// Install compacted rows produced by [`NeighborhoodGraph::refine`].
    pub fn install_rows(&self, rows: Vec<Vec<i32>>, k: usize, capacity: usize) {
        let mut data = self.data.write();
        let mut cells = Vec::with_capacity(rows.len() * k);
        for row in &rows {
            for &n in row {
                cells.push(AtomicI32::new(n));
            }
        }
        *data = AdjacencyRows {
            cells,
            rows: rows.len(),
            k,
            capacity,
        };
    }

    /// Write the graph blob: header `(R, K)` then R rows of K ids.
    pub fn save<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        let data = self.data.read();
        write_i32(w, data.rows as i32)?;
        write_i32(w, data.k as i32)?;
        for cell in &data.cells {
            write_i32(w, cell.load(Ordering::Acquire))?;
        }
        Ok(())
    }

    /// Stream compacted rows as a graph blob without materializing a graph.
    pub fn save_rows<W: Write + ?Sized>(rows: &[Vec<i32>], k: usize, w: &mut W) -> Result<()> {
        write_i32(w, rows.len() as i32)?;
        write_i32(w, k as i32)?;
        for row in rows {
            for &n in row {
                write_i32(w, n)?;
            }
        }
        Ok(())
    }

    /// Read a graph blob.
    pub fn load<R: Read + ?Sized>(&self, r: &mut R, capacity: usize) -> Result<()> {
        let rows = read_i32(r)?;
        let k = read_i32(r)?;
        if rows < 0 || k <= 0 {
            return Err(EngineError::FailedParseValue(
                "graph blob header is inconsistent".into(),
            ));
        }
        let (rows, k) = (rows as usize, k as usize);
        let mut cells = Vec::with_capacity(rows * k);
        for _ in 0..rows * k {
            cells.push(AtomicI32::new(read_i32(r)?));
        }
        let mut data = self.data.write();
        *data = AdjacencyRows {
            cells,
            rows,
            k,
            capacity: capacity.max(rows),
        };
        Ok(())
    }

    fn lock_row(&self, vid: i32) -> parking_lot::MutexGuard<'_, ()> {
        self.row_locks[vid as usize % self.row_locks.len()].lock()
    }
}
