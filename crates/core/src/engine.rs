//! The index engine.
//!
//! [`Index`] binds the sample store, deleted set, KD-forest, neighborhood
//! graph, and workspace pool into the public search/build/add/delete/refine
//! surface. The central algorithm is the tree-seeded best-first graph
//! traversal in `search_core`: the forest contributes globally spread seed
//! candidates, the graph densifies around promising regions, and an
//! unproductive-propagation counter decides between re-seeding from the
//! trees and terminating.
//!
//! Lock order, everywhere: add lock → delete lock → samples → trees →
//! graph → deleted → metadata. The background tree rebuild clones the store
//! under a short read guard and builds offline, swapping under the tree
//! write lock only at the end.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

use crate::deleted::DeletedSet;
use crate::distance::{distance_fn, DistCalcMethod, DistFn};
use crate::element::{normalize_row, VectorValue};
use crate::error::{EngineError, Result};
use crate::graph::NeighborhoodGraph;
use crate::metadata::{MemMetadataStore, MetadataStore};
use crate::params::Params;
use crate::query::{QueryResultSet, QueryVectors};
use crate::store::BlockStore;
use crate::workspace::SearchWorkspace;
use crate::tree::{ForestParams, KdForest};
use crate::workspace::{HeapCell, WorkspacePool};

/// Per-call search options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchOptions {
    /// Return tombstoned ids instead of filtering them.
    pub search_deleted: bool,
    /// Attach a metadata copy to each result.
    pub with_metadata: bool,
}

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub vid: i32,
    pub dist: f32,
    pub metadata: Option<Vec<u8>>,
}

/// Cancellation probe for the streaming refine. Checked at stable points;
/// a `true` answer invalidates everything written so far.
pub trait AbortProbe {
    fn should_abort(&self) -> bool;
}

impl<F: Fn() -> bool> AbortProbe for F {
    fn should_abort(&self) -> bool {
        self()
    }
}

/// Output streams for the streaming refine. The metadata pair is required
/// exactly when the engine holds a metadata store.
pub struct RefineStreams<'a> {
    pub samples: &'a mut dyn Write,
    pub trees: &'a mut dyn Write,
    pub graph: &'a mut dyn Write,
    pub deleted: &'a mut dyn Write,
    pub metadata: Option<(&'a mut dyn Write, &'a mut dyn Write)>,
}

#[derive(Debug, Clone, Copy)]
struct DistState<T: VectorValue> {
    dist: DistFn<T>,
    base_square: f32,
}

impl<T: VectorValue> DistState<T> {
    fn resolve(method: DistCalcMethod) -> Self {
        Self {
            dist: distance_fn::<T>(method),
            base_square: match method {
                DistCalcMethod::Cosine => T::BASE * T::BASE,
                DistCalcMethod::L2 => 1.0,
            },
        }
    }
}

/// Hybrid KD-forest + neighborhood-graph approximate nearest neighbor index.
pub struct Index<T: VectorValue> {
    params: RwLock<Params>,
    dist_state: RwLock<DistState<T>>,
    samples: Arc<RwLock<BlockStore<T>>>,
    trees: Arc<RwLock<KdForest>>,
    graph: NeighborhoodGraph,
    deleted: Arc<RwLock<DeletedSet>>,
    workspace_pool: RwLock<Arc<WorkspacePool>>,
    metadata: RwLock<Option<Box<dyn MetadataStore>>>,
    meta_mapping: RwLock<Option<HashMap<Vec<u8>, i32>>>,
    add_lock: Mutex<()>,
    delete_lock: RwLock<()>,
    rebuild_gate: Arc<AtomicBool>,
    ready: AtomicBool,
}

impl<T: VectorValue> std::fmt::Debug for Index<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index").finish_non_exhaustive()
    }
}

impl<T: VectorValue> Default for Index<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: VectorValue> Index<T> {
    /// An empty index with default parameters.
    pub fn new() -> Self {
        Self::with_params(Params::default())
    }

    /// An empty index with the given parameters.
    pub fn with_params(params: Params) -> Self {
        let dist_state = DistState::resolve(params.dist_calc_method);
        let pool = WorkspacePool::new(params.number_of_threads, params.hash_table_exponent);
        Self {
            params: RwLock::new(params),
            dist_state: RwLock::new(dist_state),
            samples: Arc::new(RwLock::new(BlockStore::new(0, 1, 0))),
            trees: Arc::new(RwLock::new(KdForest::default())),
            graph: NeighborhoodGraph::new(),
            deleted: Arc::new(RwLock::new(DeletedSet::new(0))),
            workspace_pool: RwLock::new(Arc::new(pool)),
            metadata: RwLock::new(None),
            meta_mapping: RwLock::new(None),
            add_lock: Mutex::new(()),
            delete_lock: RwLock::new(()),
            rebuild_gate: Arc::new(AtomicBool::new(false)),
            ready: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Current number of rows, tombstoned ones included.
    pub fn rows(&self) -> usize {
        self.samples.read().rows()
    }

    pub fn dim(&self) -> usize {
        self.samples.read().dim()
    }

    /// Snapshot of the tombstone count.
    pub fn deleted_count(&self) -> usize {
        self.deleted.read().count()
    }

    /// `base²` for cosine distance, 1 otherwise.
    pub fn base_square(&self) -> f32 {
        self.dist_state.read().base_square
    }

    /// Snapshot of `vid`'s neighbor row, trailing `-1`s stripped.
    pub fn neighbors(&self, vid: i32) -> Vec<i32> {
        self.graph.read().row_snapshot(vid)
    }

    // ---- parameter registry -------------------------------------------------

    /// Assign a registered parameter from its string form. Assigning
    /// `DistCalcMethod` re-resolves the distance kernel and `base²`.
    pub fn set_parameter(&self, name: &str, value: &str) -> Result<()> {
        self.params.write().set(name, value)?;
        if name.eq_ignore_ascii_case("DistCalcMethod") {
            let method = self.params.read().dist_calc_method;
            *self.dist_state.write() = DistState::resolve(method);
        }
        Ok(())
    }

    /// Format the current value of a registered parameter.
    pub fn get_parameter(&self, name: &str) -> Option<String> {
        self.params.read().get(name)
    }

    /// Write the `[Index]` config section. Snapshots the workspace pool's
    /// actual hash-table exponent first so a reload allocates what this run
    /// ended up using.
    pub fn save_config<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        {
            let pool = self.workspace_pool.read().clone();
            let ws = pool.rent();
            self.params.write().hash_table_exponent = ws.visited.exponent();
        }
        let params = self.params.read();
        writeln!(w, "[Index]")?;
        params.write_all(w)?;
        writeln!(w)?;
        Ok(())
    }

    /// Apply a config section produced by [`Index::save_config`].
    pub fn load_config(&self, text: &str) -> Result<()> {
        self.params.write().merge_config(text)?;
        let method = self.params.read().dist_calc_method;
        *self.dist_state.write() = DistState::resolve(method);
        Ok(())
    }

    /// Rebuild the workspace pool after thread-count or hash-exponent
    /// parameter changes.
    pub fn update_workspace_pool(&self) {
        let params = self.params.read().clone();
        self.rebuild_workspace_pool(&params);
    }

    fn rebuild_workspace_pool(&self, params: &Params) {
        *self.workspace_pool.write() = Arc::new(WorkspacePool::new(
            params.number_of_threads,
            params.hash_table_exponent,
        ));
    }

    fn make_thread_pool(&self, threads: usize) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .build()
            .map_err(|e| EngineError::Fail(format!("cannot build thread pool: {e}")))
    }

    fn forest_params(params: &Params) -> ForestParams {
        ForestParams {
            num_trees: params.number_of_trees,
            top_dims: params.top_dimensions_in_tree_node,
            samples_per_node: params.samples_per_node_in_tree,
        }
    }

    // ---- build --------------------------------------------------------------

    /// Build the index over `n` packed `dim`-dimensional vectors. Rows are
    /// normalized in parallel when the metric is cosine and the data is not
    /// already normalized.
    pub fn build(&self, data: &[T], n: usize, dim: usize, normalized: bool) -> Result<()> {
        if data.is_empty() || n == 0 || dim == 0 {
            return Err(EngineError::EmptyData);
        }
        if data.len() != n * dim {
            return Err(EngineError::DimensionMismatch {
                expected: n * dim,
                got: data.len(),
            });
        }
        let params = self.params.read().clone();
        let pool = self.make_thread_pool(params.number_of_threads)?;
        {
            let mut samples = self.samples.write();
            *samples = BlockStore::with_data(
                data,
                n,
                dim,
                params.data_block_size,
                params.data_capacity,
            )?;
            if params.dist_calc_method == DistCalcMethod::Cosine && !normalized {
                samples.for_each_row_mut_parallel(&pool, |row| normalize_row(row));
            }
        }
        *self.deleted.write() = DeletedSet::new(n);
        self.rebuild_workspace_pool(&params);

        let started = Instant::now();
        {
            let samples = self.samples.read();
            let ids: Vec<i32> = (0..n as i32).collect();
            let forest =
                KdForest::build(&samples, &ids, Self::forest_params(&params), &pool);
            *self.trees.write() = forest;
        }
        tracing::info!(
            rows = n,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "built kd forest"
        );

        let started = Instant::now();
        self.graph
            .initialize(n, params.neighborhood_size.max(1), params.data_capacity);
        self.build_graph(&params, &pool);
        tracing::info!(
            rows = n,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "built neighborhood graph"
        );

        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Fill every adjacency row from a widened tree-seeded search, then run
    /// one more pass so rows can exploit the first pass's edges.
    fn build_graph(&self, params: &Params, pool: &rayon::ThreadPool) {
        let rows = self.samples.read().rows() as i32;
        for _ in 0..2 {
            pool.install(|| {
                (0..rows)
                    .into_par_iter()
                    .for_each(|vid| self.refine_node(vid, false, false, params.cef));
            });
        }
    }

    // ---- search -------------------------------------------------------------

    /// Top-k search with default options (deletion-aware, no metadata).
    pub fn search(&self, query: &[T], k: usize) -> Result<Vec<SearchResult>> {
        self.search_with_options(query, k, &SearchOptions::default())
    }

    /// Top-k search. Picks the raw traversal when there are no tombstones
    /// or the caller asked for deleted ids.
    pub fn search_with_options(
        &self,
        query: &[T],
        k: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        if !self.is_ready() {
            return Err(EngineError::EmptyIndex);
        }
        let dim = self.dim();
        if query.len() != dim {
            return Err(EngineError::DimensionMismatch {
                expected: dim,
                got: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let params = self.params.read().clone();
        let query = QueryVectors::new(query, params.dist_calc_method);
        let skip_deleted = !opts.search_deleted && self.deleted.read().count() > 0;
        let mut results = QueryResultSet::new(k);
        {
            let pool = self.workspace_pool.read().clone();
            let mut ws = pool.rent();
            ws.reset(params.max_check);
            self.search_core(&query, &mut results, &mut ws, skip_deleted, &params);
        }
        Ok(self.collect_results(&results, opts.with_metadata))
    }

    /// Tree-only search: seed from the forest and drain the candidate queue
    /// without graph expansion.
    pub fn search_tree_only(&self, query: &[T], k: usize) -> Result<Vec<SearchResult>> {
        if !self.is_ready() {
            return Err(EngineError::EmptyIndex);
        }
        let dim = self.dim();
        if query.len() != dim {
            return Err(EngineError::DimensionMismatch {
                expected: dim,
                got: query.len(),
            });
        }
        let params = self.params.read().clone();
        let query = QueryVectors::new(query, params.dist_calc_method);
        let pool = self.workspace_pool.read().clone();
        let mut ws = pool.rent();
        ws.reset(params.max_check_for_refine_graph);
        let dist = self.dist_state.read().dist;
        let samples = self.samples.read();
        let trees = self.trees.read();
        trees.init_search(&mut ws);
        trees.search_trees(&samples, dist, &query, &mut ws, params.initial_dynamic_pivots);
        let mut out = Vec::with_capacity(k);
        while out.len() < k {
            match ws.ng_queue.pop() {
                Some(Reverse(cell)) => out.push(SearchResult {
                    vid: cell.vid,
                    dist: cell.dist.0,
                    metadata: None,
                }),
                None => break,
            }
        }
        Ok(out)
    }

    /// The best-first loop. The caller has reset `ws` and decided the
    /// tombstone mode; result entries land in `results`, sorted.
    fn search_core(
        &self,
        query: &QueryVectors<T>,
        results: &mut QueryResultSet,
        ws: &mut SearchWorkspace,
        skip_deleted: bool,
        params: &Params,
    ) {
        let dist = self.dist_state.read().dist;
        let samples = self.samples.read();
        let trees = self.trees.read();
        let graph = self.graph.read();
        let deleted = self.deleted.read();
        let target = query.quantized_target();

        trees.init_search(ws);
        trees.search_trees(&samples, dist, query, ws, params.initial_dynamic_pivots);

        while let Some(Reverse(cell)) = ws.ng_queue.pop() {
            let (gvid, gdist) = (cell.vid, cell.dist.0);
            let row = if (gvid as usize) < graph.rows() {
                graph.prefetch_row(gvid);
                let row = graph.row(gvid);
                for c in row {
                    let n = c.load(Ordering::Relaxed);
                    if n < 0 {
                        break;
                    }
                    samples.prefetch_row(n);
                }
                Some(row)
            } else {
                None
            };

            if !(skip_deleted && deleted.contains(gvid)) {
                if !results.add_point(gvid, gdist) && ws.checked_leaves > ws.max_check {
                    results.sort_result();
                    return;
                }
            }

            let upper_bound = results.worst_dist().max(gdist);
            let mut local_opt = true;
            if let Some(row) = row {
                for c in row {
                    let n = c.load(Ordering::Relaxed);
                    if n < 0 {
                        break;
                    }
                    if ws.visited.check_and_set(n) {
                        continue;
                    }
                    let d = dist(target, samples.row(n));
                    if d <= upper_bound {
                        local_opt = false;
                    }
                    ws.checked_leaves += 1;
                    ws.ng_queue.push(Reverse(HeapCell::new(n, d)));
                }
            }

            if local_opt {
                ws.no_better_propagation += 1;
            } else {
                ws.no_better_propagation = 0;
            }
            if ws.no_better_propagation > params.no_better_propagation_threshold {
                if ws.tree_checked_leaves <= ws.checked_leaves / 10 {
                    trees.search_trees(
                        &samples,
                        dist,
                        query,
                        ws,
                        params.other_dynamic_pivots + ws.checked_leaves,
                    );
                } else if gdist > results.worst_dist() {
                    break;
                }
            }
        }
        results.sort_result();
    }

    fn collect_results(&self, results: &QueryResultSet, with_metadata: bool) -> Vec<SearchResult> {
        let metadata = if with_metadata {
            Some(self.metadata.read())
        } else {
            None
        };
        results
            .results()
            .iter()
            .map(|e| SearchResult {
                vid: e.vid,
                dist: e.dist,
                metadata: metadata.as_ref().and_then(|guard| {
                    guard.as_deref().map(|store| {
                        if e.vid < 0 {
                            Vec::new()
                        } else {
                            store.get_copy(e.vid)
                        }
                    })
                }),
            })
            .collect()
    }

    /// Weave `vid` into the graph: search from its own vector with a `cef`
    /// result buffer, rebuild its row from the merged candidates, and when
    /// reciprocating, offer `vid` to each selected neighbor's row.
    fn refine_node(&self, vid: i32, update_neighbors: bool, reciprocate: bool, cef: usize) {
        let params = self.params.read().clone();
        let query = {
            let samples = self.samples.read();
            QueryVectors::from_stored(samples.row(vid))
        };
        let mut results = QueryResultSet::new(cef + 1);
        {
            let pool = self.workspace_pool.read().clone();
            let mut ws = pool.rent();
            ws.reset(params.max_check_for_refine_graph);
            self.search_core(&query, &mut results, &mut ws, false, &params);
        }
        let dist = self.dist_state.read().dist;
        let samples = self.samples.read();
        let graph = self.graph.read();
        self.graph
            .rebuild_row(&graph, &samples, dist, vid, results.results());
        if update_neighbors && reciprocate {
            for r in results.results() {
                if r.vid != vid {
                    self.graph
                        .insert_neighbor(&graph, &samples, dist, r.vid, vid, r.dist);
                }
            }
        }
    }

    // ---- add ----------------------------------------------------------------

    /// Append vectors online. See [`Index::add_with_metadata`].
    pub fn add(&self, data: &[T], n: usize, dim: usize, normalized: bool) -> Result<()> {
        self.add_with_metadata(data, n, dim, normalized, None, false)
    }

    /// Append `n` vectors, optionally with one metadata payload each.
    ///
    /// On an empty index this primes the metadata store and delegates to
    /// [`Index::build`]. Otherwise the rows are appended to the store, graph,
    /// and deleted set under the add lock; a failed append restores all
    /// three to their pre-call sizes. After the lock is released each new id
    /// is woven into the graph, and a background tree rebuild is scheduled
    /// once enough rows have accumulated since the last build.
    pub fn add_with_metadata(
        &self,
        data: &[T],
        n: usize,
        dim: usize,
        normalized: bool,
        metadata: Option<Vec<Vec<u8>>>,
        with_meta_index: bool,
    ) -> Result<()> {
        if data.is_empty() || n == 0 || dim == 0 {
            return Err(EngineError::EmptyData);
        }
        if data.len() != n * dim {
            return Err(EngineError::DimensionMismatch {
                expected: n * dim,
                got: data.len(),
            });
        }
        if let Some(records) = &metadata {
            if records.len() != n {
                return Err(EngineError::LackOfInputs);
            }
        }
        let params = self.params.read().clone();
        let begin;
        {
            let _add = self.add_lock.lock();
            begin = self.samples.read().rows();
            if begin == 0 {
                if let Some(records) = metadata {
                    *self.metadata.write() =
                        Some(Box::new(MemMetadataStore::with_records(records)));
                    if with_meta_index {
                        self.build_meta_mapping();
                    }
                }
                return self.build(data, n, dim, normalized);
            }
            {
                let samples = self.samples.read();
                if dim != samples.dim() {
                    return Err(EngineError::DimensionMismatch {
                        expected: samples.dim(),
                        got: dim,
                    });
                }
            }
            let mut append = self.samples.write().add_batch(data, n);
            if append.is_ok() {
                append = self.graph.add_batch(n);
            }
            if append.is_ok() {
                append = self.deleted.write().add_batch(n);
            }
            if let Err(e) = append {
                self.samples.write().set_rows(begin);
                self.graph.set_rows(begin);
                self.deleted.write().set_rows(begin);
                tracing::warn!(begin, n, "add failed, restored pre-call sizes");
                return Err(e);
            }
            if params.dist_calc_method == DistCalcMethod::Cosine && !normalized {
                let mut samples = self.samples.write();
                for i in begin..begin + n {
                    normalize_row(samples.row_mut(i as i32));
                }
            }
            let mut store = self.metadata.write();
            if let Some(store) = store.as_deref_mut() {
                match &metadata {
                    Some(records) => {
                        let mut mapping = self.meta_mapping.write();
                        for (i, record) in records.iter().enumerate() {
                            store.add(record.clone());
                            if let Some(mapping) = mapping.as_mut() {
                                mapping.insert(record.clone(), (begin + i) as i32);
                            }
                        }
                    }
                    None => {
                        for _ in 0..n {
                            store.add(Vec::new());
                        }
                    }
                }
            }
        }

        let end = begin + n;
        if end - self.trees.read().rows_when_built() >= params.add_count_for_rebuild_trees {
            self.maybe_schedule_rebuild(&params);
        }
        for vid in begin..end {
            self.refine_node(vid as i32, true, true, params.add_cef);
        }
        Ok(())
    }

    /// Post a tree-rebuild job unless one is already pending. The job
    /// snapshots the store, builds a fresh forest off-thread, and swaps it
    /// in under the tree write lock; failure leaves the old trees intact.
    fn maybe_schedule_rebuild(&self, params: &Params) {
        if self
            .rebuild_gate
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let samples = Arc::clone(&self.samples);
        let trees = Arc::clone(&self.trees);
        let deleted = Arc::clone(&self.deleted);
        let gate = Arc::clone(&self.rebuild_gate);
        let forest_params = Self::forest_params(params);
        let threads = params.number_of_threads;
        std::thread::spawn(move || {
            let snapshot = samples.read().clone();
            let ids: Vec<i32> = {
                let deleted = deleted.read();
                (0..snapshot.rows() as i32)
                    .filter(|&vid| !deleted.contains(vid))
                    .collect()
            };
            match rayon::ThreadPoolBuilder::new()
                .num_threads(threads.max(1))
                .build()
            {
                Ok(pool) if !ids.is_empty() => {
                    let forest = KdForest::build(&snapshot, &ids, forest_params, &pool);
                    *trees.write() = forest;
                    tracing::info!(rows = snapshot.rows(), "background tree rebuild complete");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("background tree rebuild dropped: {e}");
                }
            }
            gate.store(false, Ordering::Release);
        });
    }

    // ---- delete -------------------------------------------------------------

    /// Tombstone `vid`. Returns `VectorNotFound` when the id is out of
    /// range or already deleted.
    pub fn delete_by_id(&self, vid: i32) -> Result<()> {
        if !self.is_ready() {
            return Err(EngineError::EmptyIndex);
        }
        let _guard = self.delete_lock.read();
        let rows = self.samples.read().rows();
        if vid < 0 || vid as usize >= rows {
            return Err(EngineError::VectorNotFound);
        }
        if self.deleted.read().insert(vid) {
            Ok(())
        } else {
            Err(EngineError::VectorNotFound)
        }
    }

    /// Tombstone near-duplicates of the given vectors: each query runs a
    /// deletion-aware search and every hit closer than 1e-6 is deleted.
    pub fn delete(&self, vectors: &[T], n: usize) -> Result<()> {
        if !self.is_ready() {
            return Err(EngineError::EmptyIndex);
        }
        if vectors.is_empty() || n == 0 {
            return Err(EngineError::EmptyData);
        }
        let dim = self.dim();
        if vectors.len() != n * dim {
            return Err(EngineError::DimensionMismatch {
                expected: n * dim,
                got: vectors.len(),
            });
        }
        let params = self.params.read().clone();
        let pool = self.make_thread_pool(params.number_of_threads)?;
        pool.install(|| {
            (0..n).into_par_iter().for_each(|i| {
                let query = &vectors[i * dim..(i + 1) * dim];
                if let Ok(results) = self.search_with_options(
                    query,
                    params.cef,
                    &SearchOptions::default(),
                ) {
                    for r in results {
                        if r.dist < 1e-6 {
                            let _ = self.delete_by_id(r.vid);
                        }
                    }
                }
            });
        });
        Ok(())
    }

    // ---- refine -------------------------------------------------------------

    /// Compact tombstoned rows into a fresh engine: surviving rows are
    /// permuted down via tail-swap, trees are rebuilt over the compacted
    /// store, graph rows are remapped, and the new deleted set is empty.
    pub fn refine(&self) -> Result<Index<T>> {
        let params = self.params.read().clone();
        let new_index = Index::<T>::with_params(params.clone());

        let _add = self.add_lock.lock();
        let _del = self.delete_lock.write();
        let samples = self.samples.read();
        let deleted = self.deleted.read();
        let rows = samples.rows();
        let (indices, reverse, new_rows) = tail_swap_permutation(rows, &deleted);
        tracing::info!(from = rows, to = new_rows, "refining index");
        if new_rows == 0 {
            return Err(EngineError::EmptyIndex);
        }
        let pool = self.make_thread_pool(params.number_of_threads)?;
        let dist = self.dist_state.read().dist;

        *new_index.samples.write() = samples.refine(&indices)?;
        {
            let metadata = self.metadata.read();
            if let Some(store) = metadata.as_deref() {
                *new_index.metadata.write() = Some(store.refine(&indices));
            }
        }
        *new_index.deleted.write() = DeletedSet::new(new_rows);
        new_index.rebuild_workspace_pool(&params);
        {
            let new_samples = new_index.samples.read();
            let ids: Vec<i32> = (0..new_rows as i32).collect();
            *new_index.trees.write() =
                KdForest::build(&new_samples, &ids, Self::forest_params(&params), &pool);
        }
        let k = self.graph.read().k();
        let compacted = self.graph.refine(
            &samples,
            dist,
            &indices,
            &reverse,
            |n| deleted.contains(n),
            &pool,
        );
        new_index.graph.install_rows(compacted, k, params.data_capacity);
        if self.meta_mapping.read().is_some() {
            new_index.build_meta_mapping();
        }
        new_index.ready.store(true, Ordering::Release);
        Ok(new_index)
    }

    /// Streaming compaction: writes the four blobs (plus metadata streams
    /// when a metadata store is attached) without building an in-memory
    /// engine. The abort probe is checked before trees, before the graph,
    /// and before metadata; on `ExternalAbort` all outputs are invalid.
    pub fn refine_to_streams(
        &self,
        out: &mut RefineStreams<'_>,
        abort: Option<&dyn AbortProbe>,
    ) -> Result<()> {
        let params = self.params.read().clone();

        let _add = self.add_lock.lock();
        let _del = self.delete_lock.write();
        let samples = self.samples.read();
        let deleted = self.deleted.read();
        let rows = samples.rows();
        let (indices, reverse, new_rows) = tail_swap_permutation(rows, &deleted);
        tracing::info!(from = rows, to = new_rows, "refining index to streams");
        if new_rows == 0 {
            return Err(EngineError::EmptyIndex);
        }
        let pool = self.make_thread_pool(params.number_of_threads)?;

        samples.refine_to(&indices, out.samples)?;
        if abort.is_some_and(|probe| probe.should_abort()) {
            return Err(EngineError::ExternalAbort);
        }

        let mut forest =
            KdForest::build(&samples, &indices, Self::forest_params(&params), &pool);
        forest.remap_leaves(&reverse, &pool);
        forest.save(out.trees)?;
        if abort.is_some_and(|probe| probe.should_abort()) {
            return Err(EngineError::ExternalAbort);
        }

        let dist = self.dist_state.read().dist;
        let k = self.graph.read().k();
        let compacted = self.graph.refine(
            &samples,
            dist,
            &indices,
            &reverse,
            |n| deleted.contains(n),
            &pool,
        );
        NeighborhoodGraph::save_rows(&compacted, k, out.graph)?;
        DeletedSet::new(new_rows).save(out.deleted)?;
        if abort.is_some_and(|probe| probe.should_abort()) {
            return Err(EngineError::ExternalAbort);
        }

        let metadata = self.metadata.read();
        if let Some(store) = metadata.as_deref() {
            let Some((meta_out, offsets_out)) = out.metadata.as_mut() else {
                return Err(EngineError::LackOfInputs);
            };
            store.refine_to(&indices, &mut **meta_out, &mut **offsets_out)?;
        }
        Ok(())
    }

    // ---- persistence --------------------------------------------------------

    /// Write the four snapshot blobs under both mutation locks.
    pub fn save_index_data<WS, WT, WG, WD>(
        &self,
        samples_out: &mut WS,
        trees_out: &mut WT,
        graph_out: &mut WG,
        deleted_out: &mut WD,
    ) -> Result<()>
    where
        WS: Write + ?Sized,
        WT: Write + ?Sized,
        WG: Write + ?Sized,
        WD: Write + ?Sized,
    {
        let _add = self.add_lock.lock();
        let _del = self.delete_lock.write();
        self.samples.read().save(samples_out)?;
        self.trees.read().save(trees_out)?;
        self.graph.save(graph_out)?;
        self.deleted.read().save(deleted_out)?;
        Ok(())
    }

    /// Load the snapshot blobs. A missing deleted stream initializes an
    /// empty deleted set over the loaded rows. A failed or inconsistent
    /// load leaves the engine not ready.
    pub fn load_index_data<RS, RT, RG, RD>(
        &self,
        samples_in: &mut RS,
        trees_in: &mut RT,
        graph_in: &mut RG,
        deleted_in: Option<&mut RD>,
    ) -> Result<()>
    where
        RS: Read + ?Sized,
        RT: Read + ?Sized,
        RG: Read + ?Sized,
        RD: Read + ?Sized,
    {
        self.ready.store(false, Ordering::Release);
        let params = self.params.read().clone();
        let store = BlockStore::<T>::load(samples_in)?;
        let rows = store.rows();
        let forest = KdForest::load(trees_in, rows)?;
        let deleted = match deleted_in {
            Some(r) => DeletedSet::load(r)?,
            None => DeletedSet::new(rows),
        };
        self.graph.load(graph_in, params.data_capacity.max(rows))?;
        if self.graph.read().rows() != rows || deleted.len() != rows {
            return Err(EngineError::FailedParseValue(format!(
                "blob row counts disagree: samples={rows}, graph={}, deleted={}",
                self.graph.read().rows(),
                deleted.len()
            )));
        }
        *self.samples.write() = store;
        *self.trees.write() = forest;
        *self.deleted.write() = deleted;
        self.rebuild_workspace_pool(&params);
        self.ready.store(rows > 0, Ordering::Release);
        Ok(())
    }

    /// Load from in-memory blobs in stream order (samples, trees, graph,
    /// and optionally deleted).
    pub fn load_index_data_from_memory(&self, blobs: &[&[u8]]) -> Result<()> {
        if blobs.len() < 3 {
            return Err(EngineError::LackOfInputs);
        }
        let mut samples = blobs[0];
        let mut trees = blobs[1];
        let mut graph = blobs[2];
        if blobs.len() > 3 {
            let mut deleted = blobs[3];
            self.load_index_data(&mut samples, &mut trees, &mut graph, Some(&mut deleted))
        } else {
            self.load_index_data(&mut samples, &mut trees, &mut graph, None::<&mut &[u8]>)
        }
    }

    // ---- metadata mapping ---------------------------------------------------

    /// Build the payload → vid mapping from the attached metadata store.
    pub fn build_meta_mapping(&self) {
        let metadata = self.metadata.read();
        let Some(store) = metadata.as_deref() else {
            return;
        };
        let mut mapping = HashMap::with_capacity(store.count());
        for vid in 0..store.count() as i32 {
            let record = store.get_copy(vid);
            if !record.is_empty() {
                mapping.insert(record, vid);
            }
        }
        *self.meta_mapping.write() = Some(mapping);
    }

    /// Whether a payload → vid mapping is maintained.
    pub fn has_meta_mapping(&self) -> bool {
        self.meta_mapping.read().is_some()
    }

    /// Look up the vid carrying `payload`, if the mapping is maintained.
    pub fn vid_by_metadata(&self, payload: &[u8]) -> Option<i32> {
        self.meta_mapping
            .read()
            .as_ref()
            .and_then(|m| m.get(payload).copied())
    }
}

/// Compute the tail-swap compaction permutation: surviving ids keep their
/// position where possible, and holes left by tombstones are filled from the
/// live tail. Returns `(indices, reverse, new_rows)` with
/// `indices.len() == new_rows` and `reverse[old] == new` for every survivor.
pub(crate) fn tail_swap_permutation(
    rows: usize,
    deleted: &DeletedSet,
) -> (Vec<i32>, Vec<i32>, usize) {
    let mut new_rows = rows;
    let mut indices: Vec<i32> = Vec::new();
    let mut reverse = vec![0i32; rows];
    let mut i = 0usize;
    while i < new_rows {
        if !deleted.contains(i as i32) {
            indices.push(i as i32);
            reverse[i] = i as i32;
        } else {
            while new_rows > i && deleted.contains(new_rows as i32 - 1) {
                new_rows -= 1;
            }
            if new_rows == i {
                break;
            }
            indices.push(new_rows as i32 - 1);
            reverse[new_rows - 1] = i as i32;
            new_rows -= 1;
        }
        i += 1;
    }
    debug_assert_eq!(indices.len(), new_rows);
    (indices, reverse, new_rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_params() -> Params {
        let mut p = Params::default();
        p.number_of_threads = 2;
        p.neighborhood_size = 4;
        p.number_of_trees = 2;
        p.cef = 16;
        p.add_cef = 16;
        p
    }

    fn build_line_index(n: usize) -> Index<f32> {
        let index = Index::<f32>::with_params(small_params());
        let data: Vec<f32> = (0..n).map(|i| i as f32).collect();
        index.build(&data, n, 1, true).unwrap();
        index
    }

    #[test]
    fn test_build_rejects_empty_input() {
        let index = Index::<f32>::new();
        assert!(matches!(
            index.build(&[], 0, 0, true).unwrap_err(),
            EngineError::EmptyData
        ));
        assert!(!index.is_ready());
    }

    #[test]
    fn test_search_before_build_is_empty_index() {
        let index = Index::<f32>::new();
        assert!(matches!(
            index.search(&[1.0], 3).unwrap_err(),
            EngineError::EmptyIndex
        ));
    }

    #[test]
    fn test_build_and_exact_search() {
        let index = build_line_index(32);
        let results = index.search(&[10.2], 3).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].vid, 10);
        assert_eq!(results[1].vid, 11);
        assert_eq!(results[2].vid, 9);
        assert!(results[0].dist <= results[1].dist);
    }

    #[test]
    fn test_search_dimension_mismatch() {
        let index = build_line_index(8);
        assert!(matches!(
            index.search(&[1.0, 2.0], 1).unwrap_err(),
            EngineError::DimensionMismatch { .. }
        ));
    }

    #[test]
    fn test_search_k_zero_is_empty() {
        let index = build_line_index(8);
        assert!(index.search(&[1.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_add_on_empty_index_delegates_to_build() {
        let index = Index::<f32>::with_params(small_params());
        let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
        index.add(&data, 16, 1, true).unwrap();
        assert!(index.is_ready());
        assert_eq!(index.rows(), 16);
        assert_eq!(index.search(&[3.1], 1).unwrap()[0].vid, 3);
    }

    #[test]
    fn test_add_appends_and_finds_new_rows() {
        let index = build_line_index(16);
        index.add(&[100.0, 101.0], 2, 1, true).unwrap();
        assert_eq!(index.rows(), 18);
        let results = index.search(&[100.4], 2).unwrap();
        assert_eq!(results[0].vid, 16);
        assert_eq!(results[1].vid, 17);
    }

    #[test]
    fn test_add_overflow_restores_sizes() {
        let mut params = small_params();
        params.data_capacity = 10;
        let index = Index::<f32>::with_params(params);
        let data: Vec<f32> = (0..8).map(|i| i as f32).collect();
        index.build(&data, 8, 1, true).unwrap();
        let err = index.add(&[8.0, 9.0, 10.0], 3, 1, true).unwrap_err();
        assert!(matches!(err, EngineError::MemoryOverflow));
        assert_eq!(index.rows(), 8);
        assert_eq!(index.graph.read().rows(), 8);
        assert_eq!(index.deleted.read().len(), 8);
        // A fitting batch still works afterwards.
        index.add(&[8.0, 9.0], 2, 1, true).unwrap();
        assert_eq!(index.rows(), 10);
    }

    #[test]
    fn test_delete_by_id_semantics() {
        let index = build_line_index(8);
        assert!(index.delete_by_id(3).is_ok());
        assert!(matches!(
            index.delete_by_id(3).unwrap_err(),
            EngineError::VectorNotFound
        ));
        assert!(matches!(
            index.delete_by_id(100).unwrap_err(),
            EngineError::VectorNotFound
        ));
        assert!(matches!(
            index.delete_by_id(-1).unwrap_err(),
            EngineError::VectorNotFound
        ));
        assert_eq!(index.deleted_count(), 1);
    }

    #[test]
    fn test_delete_by_vector_marks_near_duplicates() {
        let index = build_line_index(8);
        index.delete(&[5.0], 1).unwrap();
        assert_eq!(index.deleted_count(), 1);
        let results = index.search(&[5.0], 3).unwrap();
        assert!(results.iter().all(|r| r.vid != 5));
    }

    #[test]
    fn test_deleted_skipped_unless_requested() {
        let index = build_line_index(8);
        index.delete_by_id(2).unwrap();
        let aware = index.search(&[2.0], 3).unwrap();
        assert!(aware.iter().all(|r| r.vid != 2));
        let raw = index
            .search_with_options(
                &[2.0],
                3,
                &SearchOptions {
                    search_deleted: true,
                    with_metadata: false,
                },
            )
            .unwrap();
        assert_eq!(raw[0].vid, 2);
    }

    #[test]
    fn test_set_parameter_re_resolves_distance() {
        let index = Index::<f32>::new();
        assert_eq!(index.base_square(), 1.0);
        index.set_parameter("DistCalcMethod", "Cosine").unwrap();
        assert_eq!(index.base_square(), 1.0);
        assert_eq!(index.get_parameter("DistCalcMethod").unwrap(), "Cosine");
        let int_index = Index::<i8>::new();
        int_index.set_parameter("DistCalcMethod", "Cosine").unwrap();
        assert_eq!(int_index.base_square(), 127.0 * 127.0);
        int_index.set_parameter("DistCalcMethod", "L2").unwrap();
        assert_eq!(int_index.base_square(), 1.0);
    }

    #[test]
    fn test_set_parameter_rejects_garbage() {
        let index = Index::<f32>::new();
        assert!(index.set_parameter("MaxCheck", "banana").is_err());
        assert!(index.set_parameter("Nonexistent", "1").is_err());
    }

    #[test]
    fn test_tail_swap_permutation_fills_holes_from_tail() {
        let deleted = DeletedSet::new(6);
        deleted.insert(1);
        let (indices, reverse, new_rows) = tail_swap_permutation(6, &deleted);
        assert_eq!(new_rows, 5);
        assert_eq!(indices, vec![0, 5, 2, 3, 4]);
        assert_eq!(reverse[0], 0);
        assert_eq!(reverse[5], 1);
        assert_eq!(reverse[2], 2);
    }

    #[test]
    fn test_tail_swap_permutation_all_deleted() {
        let deleted = DeletedSet::new(4);
        for vid in 0..4 {
            deleted.insert(vid);
        }
        let (indices, _, new_rows) = tail_swap_permutation(4, &deleted);
        assert_eq!(new_rows, 0);
        assert!(indices.is_empty());
    }

    #[test]
    fn test_tail_swap_permutation_deleted_tail() {
        let deleted = DeletedSet::new(5);
        deleted.insert(3);
        deleted.insert(4);
        let (indices, _, new_rows) = tail_swap_permutation(5, &deleted);
        assert_eq!(new_rows, 3);
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_refine_compacts_and_clears_tombstones() {
        let index = build_line_index(16);
        for vid in [0, 5, 15] {
            index.delete_by_id(vid).unwrap();
        }
        let refined = index.refine().unwrap();
        assert_eq!(refined.rows(), 13);
        assert_eq!(refined.deleted_count(), 0);
        // 0, 5, 15 are gone; their values no longer exist anywhere.
        let results = refined.search(&[5.0], 1).unwrap();
        let hit = &results[0];
        let store = refined.samples.read();
        let value = store.row(hit.vid)[0];
        assert!(value == 4.0 || value == 6.0);
    }

    #[test]
    fn test_refine_empty_is_error() {
        let index = build_line_index(4);
        for vid in 0..4 {
            index.delete_by_id(vid).unwrap();
        }
        assert!(matches!(
            index.refine().unwrap_err(),
            EngineError::EmptyIndex
        ));
    }

    #[test]
    fn test_metadata_attach_and_mapping() {
        let index = Index::<f32>::with_params(small_params());
        let data: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let records: Vec<Vec<u8>> = (0..8).map(|i| format!("doc-{i}").into_bytes()).collect();
        index
            .add_with_metadata(&data, 8, 1, true, Some(records), true)
            .unwrap();
        assert!(index.has_meta_mapping());
        assert_eq!(index.vid_by_metadata(b"doc-3"), Some(3));
        let results = index
            .search_with_options(
                &[3.0],
                1,
                &SearchOptions {
                    search_deleted: false,
                    with_metadata: true,
                },
            )
            .unwrap();
        assert_eq!(results[0].metadata.as_deref(), Some(&b"doc-3"[..]));
    }

    #[test]
    fn test_search_tree_only_returns_candidates() {
        let index = build_line_index(32);
        let results = index.search_tree_only(&[7.3], 3).unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].vid, 7);
    }

    #[test]
    fn test_update_workspace_pool_applies_new_exponent() {
        let index = build_line_index(8);
        index.set_parameter("HashTableExponent", "10").unwrap();
        index.update_workspace_pool();
        let pool = index.workspace_pool.read().clone();
        let ws = pool.rent();
        assert_eq!(ws.visited.exponent(), 10);
    }
}
