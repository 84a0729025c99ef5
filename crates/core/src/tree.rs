//! Randomized KD-forest.
//!
//! A small set of independent KD trees over the sample store. Each tree is
//! built by recursively splitting a shuffled id permutation at the mean of a
//! dimension drawn at random from the highest-variance dimensions of a node
//! sample; the random draw is what de-correlates the trees. Leaves encode a
//! vector id as a negative child (`-vid - 1`).
//!
//! At query time the forest seeds the workspace: the descent follows the
//! near child of every split and parks the far child on a priority queue
//! keyed by the accumulated boundary distance, so later re-seeds resume from
//! the globally most promising unexplored subtree across all trees.

use std::cmp::Reverse;
use std::io::{Read, Write};

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rayon::prelude::*;

use crate::distance::DistFn;
use crate::element::VectorValue;
use crate::error::{EngineError, Result};
use crate::persistence::{read_f32, read_i32, write_f32, write_i32};
use crate::query::QueryVectors;
use crate::store::BlockStore;
use crate::workspace::{HeapCell, SearchWorkspace, TreeCell};

/// `true` when a child reference encodes a leaf rather than a node index.
#[inline]
pub fn is_leaf(child: i32) -> bool {
    child < 0
}

/// Recover the vector id from a leaf child reference.
#[inline]
pub fn leaf_vid(child: i32) -> i32 {
    -child - 1
}

/// One internal split. Children are within-tree node indices, or encoded
/// leaves when negative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KdTreeNode {
    pub split_dim: i32,
    pub split_value: f32,
    pub left: i32,
    pub right: i32,
}

/// A single tree: node 0 is the root. Never empty once built.
#[derive(Debug, Clone, Default)]
pub struct KdTree {
    pub nodes: Vec<KdTreeNode>,
}

/// Build-time tuning shared by all trees of a forest.
#[derive(Debug, Clone, Copy)]
pub struct ForestParams {
    pub num_trees: usize,
    pub top_dims: usize,
    pub samples_per_node: usize,
}

/// The randomized KD-forest over the current sample set.
#[derive(Debug, Default)]
pub struct KdForest {
    trees: Vec<KdTree>,
    /// Row count the forest was built over; adds beyond it are invisible to
    /// the descent until the next rebuild.
    rows_when_built: usize,
}

impl KdForest {
    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    pub fn rows_when_built(&self) -> usize {
        self.rows_when_built
    }

    pub fn total_nodes(&self) -> usize {
        self.trees.iter().map(|t| t.nodes.len()).sum()
    }

    /// Build the forest over `ids`, one tree per parallel task.
    pub fn build<T: VectorValue>(
        store: &BlockStore<T>,
        ids: &[i32],
        params: ForestParams,
        pool: &rayon::ThreadPool,
    ) -> Self {
        Self::build_seeded(store, ids, params, pool, rand::thread_rng().next_u64())
    }

    /// Deterministic build used by tests and by anyone who wants
    /// reproducible forests.
    pub fn build_seeded<T: VectorValue>(
        store: &BlockStore<T>,
        ids: &[i32],
        params: ForestParams,
        pool: &rayon::ThreadPool,
        seed: u64,
    ) -> Self {
        let num_trees = params.num_trees.max(1);
        let trees: Vec<KdTree> = pool.install(|| {
            (0..num_trees)
                .into_par_iter()
                .map(|t| {
                    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(t as u64));
                    build_one_tree(store, ids, params, &mut rng)
                })
                .collect()
        });
        Self {
            trees,
            rows_when_built: store.rows(),
        }
    }

    /// Push every tree root onto the workspace's descent queue.
    pub fn init_search(&self, ws: &mut SearchWorkspace) {
        for (t, tree) in self.trees.iter().enumerate() {
            if !tree.nodes.is_empty() {
                ws.tree_queue.push(Reverse(TreeCell {
                    dist: 0.0.into(),
                    tree: t as u32,
                    node: 0,
                }));
            }
        }
    }

    /// Drain the descent queue until `limit` total leaves have been checked
    /// (or the queue runs dry). Each new leaf is marked visited, scored, and
    /// pushed onto the workspace's candidate queue.
    pub fn search_trees<T: VectorValue>(
        &self,
        store: &BlockStore<T>,
        dist: DistFn<T>,
        query: &QueryVectors<T>,
        ws: &mut SearchWorkspace,
        limit: usize,
    ) {
        while let Some(Reverse(cell)) = ws.tree_queue.pop() {
            self.descend(cell.tree, cell.node, cell.dist.0, store, dist, query, ws);
            if ws.checked_leaves >= limit {
                break;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn descend<T: VectorValue>(
        &self,
        tree: u32,
        mut node: i32,
        bound: f32,
        store: &BlockStore<T>,
        dist: DistFn<T>,
        query: &QueryVectors<T>,
        ws: &mut SearchWorkspace,
    ) {
        let nodes = &self.trees[tree as usize].nodes;
        let target = query.quantized_target();
        loop {
            if is_leaf(node) {
                let vid = leaf_vid(node);
                if (vid as usize) >= store.rows() || ws.visited.check_and_set(vid) {
                    return;
                }
                let d = dist(target, store.row(vid));
                ws.tree_checked_leaves += 1;
                ws.checked_leaves += 1;
                ws.ng_queue.push(Reverse(HeapCell::new(vid, d)));
                return;
            }
            let n = &nodes[node as usize];
            let diff = target[n.split_dim as usize].to_f32() - n.split_value;
            let (near, far) = if diff < 0.0 {
                (n.left, n.right)
            } else {
                (n.right, n.left)
            };
            ws.tree_queue.push(Reverse(TreeCell {
                dist: (bound + diff * diff).into(),
                tree,
                node: far,
            }));
            node = near;
        }
    }

    /// Rewrite every leaf id through the compaction permutation:
    /// `-child-1` becomes `-reverse[-child-1]-1`.
    pub fn remap_leaves(&mut self, reverse: &[i32], pool: &rayon::ThreadPool) {
        pool.install(|| {
            self.trees.par_iter_mut().for_each(|tree| {
                for node in tree.nodes.iter_mut() {
                    if is_leaf(node.left) {
                        node.left = -reverse[leaf_vid(node.left) as usize] - 1;
                    }
                    if is_leaf(node.right) {
                        node.right = -reverse[leaf_vid(node.right) as usize] - 1;
                    }
                }
            });
        });
        self.rows_when_built = reverse.len();
    }

    /// Write the trees blob: header `(numTrees, totalNodes)`, then per tree
    /// a length and its node array.
    pub fn save<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        write_i32(w, self.trees.len() as i32)?;
        write_i32(w, self.total_nodes() as i32)?;
        for tree in &self.trees {
            write_i32(w, tree.nodes.len() as i32)?;
            for n in &tree.nodes {
                write_i32(w, n.split_dim)?;
                write_f32(w, n.split_value)?;
                write_i32(w, n.left)?;
                write_i32(w, n.right)?;
            }
        }
        Ok(())
    }

    /// Read a trees blob. `rows` is the sample count the forest covers.
    pub fn load<R: Read + ?Sized>(r: &mut R, rows: usize) -> Result<Self> {
        let num_trees = read_i32(r)?;
        let total_nodes = read_i32(r)?;
        if num_trees < 0 || total_nodes < 0 {
            return Err(EngineError::FailedParseValue(
                "trees blob header is negative".into(),
            ));
        }
        let mut trees = Vec::with_capacity(num_trees as usize);
        let mut seen = 0i64;
        for _ in 0..num_trees {
            let len = read_i32(r)?;
            if len < 0 {
                return Err(EngineError::FailedParseValue(
                    "tree length is negative".into(),
                ));
            }
            seen += len as i64;
            let mut nodes = Vec::with_capacity(len as usize);
            for _ in 0..len {
                nodes.push(KdTreeNode {
                    split_dim: read_i32(r)?,
                    split_value: read_f32(r)?,
                    left: read_i32(r)?,
                    right: read_i32(r)?,
                });
            }
            trees.push(KdTree { nodes });
        }
        if seen != total_nodes as i64 {
            return Err(EngineError::FailedParseValue(format!(
                "trees blob declares {total_nodes} nodes but contains {seen}"
            )));
        }
        Ok(Self {
            trees,
            rows_when_built: rows,
        })
    }
}

fn build_one_tree<T: VectorValue>(
    store: &BlockStore<T>,
    ids: &[i32],
    params: ForestParams,
    rng: &mut StdRng,
) -> KdTree {
    let mut tree = KdTree::default();
    if ids.is_empty() {
        return tree;
    }
    let mut ids: Vec<i32> = ids.to_vec();
    shuffle(&mut ids, rng);
    if ids.len() == 1 {
        // A single row still needs one node so the blob layout holds.
        tree.nodes.push(KdTreeNode {
            split_dim: 0,
            split_value: store.row(ids[0])[0].to_f32(),
            left: -ids[0] - 1,
            right: -ids[0] - 1,
        });
        return tree;
    }
    build_node(store, &mut ids, params, rng, &mut tree.nodes);
    tree
}

/// Recursively split `ids`, appending the node before its children so the
/// subtree root always has the smallest index in its range.
fn build_node<T: VectorValue>(
    store: &BlockStore<T>,
    ids: &mut [i32],
    params: ForestParams,
    rng: &mut StdRng,
    nodes: &mut Vec<KdTreeNode>,
) -> i32 {
    if ids.len() == 1 {
        return -ids[0] - 1;
    }
    let (split_dim, split_value) = choose_division(store, ids, params, rng);
    let split = subdivide(store, ids, split_dim, split_value);
    let index = nodes.len();
    nodes.push(KdTreeNode {
        split_dim: split_dim as i32,
        split_value,
        left: 0,
        right: 0,
    });
    let (left_ids, right_ids) = ids.split_at_mut(split);
    let left = build_node(store, left_ids, params, rng, nodes);
    let right = build_node(store, right_ids, params, rng, nodes);
    nodes[index].left = left;
    nodes[index].right = right;
    index as i32
}

/// Estimate per-dimension mean and variance over a prefix sample of the
/// (already shuffled) ids, then pick a random dimension among the top
/// variances. The split value is that dimension's sample mean.
fn choose_division<T: VectorValue>(
    store: &BlockStore<T>,
    ids: &[i32],
    params: ForestParams,
    rng: &mut StdRng,
) -> (usize, f32) {
    let dim = store.dim();
    let count = ids.len().min(params.samples_per_node.max(2));
    let mut mean = vec![0.0f32; dim];
    for &id in &ids[..count] {
        let row = store.row(id);
        for (m, v) in mean.iter_mut().zip(row) {
            *m += v.to_f32();
        }
    }
    for m in mean.iter_mut() {
        *m /= count as f32;
    }
    let mut variance = vec![0.0f32; dim];
    for &id in &ids[..count] {
        let row = store.row(id);
        for ((var, v), m) in variance.iter_mut().zip(row).zip(&mean) {
            let d = v.to_f32() - m;
            *var += d * d;
        }
    }
    let split_dim = select_top_variance_dim(&variance, params.top_dims.max(1).min(dim), rng);
    (split_dim, mean[split_dim])
}

/// Keep an insertion-sorted list of the `top` highest-variance dimensions
/// and draw one uniformly.
fn select_top_variance_dim(variance: &[f32], top: usize, rng: &mut StdRng) -> usize {
    let mut best: Vec<usize> = Vec::with_capacity(top);
    for (d, &var) in variance.iter().enumerate() {
        let pos = best
            .iter()
            .position(|&b| var > variance[b])
            .unwrap_or(best.len());
        if pos < top {
            if best.len() == top {
                best.pop();
            }
            best.insert(pos, d);
        }
    }
    best[rng.gen_range(0..best.len())]
}

/// Partition ids around the split value. Degenerate partitions (everything
/// on one side) fall back to a median split so recursion always shrinks.
fn subdivide<T: VectorValue>(
    store: &BlockStore<T>,
    ids: &mut [i32],
    split_dim: usize,
    split_value: f32,
) -> usize {
    let mut split = 0usize;
    for i in 0..ids.len() {
        if store.row(ids[i])[split_dim].to_f32() < split_value {
            ids.swap(split, i);
            split += 1;
        }
    }
    if split == 0 || split == ids.len() {
        let mid = ids.len() / 2;
        ids.select_nth_unstable_by(mid, |&a, &b| {
            store.row(a)[split_dim]
                .to_f32()
                .total_cmp(&store.row(b)[split_dim].to_f32())
        });
        return mid;
    }
    split
}

fn shuffle(ids: &mut [i32], rng: &mut StdRng) {
    for i in (1..ids.len()).rev() {
        ids.swap(i, rng.gen_range(0..=i));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::l2_sq;

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()
    }

    fn grid_store() -> BlockStore<f32> {
        // 16 points on a 4x4 grid.
        let mut data = Vec::new();
        for y in 0..4 {
            for x in 0..4 {
                data.push(x as f32);
                data.push(y as f32);
            }
        }
        BlockStore::with_data(&data, 16, 2, 8, 1 << 20).unwrap()
    }

    fn forest_params() -> ForestParams {
        ForestParams {
            num_trees: 2,
            top_dims: 5,
            samples_per_node: 1000,
        }
    }

    #[test]
    fn test_leaf_encoding_round_trip() {
        for vid in [0, 1, 7, 1000] {
            let child = -vid - 1;
            assert!(is_leaf(child));
            assert_eq!(leaf_vid(child), vid);
        }
        assert!(!is_leaf(0));
        assert!(!is_leaf(3));
    }

    #[test]
    fn test_build_covers_every_id_as_leaf() {
        let store = grid_store();
        let ids: Vec<i32> = (0..16).collect();
        let forest = KdForest::build_seeded(&store, &ids, forest_params(), &pool(), 7);
        assert_eq!(forest.num_trees(), 2);
        assert_eq!(forest.rows_when_built(), 16);
        for tree in &forest.trees {
            let mut seen = vec![false; 16];
            for n in &tree.nodes {
                for child in [n.left, n.right] {
                    if is_leaf(child) {
                        seen[leaf_vid(child) as usize] = true;
                    }
                }
            }
            assert!(seen.iter().all(|&s| s), "tree must reach every id");
            // n ids split down to singles needs exactly n-1 internal nodes.
            assert_eq!(tree.nodes.len(), 15);
        }
    }

    #[test]
    fn test_build_is_deterministic_per_seed() {
        let store = grid_store();
        let ids: Vec<i32> = (0..16).collect();
        let a = KdForest::build_seeded(&store, &ids, forest_params(), &pool(), 42);
        let b = KdForest::build_seeded(&store, &ids, forest_params(), &pool(), 42);
        for (ta, tb) in a.trees.iter().zip(&b.trees) {
            assert_eq!(ta.nodes, tb.nodes);
        }
    }

    #[test]
    fn test_descent_finds_nearest_on_separable_data() {
        let store = grid_store();
        let ids: Vec<i32> = (0..16).collect();
        let forest = KdForest::build_seeded(&store, &ids, forest_params(), &pool(), 3);
        let query = QueryVectors::new(&[3.1f32, 2.9], crate::distance::DistCalcMethod::L2);
        let mut ws = SearchWorkspace::new(8);
        ws.reset(64);
        forest.init_search(&mut ws);
        forest.search_trees(&store, l2_sq::<f32>, &query, &mut ws, 16);
        // Nearest grid point to (3.1, 2.9) is (3, 3) = vid 15.
        let best = ws.ng_queue.pop().unwrap().0;
        assert_eq!(best.vid, 15);
    }

    #[test]
    fn test_search_trees_respects_leaf_budget() {
        let store = grid_store();
        let ids: Vec<i32> = (0..16).collect();
        let forest = KdForest::build_seeded(&store, &ids, forest_params(), &pool(), 3);
        let query = QueryVectors::new(&[0.0f32, 0.0], crate::distance::DistCalcMethod::L2);
        let mut ws = SearchWorkspace::new(8);
        ws.reset(64);
        forest.init_search(&mut ws);
        forest.search_trees(&store, l2_sq::<f32>, &query, &mut ws, 4);
        assert!(ws.checked_leaves >= 4);
        assert!(ws.checked_leaves < 16);
        assert_eq!(ws.checked_leaves, ws.tree_checked_leaves);
    }

    #[test]
    fn test_single_row_tree_has_one_node() {
        let store = BlockStore::with_data(&[1.0f32, 2.0], 1, 2, 8, 100).unwrap();
        let forest = KdForest::build_seeded(&store, &[0], forest_params(), &pool(), 1);
        for tree in &forest.trees {
            assert_eq!(tree.nodes.len(), 1);
            assert_eq!(leaf_vid(tree.nodes[0].left), 0);
        }
    }

    #[test]
    fn test_duplicate_points_still_terminate() {
        let data = vec![5.0f32; 2 * 32];
        let store = BlockStore::with_data(&data, 32, 2, 8, 100).unwrap();
        let ids: Vec<i32> = (0..32).collect();
        let forest = KdForest::build_seeded(&store, &ids, forest_params(), &pool(), 9);
        assert_eq!(forest.trees[0].nodes.len(), 31);
    }

    #[test]
    fn test_save_load_round_trip() {
        let store = grid_store();
        let ids: Vec<i32> = (0..16).collect();
        let forest = KdForest::build_seeded(&store, &ids, forest_params(), &pool(), 11);
        let mut blob = Vec::new();
        forest.save(&mut blob).unwrap();
        let loaded = KdForest::load(&mut blob.as_slice(), 16).unwrap();
        assert_eq!(loaded.num_trees(), forest.num_trees());
        assert_eq!(loaded.total_nodes(), forest.total_nodes());
        for (a, b) in loaded.trees.iter().zip(&forest.trees) {
            assert_eq!(a.nodes, b.nodes);
        }
    }

    #[test]
    fn test_remap_leaves_rewrites_vids() {
        let store = grid_store();
        let ids: Vec<i32> = (0..16).collect();
        let mut forest = KdForest::build_seeded(&store, &ids, forest_params(), &pool(), 5);
        // Identity except ids 3 and 7 swapped into 0 and 1.
        let mut reverse: Vec<i32> = (0..16).collect();
        reverse[3] = 0;
        reverse[7] = 1;
        forest.remap_leaves(&reverse, &pool());
        let mut found_zero = false;
        for n in &forest.trees[0].nodes {
            for child in [n.left, n.right] {
                if is_leaf(child) && leaf_vid(child) == 0 {
                    found_zero = true;
                }
                assert_ne!(leaf_vid(child), 3);
            }
        }
        assert!(found_zero);
    }
}
