//! Default values for every registered index parameter.
//!
//! These seed the parameter registry at construction time; runtime overrides
//! go through `Index::set_parameter` (or a `[Index]` config section).

/// Default leaf budget for a user-facing search.
///
/// Higher values improve recall at the cost of latency.
pub const DEFAULT_MAX_CHECK: usize = 8192;

/// Consecutive unproductive graph expansions tolerated before the engine
/// considers the search locally exhausted and re-seeds or terminates.
pub const DEFAULT_NO_BETTER_PROPAGATION_THRESHOLD: usize = 3;

/// Tree leaves examined to seed the candidate queue before the graph loop.
pub const DEFAULT_INITIAL_DYNAMIC_PIVOTS: usize = 50;

/// Extra tree leaves examined on each mid-search re-seed.
pub const DEFAULT_OTHER_DYNAMIC_PIVOTS: usize = 4;

/// Fixed out-degree of the neighborhood graph (K).
pub const DEFAULT_NEIGHBORHOOD_SIZE: usize = 32;

/// Result-buffer capacity for searches issued during graph construction
/// and offline refinement. Wider than any user k.
pub const DEFAULT_CEF: usize = 1000;

/// Result-buffer capacity for the per-vector refinement run after an add.
pub const DEFAULT_ADD_CEF: usize = 500;

/// Leaf budget for searches issued during graph refinement.
pub const DEFAULT_MAX_CHECK_FOR_REFINE_GRAPH: usize = 8192;

/// Number of randomized KD trees in the forest.
pub const DEFAULT_NUMBER_OF_TREES: usize = 4;

/// Split dimensions are chosen at random among this many top-variance
/// dimensions, which is what de-correlates the trees.
pub const DEFAULT_TOP_DIMENSIONS_IN_TREE_NODE: usize = 5;

/// Rows sampled per tree node when estimating per-dimension variance.
pub const DEFAULT_SAMPLES_PER_NODE: usize = 1000;

/// log2 of the workspace visited-table size. The table doubles on demand;
/// the actual exponent is snapshotted back into the config on save.
pub const DEFAULT_HASH_TABLE_EXPONENT: u32 = 16;

/// Rows per storage block. Blocks are allocated whole and never move,
/// which is what keeps row slices stable across appends.
pub const DEFAULT_DATA_BLOCK_SIZE: usize = 4096;

/// Maximum number of rows the store will accept.
pub const DEFAULT_DATA_CAPACITY: usize = i32::MAX as usize;

/// Default record size hint for an attached metadata store.
pub const DEFAULT_META_RECORD_SIZE: usize = 10;

/// Net insertions since the last forest build that trigger a background
/// tree rebuild.
pub const DEFAULT_ADD_COUNT_FOR_REBUILD_TREES: usize = 1000;

/// Shard count for the per-graph-row edge-insertion locks.
pub const GRAPH_ROW_LOCK_SHARDS: usize = 1024;

/// Minimum visited-table exponent; smaller configured values are raised.
pub const MIN_HASH_TABLE_EXPONENT: u32 = 8;
