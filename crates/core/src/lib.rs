//! # canopy-core
//!
//! Embeddable approximate nearest neighbor engine for dense numeric vectors,
//! combining a randomized KD-forest with a fixed-degree neighborhood graph.
//! The forest seeds each query with globally spread candidates; a best-first
//! graph traversal densifies around the promising regions; tombstones make
//! deletion O(1) and a periodic refine compacts them away.
//!
//! This is the core library crate with zero async dependencies — suitable
//! for embedding directly in Rust or behind language bindings. Serving,
//! configuration files, and CLI surfaces live outside this crate.

/// Default values for every registered parameter.
pub mod config;
/// Tombstone set with concurrent insert and snapshot count.
pub mod deleted;
/// Distance metrics and kernels: squared L2 and base-normalized cosine.
pub mod distance;
/// Element types the store is generic over: i8, u8, i16, f32.
pub mod element;
/// The index engine: search, build, add, delete, refine, save/load.
pub mod engine;
/// Engine error taxonomy.
pub mod error;
/// Fixed-degree neighborhood graph with per-row edge locks.
pub mod graph;
/// Metadata sideband interface and the in-memory implementation.
pub mod metadata;
/// Macro-generated parameter registry.
pub mod params;
/// Snapshot persistence: four-blob wire format and directory helpers.
pub mod persistence;
mod prefetch;
/// Query-side types: top-k result buffer and query vector carrier.
pub mod query;
/// Block-partitioned sample store.
pub mod store;
/// Randomized KD-forest.
pub mod tree;
/// Per-search workspaces and the rent/return pool.
pub mod workspace;

pub use distance::DistCalcMethod;
pub use element::{ElementType, VectorValue};
pub use engine::{AbortProbe, Index, RefineStreams, SearchOptions, SearchResult};
pub use error::{EngineError, Result};
pub use metadata::{MemMetadataStore, MetadataStore};
pub use params::Params;
pub use persistence::{load_index, save_index};
