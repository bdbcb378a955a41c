//! beamline: disk-resident approximate nearest neighbor search.
//!
//! Answers k-nearest-neighbor queries over vector collections too large for
//! RAM. The index is a flat Vamana graph laid out in 4 KiB sectors on disk;
//! search walks it best-first, scoring candidates cheaply from resident
//! product-quantization codes and overlapping sector reads with CPU work.
//!
//! # Architecture
//!
//! | Piece | Module | Role |
//! |-------|--------|------|
//! | Aligned reader | [`io`] | batched sector-granular positional reads |
//! | PQ tables | [`pq`] | query-conditioned chunk distance lookup |
//! | Layout decode | [`layout`] | id -> sector -> (coords, neighbors) |
//! | Scratch pool | [`scratch`] | per-thread reusable query state |
//! | Node cache | [`cache`] | warm set skipping I/O for hot nodes |
//! | Partitioned graph | [`partition`] | adjacency split from coordinates |
//! | Embedding client | [`embedding`] | exact vectors from a remote service |
//! | Beam search | [`index`] | the engine tying the above together |
//!
//! # Usage
//!
//! ```ignore
//! use beamline::{DiskIndex, Metric, OpenParams, SearchOptions};
//!
//! let index: DiskIndex<f32> = DiskIndex::open(OpenParams {
//!     metric: Metric::L2,
//!     index_prefix: "/data/wiki".into(),
//!     num_threads: 8,
//!     ..Default::default()
//! })?;
//!
//! let hits = index.search(&query, 10, 100, 4, &SearchOptions::default())?;
//! ```
//!
//! The graph and compressed codes are read-only once loaded; queries run
//! concurrently, each single-threaded, each on a scratch slot checked out of
//! a fixed pool.

pub mod cache;
pub mod defaults;
pub mod distance;
pub mod embedding;
pub mod error;
pub mod index;
pub mod io;
pub mod labels;
pub mod layout;
pub mod partition;
pub mod pq;
pub mod scratch;
pub mod stats;

pub use distance::{Element, Metric};
pub use error::{Result, SearchError};
pub use index::{
    CacheWarmup, DiskIndex, OpenParams, RangeSearchParams, SearchOptions,
};
pub use stats::QueryStats;
