//! Per-query execution counters.

use serde::Serialize;

/// Counters filled in by one search call.
///
/// `io_limit_hit` records that traversal stopped on the io budget rather than
/// frontier exhaustion; it is informational, not an error.
#[derive(Debug, Default, Clone, Serialize)]
pub struct QueryStats {
    /// Beam iterations executed.
    pub n_hops: u32,
    /// Read requests issued.
    pub n_ios: u32,
    /// 4 KiB sectors fetched.
    pub n_4k: u32,
    /// Distance comparisons performed.
    pub n_cmps: u32,
    /// Frontier picks served from the node cache.
    pub n_cache_hits: u32,
    /// Neighbor scorings requested in recompute mode.
    pub recompute_requests: u64,
    /// Of those, how many the per-query distance memo answered.
    pub recompute_memo_hits: u64,
    /// Time spent inside the aligned reader, microseconds.
    pub io_us: u64,
    /// Time spent scoring and expanding, microseconds.
    pub cpu_us: u64,
    /// Wall time of the whole call, microseconds.
    pub total_us: u64,
    /// Traversal ended because `io_limit` was reached.
    pub io_limit_hit: bool,
}
