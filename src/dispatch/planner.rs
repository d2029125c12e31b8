//! Shard planning

use crate::models::{RunId, ShardJob};

/// Upper bound of shards per run
pub const MAX_SHARDS: u32 = 256;

/// Resolve a suite's configured parallelism into a shard count
pub fn resolve_shard_count(configured: Option<u32>) -> u32 {
    match configured {
        None | Some(0) => 1,
        Some(n) => n.min(MAX_SHARDS),
    }
}

/// Split a run into shard jobs `0..n`, in order
pub fn plan(run_id: RunId, shard_count: u32) -> Vec<ShardJob> {
    let shard_total = resolve_shard_count(Some(shard_count));
    (0..shard_total)
        .map(|shard_index| ShardJob {
            run_id,
            shard_index,
            shard_total,
        })
        .collect()
}
