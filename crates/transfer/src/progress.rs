use std::collections::BTreeSet;

use chunkdrop_protocol::types::{SessionStatus, UploadProgress};

use crate::ChunkPlan;

/// Bytes covered by the distinct, in-range indices in `completed`.
pub fn bytes_covered<'a>(plan: &ChunkPlan, completed: impl IntoIterator<Item = &'a u32>) -> u64 {
    let distinct: BTreeSet<u32> = completed.into_iter().copied().collect();
    distinct.into_iter().map(|i| plan.len_of(i)).sum()
}

/// Percentage of the file covered by `completed`, clamped to `[0, 100]`.
///
/// Always recomputed from a completion set rather than accumulated, so
/// duplicate acknowledgements cannot inflate it. An empty file is 100%.
pub fn progress_percent<'a>(plan: &ChunkPlan, completed: impl IntoIterator<Item = &'a u32>) -> f64 {
    if plan.file_size() == 0 {
        return 100.0;
    }
    let covered = bytes_covered(plan, completed);
    (covered as f64 / plan.file_size() as f64 * 100.0).clamp(0.0, 100.0)
}

/// Builds the wire-level progress snapshot for `upload_id`.
pub fn progress_snapshot<'a>(
    upload_id: &str,
    status: SessionStatus,
    plan: &ChunkPlan,
    completed: impl IntoIterator<Item = &'a u32>,
) -> UploadProgress {
    let distinct: BTreeSet<u32> = completed
        .into_iter()
        .copied()
        .filter(|&i| i < plan.total_chunks())
        .collect();
    UploadProgress {
        upload_id: upload_id.to_string(),
        status,
        total_bytes: plan.file_size(),
        transferred_bytes: bytes_covered(plan, &distinct),
        completed_chunks: distinct.len() as u32,
        total_chunks: plan.total_chunks(),
    }
}
