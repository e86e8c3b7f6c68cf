use std::collections::BTreeSet;

/// Indices in `0..total_chunks` that are not in `completed`, ascending.
///
/// `completed` should come from the receiving side's status, never from a
/// local cache. Out-of-range entries are ignored.
pub fn remaining(total_chunks: u32, completed: &[u32]) -> Vec<u32> {
    let done: BTreeSet<u32> = completed.iter().copied().collect();
    (0..total_chunks).filter(|i| !done.contains(i)).collect()
}
