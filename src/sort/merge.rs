use crate::handle::RmaHandle;
use crate::thread_pool::{TaskFuture, ThreadPool};

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Half-open range of partition indices.
pub(crate) type ChunkRange = (usize, usize);

/// Futures signalling "the data for these partitions is sorted and resident
/// at its final slice". Keys are disjoint; the tree merge replaces two
/// adjacent children with their union. Each future has a single consumer,
/// so merge tasks remove their children from the map.
pub(crate) type ChunkDependencies = Arc<Mutex<BTreeMap<ChunkRange, TaskFuture<()>>>>;

/// Phase 5: one task per remote partition awaiting its copy handle, plus the
/// caller-provided local copy. Inserts exactly `remote.len() + 1` entries.
pub(crate) fn schedule_copy_tasks(
    pool: &ThreadPool,
    remote: &[usize],
    mut handles: Vec<RmaHandle>,
    me: usize,
    local_copy: impl FnOnce() + Send + 'static,
) -> ChunkDependencies {
    let deps: ChunkDependencies = Arc::new(Mutex::new(BTreeMap::new()));
    for &partition in remote {
        let mut handle = std::mem::take(&mut handles[partition]);
        let fut = pool.submit(move || {
            if !handle.is_null() {
                let _ = handle.wait();
            }
        });
        deps.lock().insert((partition, partition + 1), fut);
    }
    let fut = pool.submit(local_copy);
    deps.lock().insert((me, me + 1), fut);
    debug_assert_eq!(
        deps.lock().len(),
        remote.len() + 1,
        "invalid chunk dependencies"
    );
    deps
}

pub(crate) fn ceil_log2(n: usize) -> usize {
    if n <= 1 {
        0
    } else {
        (usize::BITS - (n - 1).leading_zeros()) as usize
    }
}

/// Phase 6: the dependency-tree merge. Level `d` merges pairs of adjacent
/// chunk ranges `[f, mi)` and `[mi, l)`; each task waits for its children
/// (when present) and then applies `merge_op(f, mi, l, d, depth)`. The
/// caller's `merge_op` distinguishes the final level via `d == depth - 1`.
/// Returns once the `[0, npartitions)` future completes.
pub(crate) fn merge_tree(
    deps: ChunkDependencies,
    nchunks: usize,
    pool: &ThreadPool,
    merge_op: impl Fn(usize, usize, usize, usize, usize) + Send + Sync + Clone + 'static,
) {
    let npartitions = nchunks;
    let depth = ceil_log2(nchunks);
    let mut nchunks = nchunks;

    for d in 0..depth {
        let step = 1usize << d;
        let dist = step << 1;
        let nmerges = nchunks >> 1;

        for m in 0..nmerges {
            let f = m * dist;
            let mi = m * dist + step;
            // a lonely trailing merge must not run past the partition count
            let l = (m * dist + dist).min(npartitions);

            let task_deps = deps.clone();
            let op = merge_op.clone();
            let fut = pool.submit(move || {
                for range in [(f, mi), (mi, l)] {
                    let dep = task_deps.lock().remove(&range);
                    if let Some(mut dep) = dep {
                        if dep.valid() {
                            dep.wait();
                            dep.get();
                        }
                    }
                }
                op(f, mi, l, d, depth);
                trace!(f, mi, l, level = d, "merged chunks");
            });
            deps.lock().insert((f, l), fut);
        }
        nchunks -= nmerges;
    }

    let fin = deps.lock().remove(&(0, npartitions));
    if let Some(mut fut) = fin {
        fut.get();
    }
}

/// Merge the two sorted runs `[0, mid)` and `[mid, len)` of `buf` in place.
pub(crate) fn merge_inplace<T, K, F>(buf: &mut [T], mid: usize, key: F)
where
    T: Copy,
    K: Ord,
    F: Fn(&T) -> K,
{
    if mid == 0 || mid == buf.len() {
        return;
    }
    let merged: Vec<T> = {
        let (left, right) = buf.split_at(mid);
        merge_runs(left, right, &key)
    };
    buf.copy_from_slice(&merged);
}

/// Merge two sorted runs into `out` (`out.len() == left.len() + right.len()`).
pub(crate) fn merge_into<T, K, F>(left: &[T], right: &[T], out: &mut [T], key: F)
where
    T: Copy,
    K: Ord,
    F: Fn(&T) -> K,
{
    let merged = merge_runs(left, right, &key);
    out.copy_from_slice(&merged);
}

fn merge_runs<T, K, F>(left: &[T], right: &[T], key: &F) -> Vec<T>
where
    T: Copy,
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut out = Vec::with_capacity(left.len() + right.len());
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        if key(&right[j]) < key(&left[i]) {
            out.push(right[j]);
            j += 1;
        } else {
            out.push(left[i]);
            i += 1;
        }
    }
    out.extend_from_slice(&left[i..]);
    out.extend_from_slice(&right[j..]);
    out
}
