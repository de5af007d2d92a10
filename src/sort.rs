use crate::env_var::config;
use crate::error::{Error, Result};
use crate::globmem::GlobalPtr;
use crate::runtime::Runtime;
use crate::thread_pool::ThreadPool;
use crate::transport::{Remote, TransportOps};

use std::marker::PhantomData;
use tracing::{debug, trace};

pub mod pattern;
pub(crate) mod splitters;

mod exchange;
mod merge;

pub use pattern::BlockPattern;
pub use splitters::SortKey;

use exchange::{exchange_data, remote_partitions};
use merge::{ceil_log2, merge_inplace, merge_into, merge_tree, schedule_copy_tasks};
use splitters::select_splitters;

/// A block-distributed slice backed by a team collective segment. Every
/// member contributes `local_len` elements; per-unit lengths may differ, the
/// segment is sized for the largest.
pub struct DistSlice<T: Remote> {
    team_id: u32,
    gptr: GlobalPtr,
    counts: Vec<usize>,
    my_rank: usize,
    _marker: PhantomData<T>,
}

impl<T: Remote + 'static> DistSlice<T> {
    /// Collective over the team.
    pub fn new(rt: &Runtime, team_id: u32, local_len: usize) -> Result<DistSlice<T>> {
        let p = rt.team_size(team_id)?;
        let my_rank = rt.team_myid(team_id)?;
        let mut counts = vec![0usize; p];
        rt.allgather(team_id, &[local_len], &mut counts)?;
        let cap = counts.iter().copied().max().unwrap_or(0).max(1);
        let gptr = rt.team_memalloc_aligned(team_id, cap * std::mem::size_of::<T>())?;
        Ok(DistSlice {
            team_id,
            gptr,
            counts,
            my_rank,
            _marker: PhantomData,
        })
    }

    pub fn team(&self) -> u32 {
        self.team_id
    }

    pub fn gptr(&self) -> GlobalPtr {
        self.gptr
    }

    pub fn local_len(&self) -> usize {
        self.counts[self.my_rank]
    }

    /// Total element count across the team.
    pub fn len(&self) -> usize {
        self.counts.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pattern(&self) -> BlockPattern {
        BlockPattern::new(self.counts.clone())
    }

    /// This unit's local slice of the distributed range.
    ///
    /// # Safety
    /// The returned slice aliases the collective segment; the caller must not
    /// hold it across a free of the segment or concurrent remote writes.
    pub unsafe fn local_mut(&self, rt: &Runtime) -> Result<&mut [T]> {
        let global = rt.team_unit_l2g(self.team_id, self.my_rank)?;
        let mut g = self.gptr;
        g.setunit(global as u32);
        let addr = rt.gptr_getaddr(g)?;
        if addr.is_null() {
            return Err(Error::Invalid("local slice is not resident here".into()));
        }
        Ok(std::slice::from_raw_parts_mut(
            addr as *mut T,
            self.local_len(),
        ))
    }

    /// Copy of this unit's local slice.
    pub fn to_local_vec(&self, rt: &Runtime) -> Result<Vec<T>> {
        let slice = unsafe { self.local_mut(rt)? };
        Ok(slice.to_vec())
    }

    /// Collectively release the backing segment.
    pub fn free(self, rt: &Runtime) -> Result<()> {
        rt.team_memfree(self.team_id, self.gptr)
    }
}

/// Distributed sort of `dist` by the elements' natural key.
pub fn team_sort<T>(rt: &Runtime, dist: &mut DistSlice<T>) -> Result<()>
where
    T: SortKey,
{
    team_sort_by_key(rt, dist, |x: &T| *x)
}

/// Distributed sort of `dist` by a key projection.
///
/// Collective over the slice's team. After return the multiset of elements
/// is redistributed so that unit order concatenates to the globally sorted
/// sequence; each unit keeps its original element count. Not stable.
pub fn team_sort_by_key<T, K, F>(rt: &Runtime, dist: &mut DistSlice<T>, key: F) -> Result<()>
where
    T: Remote + Send + Sync + 'static,
    K: SortKey,
    F: Fn(&T) -> K + Copy + Send + Sync + 'static,
{
    rt.ensure_active()?;
    let team_id = dist.team();
    let nunits = rt.team_size(team_id)?;
    let me = rt.team_myid(team_id)?;
    let local = unsafe { dist.local_mut(rt)? };

    // Phase 1: local sort
    local.sort_unstable_by(|a, b| key(a).cmp(&key(b)));
    if nunits == 1 {
        return Ok(());
    }

    // Phase 2: splitter selection (collective; synchronizes with every
    // member's local sort)
    let pattern = dist.pattern();
    let keys: Vec<K> = local.iter().map(key).collect();
    let plan = select_splitters(rt, team_id, &keys, &pattern)?;
    drop(keys);

    if pattern.total() == 0 {
        return Ok(());
    }
    let n_me = local.len();
    if n_me == 0 {
        // no destination buffer: skip the exchange entirely but pair the
        // final-merge barrier the other units will execute
        rt.barrier(team_id)?;
        return Ok(());
    }

    // Phase 3: remote partition set
    let unit_at_begin = pattern
        .unit_at(0)
        .ok_or_else(|| Error::Invalid("pattern owns no data".into()))?;
    let remote = remote_partitions(&plan, me, unit_at_begin);
    debug!(
        unit = me,
        remote = remote.len(),
        total = pattern.total(),
        "sort exchange planned"
    );

    // Phase 4: asynchronous data exchange into the working buffer
    let mut work: Vec<T> = vec![local[0]; n_me];
    let handles = unsafe {
        exchange_data(
            rt,
            team_id,
            dist.gptr(),
            &plan,
            &remote,
            me,
            work.as_mut_ptr(),
        )?
    };

    // Phase 5: copy-task scheduling
    let pool = ThreadPool::new(config().threads.max(ceil_log2(nunits) + 2));
    let (my_count, my_src, my_dst) = plan.send_info(me, me);
    let elem = std::mem::size_of::<T>();
    let src_ptr = local.as_ptr() as usize;
    let work_ptr = work.as_mut_ptr() as usize;
    let local_copy = move || {
        trace!(my_count, "local partition copy");
        unsafe {
            std::ptr::copy_nonoverlapping(
                (src_ptr + my_src * elem) as *const T,
                (work_ptr + my_dst * elem) as *mut T,
                my_count,
            );
        }
    };
    let deps = schedule_copy_tasks(&pool, &remote, handles, me, local_copy);

    // Phase 6: dependency-tree merge; the final level merges non-inplace
    // into the output slice once every unit's copies have landed
    let mut offsets = Vec::with_capacity(nunits + 1);
    let mut acc = 0usize;
    offsets.push(0);
    for u in 0..nunits {
        acc += plan.target_count(me, u);
        offsets.push(acc);
    }
    let out_ptr = local.as_mut_ptr() as usize;
    let transport = rt.transport.clone();
    let label = rt.team_label(team_id)?;
    let merge_op = move |f: usize, mi: usize, l: usize, d: usize, depth: usize| {
        let (a, b, c) = (offsets[f], offsets[mi], offsets[l]);
        unsafe {
            if d == depth - 1 {
                // every unit's working buffer must be complete before the
                // write-back overwrites the slices remote gets read from
                let _ = transport.barrier(label);
                let left = std::slice::from_raw_parts((work_ptr + a * elem) as *const T, b - a);
                let right = std::slice::from_raw_parts((work_ptr + b * elem) as *const T, c - b);
                let out = std::slice::from_raw_parts_mut((out_ptr + a * elem) as *mut T, c - a);
                merge_into(left, right, out, key);
            } else {
                let buf = std::slice::from_raw_parts_mut((work_ptr + a * elem) as *mut T, c - a);
                merge_inplace(buf, b - a, key);
            }
        }
    };
    merge_tree(deps, nunits, &pool, merge_op);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::team::TEAM_ALL;
    use rand::prelude::*;

    fn local_runtime() -> Runtime {
        crate::runtime::RuntimeBuilder::new()
            .with_backend(crate::transport::Backend::Local)
            .build()
            .unwrap()
    }

    #[test]
    fn single_unit_sort_is_local_sort() {
        let rt = local_runtime();
        let mut dist = DistSlice::<i64>::new(&rt, TEAM_ALL, 64).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let mut reference: Vec<i64> = (0..64).map(|_| rng.gen_range(-1000..1000)).collect();
        unsafe { dist.local_mut(&rt).unwrap() }.copy_from_slice(&reference);

        team_sort(&rt, &mut dist).unwrap();

        let sorted = dist.to_local_vec(&rt).unwrap();
        reference.sort_unstable();
        assert_eq!(sorted, reference);
        dist.free(&rt).unwrap();
        rt.finalize().unwrap();
    }

    #[test]
    fn sort_is_a_permutation() {
        let rt = local_runtime();
        let mut dist = DistSlice::<i64>::new(&rt, TEAM_ALL, 100).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let input: Vec<i64> = (0..100).map(|_| rng.gen_range(0..10)).collect();
        unsafe { dist.local_mut(&rt).unwrap() }.copy_from_slice(&input);

        team_sort(&rt, &mut dist).unwrap();

        let mut output = dist.to_local_vec(&rt).unwrap();
        assert!(output.windows(2).all(|w| w[0] <= w[1]));
        output.sort_unstable();
        let mut expected = input;
        expected.sort_unstable();
        assert_eq!(output, expected);
        dist.free(&rt).unwrap();
    }

    #[test]
    fn empty_slice_sort() {
        let rt = local_runtime();
        let mut dist = DistSlice::<u32>::new(&rt, TEAM_ALL, 0).unwrap();
        team_sort(&rt, &mut dist).unwrap();
        assert_eq!(dist.local_len(), 0);
        dist.free(&rt).unwrap();
    }

    #[test]
    fn sort_by_key_projection() {
        let rt = local_runtime();
        let mut dist = DistSlice::<(i32, i32)>::new(&rt, TEAM_ALL, 16).unwrap();
        let input: Vec<(i32, i32)> = (0..16).map(|i| (16 - i, i)).collect();
        unsafe { dist.local_mut(&rt).unwrap() }.copy_from_slice(&input);

        team_sort_by_key(&rt, &mut dist, |pair: &(i32, i32)| pair.0).unwrap();

        let output = dist.to_local_vec(&rt).unwrap();
        assert!(output.windows(2).all(|w| w[0].0 <= w[1].0));
        dist.free(&rt).unwrap();
    }
}
