//! Lattice is a partitioned global address space (PGAS) runtime: each process
//! owns a slice of one logical address space, addressable from every other
//! process through global pointers and one-sided RMA.
//!
//! The runtime provides teams (named ordered subsets of units supporting
//! collectives and memory allocation), a translation layer mapping segment
//! ids to per-peer base addresses, non-blocking RMA completion handles, and a
//! distributed parallel sort that shuffles locally-sorted partitions across
//! units and merges them in a thread-pool-driven dependency tree.
//!
//! Data moves through a transport backend selected at initialization;
//! currently a single-process backend ("local") for development and testing,
//! and a multi-process single-node backend ("shmem") coordinating over
//! shared memory.
//!
//! EXAMPLES
//! --------
//!
//! # Initializing the runtime and allocating global memory
//! ```no_run
//! use lattice::{RuntimeBuilder, TEAM_ALL};
//!
//! fn main() -> lattice::Result<()> {
//!     let rt = RuntimeBuilder::new().build()?;
//!     let gptr = rt.team_memalloc_aligned(TEAM_ALL, 1024)?;
//!     let mut data = vec![0u8; 16];
//!     rt.get(gptr, &mut data)?;
//!     rt.team_memfree(TEAM_ALL, gptr)?;
//!     rt.finalize()?;
//!     Ok(())
//! }
//! ```
//!
//! # Sorting a distributed slice
//! ```no_run
//! use lattice::sort::{team_sort, DistSlice};
//! use lattice::{RuntimeBuilder, TEAM_ALL};
//!
//! fn main() -> lattice::Result<()> {
//!     let rt = RuntimeBuilder::new().build()?;
//!     let mut dist = DistSlice::<i64>::new(&rt, TEAM_ALL, 1_000)?;
//!     let local = unsafe { dist.local_mut(&rt)? };
//!     local.iter_mut().enumerate().for_each(|(i, x)| *x = -(i as i64));
//!     team_sort(&rt, &mut dist)?;
//!     dist.free(&rt)?;
//!     rt.finalize()?;
//!     Ok(())
//! }
//! ```

pub mod env_var;
mod error;
mod group;
pub mod pmem;
pub mod sort;
mod team;
mod thread_pool;
mod transport;

mod alloc;
mod globmem;
mod handle;
mod runtime;
mod translation;

pub use crate::error::{Error, Result};
pub use crate::globmem::{GlobalPtr, GPTR_NULL};
pub use crate::group::Group;
pub use crate::handle::RmaHandle;
pub use crate::runtime::{Runtime, RuntimeBuilder};
pub use crate::team::{TEAM_ALL, TEAM_CAP, TEAM_NULL};
pub use crate::thread_pool::{TaskFuture, ThreadPool};
pub use crate::transport::{Backend, Reduce, ReduceOp, Remote};

#[cfg(test)]
mod tests {
    use super::*;

    fn local_runtime() -> Runtime {
        RuntimeBuilder::new()
            .with_backend(Backend::Local)
            .build()
            .unwrap()
    }

    #[test]
    fn identity_and_finalize() {
        let rt = local_runtime();
        assert_eq!(rt.myid(), 0);
        assert_eq!(rt.size(), 1);
        rt.finalize().unwrap();
        assert!(matches!(rt.memalloc(64), Err(Error::NotInitialized)));
        // deallocation after finalize is a logged no-op
        rt.memfree(GPTR_NULL).unwrap();
    }

    #[test]
    fn local_alloc_getaddr_roundtrip() {
        let rt = local_runtime();
        let gptr = rt.memalloc(256).unwrap();
        assert_eq!(gptr.unit, 0);
        assert_eq!(gptr.seg_id, 0);

        let addr = rt.gptr_getaddr(gptr).unwrap();
        assert!(!addr.is_null());

        // setaddr(getaddr) is a no-op
        let mut copy = gptr;
        rt.gptr_setaddr(&mut copy, addr).unwrap();
        assert_eq!(copy.offset, gptr.offset);

        // non-owners resolve to null, not an error
        let mut foreign = gptr;
        foreign.setunit(7);
        // a single-pe world has no unit 7, so resolution yields null
        assert!(rt.gptr_getaddr(foreign).unwrap().is_null());

        rt.memfree(gptr).unwrap();
    }

    #[test]
    fn memfree_restores_pool() {
        let rt = local_runtime();
        let before = rt.pool.lock().free_bytes();
        let gptr = rt.memalloc(1024).unwrap();
        rt.memfree(gptr).unwrap();
        assert_eq!(rt.pool.lock().free_bytes(), before);

        // unknown offsets are invalid
        let mut bogus = gptr;
        bogus.offset = 0xdead_beef;
        assert!(matches!(rt.memfree(bogus), Err(Error::Invalid(_))));
    }

    #[test]
    fn zero_byte_alloc() {
        let rt = local_runtime();
        let gptr = rt.memalloc(0).unwrap();
        rt.memfree(gptr).unwrap();
    }

    #[test]
    fn local_pool_exhaustion() {
        let rt = local_runtime();
        let pool_size = rt.pool.lock().pool_size() as usize;
        let big = rt.memalloc(pool_size).unwrap();
        assert!(matches!(rt.memalloc(1), Err(Error::Exhausted(_))));
        rt.memfree(big).unwrap();
    }

    #[test]
    fn collective_alloc_translates_everywhere() {
        let rt = local_runtime();
        let gptr = rt.team_memalloc_aligned(TEAM_ALL, 4096).unwrap();
        assert!(gptr.seg_id > 0);
        assert_eq!(gptr.flags, 0);
        assert_eq!(gptr.offset, 0);

        let addr = rt.gptr_getaddr(gptr).unwrap();
        assert!(!addr.is_null());

        // put/get through the global pointer round-trips
        let src = [0xa5u8; 64];
        rt.put(gptr, &src).unwrap();
        let mut dst = [0u8; 64];
        rt.get(gptr, &mut dst).unwrap();
        assert_eq!(src, dst);

        rt.team_memfree(TEAM_ALL, gptr).unwrap();
        assert!(matches!(rt.gptr_getaddr(gptr), Err(Error::Invalid(_))));
    }

    #[test]
    fn collective_alloc_free_restores_state() {
        let rt = local_runtime();
        assert!(rt.table.lock().is_empty());
        let gptr = rt.team_memalloc_aligned(TEAM_ALL, 128).unwrap();
        assert_eq!(rt.table.lock().len(), 1);
        rt.team_memfree(TEAM_ALL, gptr).unwrap();
        assert!(rt.table.lock().is_empty());
    }

    #[test]
    fn mixed_segment_alloc_free() {
        let rt = local_runtime();
        let s1 = rt.team_memalloc_aligned(TEAM_ALL, 64).unwrap();
        let s2 = rt.team_memalloc_aligned(TEAM_ALL, 64).unwrap();
        let s3 = rt.team_memalloc_aligned(TEAM_ALL, 64).unwrap();
        assert!(s1.seg_id < s2.seg_id && s2.seg_id < s3.seg_id);

        rt.team_memfree(TEAM_ALL, s2).unwrap();
        assert!(!rt.gptr_getaddr(s1).unwrap().is_null());
        assert!(!rt.gptr_getaddr(s3).unwrap().is_null());
        assert!(matches!(rt.gptr_getaddr(s2), Err(Error::Invalid(_))));

        rt.team_memfree(TEAM_ALL, s1).unwrap();
        rt.team_memfree(TEAM_ALL, s3).unwrap();
    }

    #[test]
    fn one_member_team_create_destroy() {
        let rt = local_runtime();
        let group = Group::new(&[0], 1).unwrap();
        let team = rt.team_create(TEAM_ALL, &group).unwrap().unwrap();
        assert_ne!(team, TEAM_ALL);
        assert_eq!(rt.team_size(team).unwrap(), 1);
        assert_eq!(rt.team_myid(team).unwrap(), 0);
        assert_eq!(rt.team_unit_l2g(team, 0).unwrap(), 0);
        assert_eq!(rt.team_unit_g2l(team, 0).unwrap(), 0);

        // a second create picks a fresh id
        let team2 = rt.team_create(TEAM_ALL, &group).unwrap().unwrap();
        assert_ne!(team, team2);

        rt.team_destroy(team).unwrap();
        rt.team_destroy(team2).unwrap();
        assert!(matches!(rt.team_size(team), Err(Error::Invalid(_))));
    }

    #[test]
    fn team_scoped_collective_alloc() {
        let rt = local_runtime();
        let group = Group::new(&[0], 1).unwrap();
        let team = rt.team_create(TEAM_ALL, &group).unwrap().unwrap();
        let gptr = rt.team_memalloc_aligned(team, 512).unwrap();
        assert!(gptr.flags > 0, "sub-team slot index rides in the flags");
        rt.team_memfree(team, gptr).unwrap();
        rt.team_destroy(team).unwrap();
    }

    #[test]
    fn universal_team_ops() {
        let rt = local_runtime();
        assert_eq!(rt.team_size(TEAM_ALL).unwrap(), 1);
        assert_eq!(rt.team_unit_g2l(TEAM_ALL, 0).unwrap(), 0);
        assert!(rt.team_unit_g2l(TEAM_ALL, 9).is_err());
        assert!(rt.team_destroy(TEAM_ALL).is_err());
        rt.barrier(TEAM_ALL).unwrap();
    }

    #[test]
    fn handle_rma_roundtrip() {
        let rt = local_runtime();
        let gptr = rt.memalloc(64).unwrap();
        let src = [11u64, 22, 33];
        let mut h = rt.put_handle(gptr, &src).unwrap();
        h.wait().unwrap();
        h.wait().unwrap(); // second wait is a no-op

        let mut dst = [0u64; 3];
        let mut h = rt.get_handle(gptr, &mut dst).unwrap();
        assert!(h.test().unwrap());
        assert_eq!(dst, src);
        rt.memfree(gptr).unwrap();
    }
}
