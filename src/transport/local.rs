use crate::error::{Error, Result};
use crate::transport::{
    err_uncommitted, AllocResult, Backend, GroupLabel, Reduce, ReduceOp, Remote, TransportOps,
};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Single process backend: a world of one pe, RMA as plain memcpy, and
/// identity collectives.
#[derive(Debug)]
pub(crate) struct LocalTransport {
    allocs: Arc<Mutex<HashMap<usize, MyPtr>>>,
    groups: Mutex<HashMap<GroupLabel, GroupState>>,
    next_label: AtomicU16,
}

#[derive(Debug)]
struct GroupState {
    members: Vec<usize>,
    committed: bool,
}

#[derive(Debug)]
struct MyPtr {
    ptr: *mut [u8],
}
unsafe impl Sync for MyPtr {}
unsafe impl Send for MyPtr {}

impl LocalTransport {
    pub(crate) fn new() -> LocalTransport {
        LocalTransport {
            allocs: Arc::new(Mutex::new(HashMap::new())),
            groups: Mutex::new(HashMap::new()),
            // label 0 is reserved for the world group
            next_label: AtomicU16::new(1),
        }
    }

    fn check_committed(&self, label: GroupLabel) -> Result<()> {
        if label == 0 {
            return Ok(());
        }
        let groups = self.groups.lock();
        match groups.get(&label) {
            Some(g) if g.committed => Ok(()),
            Some(_) => Err(err_uncommitted(label)),
            None => Err(Error::Transport(format!("unknown group {}", label))),
        }
    }

    pub(crate) fn put<T: Remote>(&self, _pe: usize, src: &[T], dst_addr: usize) -> Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst_addr as *mut T, src.len());
        }
        Ok(())
    }

    pub(crate) fn get<T: Remote>(&self, _pe: usize, src_addr: usize, dst: &mut [T]) -> Result<()> {
        unsafe {
            std::ptr::copy_nonoverlapping(src_addr as *const T, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    pub(crate) fn allgather<T: Remote>(
        &self,
        label: GroupLabel,
        src: &[T],
        dst: &mut [T],
    ) -> Result<()> {
        self.check_committed(label)?;
        dst[..src.len()].copy_from_slice(src);
        Ok(())
    }

    pub(crate) fn allreduce<T: Reduce>(
        &self,
        label: GroupLabel,
        _op: ReduceOp,
        src: &[T],
        dst: &mut [T],
    ) -> Result<()> {
        self.check_committed(label)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    pub(crate) fn bcast<T: Remote>(
        &self,
        label: GroupLabel,
        _root: usize,
        _data: &mut [T],
    ) -> Result<()> {
        self.check_committed(label)
    }
}

impl TransportOps for LocalTransport {
    fn my_pe(&self) -> usize {
        0
    }
    fn num_pes(&self) -> usize {
        1
    }
    fn backend(&self) -> Backend {
        Backend::Local
    }

    fn group_create(&self) -> Result<GroupLabel> {
        let label = self.next_label.fetch_add(1, Ordering::SeqCst);
        self.groups.lock().insert(
            label,
            GroupState {
                members: Vec::new(),
                committed: false,
            },
        );
        Ok(label)
    }

    fn group_add(&self, label: GroupLabel, pe: usize) -> Result<()> {
        let mut groups = self.groups.lock();
        let group = groups
            .get_mut(&label)
            .ok_or_else(|| Error::Transport(format!("unknown group {}", label)))?;
        if pe != 0 {
            return Err(Error::Transport(format!(
                "pe {} does not exist in a local world",
                pe
            )));
        }
        group.members.push(pe);
        Ok(())
    }

    fn group_commit(&self, label: GroupLabel) -> Result<()> {
        let mut groups = self.groups.lock();
        let group = groups
            .get_mut(&label)
            .ok_or_else(|| Error::Transport(format!("unknown group {}", label)))?;
        group.committed = true;
        trace!(label, members = group.members.len(), "group committed");
        Ok(())
    }

    fn group_delete(&self, label: GroupLabel) -> Result<()> {
        self.groups.lock().remove(&label);
        Ok(())
    }

    fn barrier(&self, label: GroupLabel) -> Result<()> {
        self.check_committed(label)
    }

    fn register(&self, nbytes: usize) -> AllocResult<usize> {
        // zero length registrations still need a distinct address
        let data = vec![0u8; nbytes.max(1)].into_boxed_slice();
        let data_ptr = Box::into_raw(data);
        let data_addr = data_ptr as *const u8 as usize;
        self.allocs.lock().insert(data_addr, MyPtr { ptr: data_ptr });
        Ok(data_addr)
    }

    fn unregister(&self, addr: usize) {
        let mut allocs = self.allocs.lock();
        if let Some(data_ptr) = allocs.remove(&addr) {
            unsafe { drop(Box::from_raw(data_ptr.ptr)) };
        }
    }

    fn shared_base(&self, _pe: usize, remote_addr: usize) -> Option<usize> {
        Some(remote_addr)
    }

    fn shutdown(&self) {
        trace!("local transport shutting down");
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        let mut allocs = self.allocs.lock();
        for (_addr, data_ptr) in allocs.drain() {
            unsafe { drop(Box::from_raw(data_ptr.ptr)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rma_roundtrip() {
        let t = LocalTransport::new();
        let addr = t.register(64).unwrap();
        let src = [1u64, 2, 3, 4];
        t.put(0, &src, addr).unwrap();
        let mut dst = [0u64; 4];
        t.get(0, addr, &mut dst).unwrap();
        assert_eq!(src, dst);
        t.unregister(addr);
    }

    #[test]
    fn group_lifecycle() {
        let t = LocalTransport::new();
        let a = t.group_create().unwrap();
        let b = t.group_create().unwrap();
        assert!(b > a);
        t.group_add(b, 0).unwrap();
        assert!(t.barrier(b).is_err());
        t.group_commit(b).unwrap();
        t.barrier(b).unwrap();
        t.group_delete(b).unwrap();
        assert!(t.barrier(b).is_err());
    }

    #[test]
    fn collectives_are_identity() {
        let t = LocalTransport::new();
        let g = t.group_create().unwrap();
        t.group_add(g, 0).unwrap();
        t.group_commit(g).unwrap();
        let src = [7u32, 9];
        let mut gathered = [0u32; 2];
        t.allgather(g, &src, &mut gathered).unwrap();
        assert_eq!(gathered, src);
        let mut reduced = [0u32; 2];
        t.allreduce(g, ReduceOp::Max, &src, &mut reduced).unwrap();
        assert_eq!(reduced, src);
    }
}
