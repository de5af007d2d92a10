use crate::env_var::config;
use crate::error::{Error, Result};
use crate::handle::RmaHandle;

use enum_dispatch::enum_dispatch;

pub(crate) mod local;
pub(crate) mod shmem;

use local::LocalTransport;
use shmem::ShmemTransport;

/// The list of available transport backends, used to specify how data moves
/// between pes.
#[derive(
    serde::Serialize, serde::Deserialize, Debug, PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy,
)]
pub enum Backend {
    /// Single process execution
    Local,
    /// Multi process single node execution over shared memory
    Shmem,
}

impl Default for Backend {
    fn default() -> Self {
        match config().backend.as_str() {
            "shmem" => Backend::Shmem,
            _ => Backend::Local,
        }
    }
}

/// Transport-level group handle. Labels are minted monotonically so peers can
/// elect a collision-free label by allreducing their high-water marks.
pub(crate) type GroupLabel = u16;

#[derive(Debug, Clone, Copy)]
pub(crate) enum AllocError {
    OutOfMemory(usize),
    NotAMember(usize),
}

impl std::fmt::Display for AllocError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            AllocError::OutOfMemory(size) => {
                write!(f, "not enough memory to allocate {} bytes", size)
            }
            AllocError::NotAMember(pe) => {
                write!(f, "pe {} is not part of the allocating group", pe)
            }
        }
    }
}

impl std::error::Error for AllocError {}

pub(crate) type AllocResult<T> = std::result::Result<T, AllocError>;

/// Marker for element types that may be moved between pes with a plain copy.
pub trait Remote: Copy {}
impl<T: Copy> Remote for T {}

/// Reduction operators understood by `allreduce`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Min,
    Max,
    Sum,
}

/// Element types reducible by the transport collectives.
pub trait Reduce: Remote {
    fn combine(op: ReduceOp, a: Self, b: Self) -> Self;
}

macro_rules! impl_reduce {
    ($($t:ty),*) => {
        $(impl Reduce for $t {
            fn combine(op: ReduceOp, a: Self, b: Self) -> Self {
                match op {
                    ReduceOp::Min => a.min(b),
                    ReduceOp::Max => a.max(b),
                    ReduceOp::Sum => a.wrapping_add(b),
                }
            }
        })*
    };
}
impl_reduce!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

#[enum_dispatch(TransportOps)]
#[derive(Debug)]
pub(crate) enum Transport {
    Local(LocalTransport),
    Shmem(ShmemTransport),
}

/// The capability set the runtime core consumes from a backend.
#[enum_dispatch]
pub(crate) trait TransportOps {
    fn my_pe(&self) -> usize;
    fn num_pes(&self) -> usize;
    fn backend(&self) -> Backend;

    /// Mint a fresh group label. Labels strictly increase per process.
    fn group_create(&self) -> Result<GroupLabel>;
    /// Stage a member (global pe id) onto an uncommitted group.
    fn group_add(&self, label: GroupLabel, pe: usize) -> Result<()>;
    /// Commit the staged member set; collective over the staged members.
    fn group_commit(&self, label: GroupLabel) -> Result<()>;
    fn group_delete(&self, label: GroupLabel) -> Result<()>;

    /// Block until every member of the committed group has entered.
    fn barrier(&self, label: GroupLabel) -> Result<()>;

    /// Register `nbytes` of remotely addressable memory, returning its local
    /// address.
    fn register(&self, nbytes: usize) -> AllocResult<usize>;
    fn unregister(&self, addr: usize);

    /// Node-local fast path: the caller's own mapping of `remote_addr` on
    /// `pe`, when the backend can provide one.
    fn shared_base(&self, pe: usize, remote_addr: usize) -> Option<usize>;

    fn shutdown(&self);
}

// Data-carrying operations are generic over the element type, so they are
// dispatched by hand rather than through enum_dispatch.
impl Transport {
    pub(crate) fn put<T: Remote>(&self, pe: usize, src: &[T], dst_addr: usize) -> Result<()> {
        match self {
            Transport::Local(t) => t.put(pe, src, dst_addr),
            Transport::Shmem(t) => t.put(pe, src, dst_addr),
        }
    }

    pub(crate) fn get<T: Remote>(&self, pe: usize, src_addr: usize, dst: &mut [T]) -> Result<()> {
        match self {
            Transport::Local(t) => t.get(pe, src_addr, dst),
            Transport::Shmem(t) => t.get(pe, src_addr, dst),
        }
    }

    pub(crate) fn put_handle<T: Remote>(
        &self,
        pe: usize,
        src: &[T],
        dst_addr: usize,
    ) -> Result<RmaHandle> {
        self.put(pe, src, dst_addr)?;
        Ok(RmaHandle::ready())
    }

    pub(crate) fn get_handle<T: Remote>(
        &self,
        pe: usize,
        src_addr: usize,
        dst: &mut [T],
    ) -> Result<RmaHandle> {
        self.get(pe, src_addr, dst)?;
        Ok(RmaHandle::ready())
    }

    /// Gather `src` from every member of `label`, concatenated in group rank
    /// order into `dst` (`dst.len() == src.len() * group_size`).
    pub(crate) fn allgather<T: Remote>(
        &self,
        label: GroupLabel,
        src: &[T],
        dst: &mut [T],
    ) -> Result<()> {
        match self {
            Transport::Local(t) => t.allgather(label, src, dst),
            Transport::Shmem(t) => t.allgather(label, src, dst),
        }
    }

    /// Element-wise reduction of `src` across the group into `dst`.
    pub(crate) fn allreduce<T: Reduce>(
        &self,
        label: GroupLabel,
        op: ReduceOp,
        src: &[T],
        dst: &mut [T],
    ) -> Result<()> {
        match self {
            Transport::Local(t) => t.allreduce(label, op, src, dst),
            Transport::Shmem(t) => t.allreduce(label, op, src, dst),
        }
    }

    /// Broadcast `data` from the member with group-local rank `root`.
    pub(crate) fn bcast<T: Remote>(
        &self,
        label: GroupLabel,
        root: usize,
        data: &mut [T],
    ) -> Result<()> {
        match self {
            Transport::Local(t) => t.bcast(label, root, data),
            Transport::Shmem(t) => t.bcast(label, root, data),
        }
    }
}

pub(crate) fn create_transport(backend: Backend) -> Result<Transport> {
    match backend {
        Backend::Local => Ok(Transport::Local(LocalTransport::new())),
        Backend::Shmem => Ok(Transport::Shmem(ShmemTransport::new()?)),
    }
}

pub(crate) fn err_uncommitted(label: GroupLabel) -> Error {
    Error::Transport(format!("group {} is not committed", label))
}
