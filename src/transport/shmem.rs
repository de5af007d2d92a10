use crate::alloc::RegionAlloc;
use crate::env_var::config;
use crate::error::{Error, Result};
use crate::transport::{
    AllocError, AllocResult, Backend, GroupLabel, Reduce, ReduceOp, Remote, TransportOps,
};

use parking_lot::{Mutex, RwLock};
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

struct MyShmem {
    data: *mut u8,
    _shmem: Shmem,
}
unsafe impl Sync for MyShmem {}
unsafe impl Send for MyShmem {}

impl MyShmem {
    fn as_ptr(&self) -> *mut u8 {
        self.data
    }
}

/// Create-or-open a named mapping shared by every pe of the job. The first
/// byte-word is a header the creator stamps once the mapping is usable;
/// late openers spin until they observe it.
fn attach_to_shmem(size: usize, id: &str, header: usize, create: bool) -> Result<MyShmem> {
    let size = size + std::mem::size_of::<usize>();
    let shmem_id = format!("lattice_{}_{}_{}", config().job_id, size, id);
    let mut retry = 0;
    let m = loop {
        match ShmemConf::new().size(size).os_id(shmem_id.clone()).create() {
            Ok(m) => {
                if create {
                    unsafe {
                        *(m.as_ptr() as *mut usize) = header;
                    }
                }
                break Ok(m);
            }
            Err(ShmemError::LinkExists)
            | Err(ShmemError::MappingIdExists)
            | Err(ShmemError::MapOpenFailed(_)) => {
                match ShmemConf::new().os_id(shmem_id.clone()).open() {
                    Ok(m) => {
                        if create {
                            unsafe {
                                *(m.as_ptr() as *mut usize) = header;
                            }
                        }
                        break Ok(m);
                    }
                    Err(ShmemError::MapOpenFailed(_)) if retry < 5 => {
                        retry += 1;
                        std::thread::sleep(std::time::Duration::from_millis(50));
                    }
                    Err(e) => break Err(e),
                }
            }
            Err(e) => break Err(e),
        }
    };
    let m = m.map_err(|e| Error::Transport(format!("shared memory {}: {:?}", shmem_id, e)))?;

    while unsafe { *(m.as_ptr() as *const usize) } != header {
        std::thread::yield_now();
    }

    Ok(unsafe {
        MyShmem {
            data: m.as_ptr().add(std::mem::size_of::<usize>()),
            _shmem: m,
        }
    })
}

/// Per-group coordination area: one epoch counter and one staging slot per
/// member. Collectives are write-slot / epoch-barrier / read-slots, chunked
/// when the payload exceeds a slot.
struct Board {
    shm: MyShmem,
    members: Vec<usize>,
    my_index: usize,
    slot_size: usize,
    epoch: Mutex<u64>,
}

impl Board {
    fn create(label: GroupLabel, members: Vec<usize>, my_pe: usize) -> Result<Board> {
        let my_index = members
            .iter()
            .position(|&pe| pe == my_pe)
            .ok_or_else(|| Error::Transport(format!("pe {} not in group {}", my_pe, label)))?;
        let slot_size = config().coord_slot_size;
        let size = members.len() * (std::mem::size_of::<u64>() + slot_size);
        let creator = members[0] == my_pe;
        // concurrent splits under one parent converge to the same label, so
        // the mapping name also carries the group's first member
        let name = format!("grp{}m{}", label, members[0]);
        let shm = attach_to_shmem(size, &name, label as usize + 1, creator)?;
        Ok(Board {
            shm,
            members,
            my_index,
            slot_size,
            epoch: Mutex::new(0),
        })
    }

    fn epoch_at(&self, index: usize) -> &AtomicU64 {
        unsafe { &*(self.shm.as_ptr().add(index * std::mem::size_of::<u64>()) as *const AtomicU64) }
    }

    fn slot_at(&self, index: usize) -> *mut u8 {
        let epochs = self.members.len() * std::mem::size_of::<u64>();
        unsafe { self.shm.as_ptr().add(epochs + index * self.slot_size) }
    }

    fn barrier(&self) {
        let mut ep = self.epoch.lock();
        *ep += 1;
        self.epoch_at(self.my_index).store(*ep, Ordering::SeqCst);
        for i in 0..self.members.len() {
            while self.epoch_at(i).load(Ordering::SeqCst) < *ep {
                std::thread::yield_now();
            }
        }
    }

    /// Gather `src` from every member, concatenated in member order.
    fn allgather_bytes(&self, src: &[u8], dst: &mut [u8]) {
        let n = self.members.len();
        let bytes = src.len();
        debug_assert_eq!(dst.len(), bytes * n);
        let mut off = 0;
        while off < bytes {
            let chunk = (bytes - off).min(self.slot_size);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().add(off),
                    self.slot_at(self.my_index),
                    chunk,
                );
            }
            self.barrier();
            for i in 0..n {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.slot_at(i),
                        dst.as_mut_ptr().add(i * bytes + off),
                        chunk,
                    );
                }
            }
            self.barrier();
            off += chunk;
        }
    }

    fn bcast_bytes(&self, root: usize, data: &mut [u8]) {
        let bytes = data.len();
        let mut off = 0;
        while off < bytes {
            let chunk = (bytes - off).min(self.slot_size);
            if self.my_index == root {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr().add(off),
                        self.slot_at(root),
                        chunk,
                    );
                }
            }
            self.barrier();
            unsafe {
                std::ptr::copy_nonoverlapping(self.slot_at(root), data.as_mut_ptr().add(off), chunk);
            }
            self.barrier();
            off += chunk;
        }
    }
}

/// Multi process single node backend. One node-wide mapping holds every pe's
/// registration region; remote addresses are translated through the owner's
/// region base recorded at startup, so RMA is a translated memcpy.
pub(crate) struct ShmemTransport {
    my_pe: usize,
    num_pes: usize,
    region_size: usize,
    pool: MyShmem,
    /// each pe's own-address-space base of its region, gathered at startup
    bases: Vec<usize>,
    region: Mutex<RegionAlloc>,
    staged: Mutex<HashMap<GroupLabel, Vec<usize>>>,
    boards: RwLock<HashMap<GroupLabel, Arc<Board>>>,
    next_label: AtomicU16,
}

impl ShmemTransport {
    pub(crate) fn new() -> Result<ShmemTransport> {
        let num_pes = config().num_pes;
        let my_pe = config().pe_id;
        if my_pe >= num_pes {
            return Err(Error::Transport(format!(
                "pe id {} out of range for world of {}",
                my_pe, num_pes
            )));
        }
        let region_size = config().pool_size * 2;
        let pool = attach_to_shmem(region_size * num_pes, "pool", 1, my_pe == 0)?;

        let world = Board::create(0, (0..num_pes).collect(), my_pe)?;
        let my_base = pool.as_ptr() as usize + region_size * my_pe;
        let mut bases = vec![0usize; num_pes];
        world.allgather_bytes(&my_base.to_ne_bytes(), unsafe {
            std::slice::from_raw_parts_mut(
                bases.as_mut_ptr() as *mut u8,
                num_pes * std::mem::size_of::<usize>(),
            )
        });
        debug!(my_pe, num_pes, "shmem transport attached");

        let mut boards = HashMap::new();
        boards.insert(0, Arc::new(world));
        Ok(ShmemTransport {
            my_pe,
            num_pes,
            region_size,
            pool,
            bases,
            region: Mutex::new(RegionAlloc::new(my_base, region_size)),
            staged: Mutex::new(HashMap::new()),
            boards: RwLock::new(boards),
            next_label: AtomicU16::new(1),
        })
    }

    fn board(&self, label: GroupLabel) -> Result<Arc<Board>> {
        self.boards
            .read()
            .get(&label)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("group {} is not committed", label)))
    }

    /// Translate an address in `pe`'s address space into this process'
    /// mapping of the same memory.
    fn resolve(&self, pe: usize, addr: usize) -> Result<usize> {
        if pe >= self.num_pes {
            return Err(Error::Transport(format!("pe {} out of range", pe)));
        }
        let base = self.bases[pe];
        if addr < base || addr >= base + self.region_size {
            return Err(Error::Transport(format!(
                "address {:#x} is not registered on pe {}",
                addr, pe
            )));
        }
        Ok(self.pool.as_ptr() as usize + self.region_size * pe + (addr - base))
    }

    pub(crate) fn put<T: Remote>(&self, pe: usize, src: &[T], dst_addr: usize) -> Result<()> {
        let dst = self.resolve(pe, dst_addr)?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut T, src.len());
        }
        Ok(())
    }

    pub(crate) fn get<T: Remote>(&self, pe: usize, src_addr: usize, dst: &mut [T]) -> Result<()> {
        let src = self.resolve(pe, src_addr)?;
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const T, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    pub(crate) fn allgather<T: Remote>(
        &self,
        label: GroupLabel,
        src: &[T],
        dst: &mut [T],
    ) -> Result<()> {
        let board = self.board(label)?;
        let bytes = std::mem::size_of_val(src);
        let src_bytes = unsafe { std::slice::from_raw_parts(src.as_ptr() as *const u8, bytes) };
        let dst_bytes = unsafe {
            std::slice::from_raw_parts_mut(dst.as_mut_ptr() as *mut u8, std::mem::size_of_val(dst))
        };
        board.allgather_bytes(src_bytes, dst_bytes);
        Ok(())
    }

    pub(crate) fn allreduce<T: Reduce>(
        &self,
        label: GroupLabel,
        op: ReduceOp,
        src: &[T],
        dst: &mut [T],
    ) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        let board = self.board(label)?;
        let n = board.members.len();
        let mut gathered = vec![src[0]; src.len() * n];
        drop(board);
        self.allgather(label, src, &mut gathered)?;
        for j in 0..src.len() {
            let mut acc = gathered[j];
            for i in 1..n {
                acc = T::combine(op, acc, gathered[i * src.len() + j]);
            }
            dst[j] = acc;
        }
        Ok(())
    }

    pub(crate) fn bcast<T: Remote>(
        &self,
        label: GroupLabel,
        root: usize,
        data: &mut [T],
    ) -> Result<()> {
        let board = self.board(label)?;
        let bytes = std::mem::size_of_val(data);
        let data_bytes =
            unsafe { std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut u8, bytes) };
        board.bcast_bytes(root, data_bytes);
        Ok(())
    }
}

impl TransportOps for ShmemTransport {
    fn my_pe(&self) -> usize {
        self.my_pe
    }
    fn num_pes(&self) -> usize {
        self.num_pes
    }
    fn backend(&self) -> Backend {
        Backend::Shmem
    }

    fn group_create(&self) -> Result<GroupLabel> {
        let label = self.next_label.fetch_add(1, Ordering::SeqCst);
        self.staged.lock().insert(label, Vec::new());
        Ok(label)
    }

    fn group_add(&self, label: GroupLabel, pe: usize) -> Result<()> {
        if pe >= self.num_pes {
            return Err(Error::Transport(format!("pe {} out of range", pe)));
        }
        let mut staged = self.staged.lock();
        let members = staged
            .get_mut(&label)
            .ok_or_else(|| Error::Transport(format!("unknown group {}", label)))?;
        members.push(pe);
        Ok(())
    }

    fn group_commit(&self, label: GroupLabel) -> Result<()> {
        let members = self
            .staged
            .lock()
            .remove(&label)
            .ok_or_else(|| Error::Transport(format!("unknown group {}", label)))?;
        let board = Board::create(label, members, self.my_pe)?;
        board.barrier();
        self.boards.write().insert(label, Arc::new(board));
        Ok(())
    }

    fn group_delete(&self, label: GroupLabel) -> Result<()> {
        self.staged.lock().remove(&label);
        self.boards.write().remove(&label);
        Ok(())
    }

    fn barrier(&self, label: GroupLabel) -> Result<()> {
        self.board(label)?.barrier();
        Ok(())
    }

    fn register(&self, nbytes: usize) -> AllocResult<usize> {
        self.region
            .lock()
            .try_alloc(nbytes.max(1))
            .ok_or(AllocError::OutOfMemory(nbytes))
    }

    fn unregister(&self, addr: usize) {
        if self.region.lock().free(addr).is_err() {
            trace!(addr, "unregister of unknown address ignored");
        }
    }

    fn shared_base(&self, pe: usize, remote_addr: usize) -> Option<usize> {
        self.resolve(pe, remote_addr).ok()
    }

    fn shutdown(&self) {
        let occupied = self.region.lock().occupied();
        if occupied > 0 {
            debug!(occupied, "shmem transport shutting down with live registrations");
        }
    }
}

impl std::fmt::Debug for ShmemTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ShmemTransport {{ pe {}/{}, region {:#x}+{:#x} }}",
            self.my_pe, self.num_pes, self.bases[self.my_pe], self.region_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // labels vary per run so stale mappings from earlier test binaries are
    // never reattached
    fn test_label(offset: u16) -> GroupLabel {
        ((std::process::id() as u16) % 30000) + 20000 + offset
    }

    #[test]
    fn board_allgather_across_threads() {
        let label = test_label(0);
        let members = vec![0usize, 1, 2];
        let mut handles = vec![];
        for pe in 0..3usize {
            let members = members.clone();
            handles.push(std::thread::spawn(move || {
                let board = Board::create(label, members, pe).unwrap();
                board.barrier();
                let me = [pe as u64 * 10];
                let mut out = [0u64; 3];
                let src =
                    unsafe { std::slice::from_raw_parts(me.as_ptr() as *const u8, 8) };
                let dst = unsafe {
                    std::slice::from_raw_parts_mut(out.as_mut_ptr() as *mut u8, 24)
                };
                board.allgather_bytes(src, dst);
                out
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap(), [0, 10, 20]);
        }
    }

    #[test]
    fn board_bcast_across_threads() {
        let label = test_label(1);
        let members = vec![0usize, 1];
        let mut handles = vec![];
        for pe in 0..2usize {
            let members = members.clone();
            handles.push(std::thread::spawn(move || {
                let board = Board::create(label, members, pe).unwrap();
                let mut data = if pe == 1 { [42u64] } else { [0u64] };
                let bytes = unsafe {
                    std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut u8, 8)
                };
                board.bcast_bytes(1, bytes);
                data[0]
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 42);
        }
    }
}
