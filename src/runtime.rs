use crate::alloc::BuddyAlloc;
use crate::env_var::config;
use crate::error::{Error, Result};
use crate::group::Group;
use crate::handle::RmaHandle;
use crate::team::{TeamRegistry, TeamSlot, TEAM_ALL};
use crate::translation::TranslationTable;
use crate::transport::{
    create_transport, Backend, GroupLabel, Reduce, ReduceOp, Remote, Transport, TransportOps,
};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::globmem::GlobalPtr;

const STATE_ACTIVE: u8 = 1;
const STATE_FINALIZED: u8 = 2;

/// Builder for a [`Runtime`], selecting the transport backend before
/// initialization.
#[derive(Debug, Default)]
pub struct RuntimeBuilder {
    backend: Option<Backend>,
}

impl RuntimeBuilder {
    pub fn new() -> RuntimeBuilder {
        RuntimeBuilder { backend: None }
    }

    pub fn with_backend(mut self, backend: Backend) -> RuntimeBuilder {
        self.backend = Some(backend);
        self
    }

    /// Initialize the runtime: bring up the transport, register the local
    /// pool, and exchange pool bases across the world.
    pub fn build(self) -> Result<Runtime> {
        let backend = self.backend.unwrap_or_default();
        let transport = create_transport(backend)?;
        let my_pe = transport.my_pe();
        let num_pes = transport.num_pes();

        let pool_size = config().pool_size;
        let pool_base = transport.register(pool_size)?;
        let mut pool_bases = vec![0u64; num_pes];
        transport.allgather(0, &[pool_base as u64], &mut pool_bases)?;
        debug!(my_pe, num_pes, pool_size, "runtime initialized");

        Ok(Runtime {
            transport: Arc::new(transport),
            my_pe,
            num_pes,
            state: AtomicU8::new(STATE_ACTIVE),
            teams: Mutex::new(TeamRegistry::new(num_pes)),
            table: Mutex::new(TranslationTable::new()),
            pool: Mutex::new(BuddyAlloc::new(pool_size)),
            pool_base,
            pool_bases,
            next_team_id: Mutex::new(1),
            label_top: Mutex::new(0),
            next_seg_id: Mutex::new(1),
            next_reg_id: Mutex::new(-1),
        })
    }
}

/// The process-wide runtime: transport, team registry, translation table,
/// and the local memory pool, threaded explicitly through the public API.
pub struct Runtime {
    pub(crate) transport: Arc<Transport>,
    my_pe: usize,
    num_pes: usize,
    state: AtomicU8,
    pub(crate) teams: Mutex<TeamRegistry>,
    pub(crate) table: Mutex<TranslationTable>,
    pub(crate) pool: Mutex<BuddyAlloc>,
    pub(crate) pool_base: usize,
    pub(crate) pool_bases: Vec<u64>,
    next_team_id: Mutex<u32>,
    label_top: Mutex<GroupLabel>,
    pub(crate) next_seg_id: Mutex<i16>,
    pub(crate) next_reg_id: Mutex<i16>,
}

impl Runtime {
    /// Initialize with the backend selected by the environment.
    pub fn init() -> Result<Runtime> {
        RuntimeBuilder::new().build()
    }

    /// This unit's id in the universal team.
    pub fn myid(&self) -> usize {
        self.my_pe
    }

    /// Number of units in the universal team.
    pub fn size(&self) -> usize {
        self.num_pes
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.state.load(Ordering::SeqCst) == STATE_ACTIVE {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_FINALIZED
    }

    /// Tear the runtime down. Collective over the universal team; after this
    /// every deallocation becomes a logged no-op.
    pub fn finalize(&self) -> Result<()> {
        self.ensure_active()?;
        self.transport.barrier(0)?;
        {
            let table = self.table.lock();
            if !table.is_empty() {
                warn!(segments = table.len(), "finalizing with live segments");
            }
            let teams = self.teams.lock();
            if teams.live_teams() > 1 {
                warn!(teams = teams.live_teams() - 1, "finalizing with live teams");
            }
        }
        self.transport.unregister(self.pool_base);
        self.state.store(STATE_FINALIZED, Ordering::SeqCst);
        self.transport.shutdown();
        Ok(())
    }

    // ------------------------------------------------------------------
    // teams
    // ------------------------------------------------------------------

    pub(crate) fn team_label(&self, team_id: u32) -> Result<GroupLabel> {
        let teams = self.teams.lock();
        let index = teams.convert(team_id)?;
        Ok(teams.get(index)?.label)
    }

    /// The group backing `team_id`.
    pub fn team_get_group(&self, team_id: u32) -> Result<Group> {
        self.ensure_active()?;
        let teams = self.teams.lock();
        let index = teams.convert(team_id)?;
        Ok(teams.get(index)?.group.clone())
    }

    /// This unit's rank within `team_id`.
    pub fn team_myid(&self, team_id: u32) -> Result<usize> {
        self.team_unit_g2l(team_id, self.my_pe)
    }

    pub fn team_size(&self, team_id: u32) -> Result<usize> {
        self.ensure_active()?;
        if team_id == TEAM_ALL {
            return Ok(self.num_pes);
        }
        let teams = self.teams.lock();
        let index = teams.convert(team_id)?;
        Ok(teams.get(index)?.group.size())
    }

    pub fn team_unit_l2g(&self, team_id: u32, local: usize) -> Result<usize> {
        self.ensure_active()?;
        let teams = self.teams.lock();
        let index = teams.convert(team_id)?;
        teams.get(index)?.group.l2g(local)
    }

    pub fn team_unit_g2l(&self, team_id: u32, global: usize) -> Result<usize> {
        self.ensure_active()?;
        if team_id == TEAM_ALL {
            if global < self.num_pes {
                return Ok(global);
            }
            return Err(Error::Invalid(format!("unit {} out of range", global)));
        }
        let teams = self.teams.lock();
        let index = teams.convert(team_id)?;
        teams.get(index)?.group.g2l(global)
    }

    /// Create a team from `group`, collective over the parent team. Every
    /// parent member must call this, members of the new group receive
    /// `Some(team_id)`, everyone else `None`.
    ///
    /// The id is the allreduce-MAX of the parent members' counters; the
    /// transport group label is minted past the allreduce-MAX of the label
    /// high-water marks, so concurrent splits never collide.
    pub fn team_create(&self, parent: u32, group: &Group) -> Result<Option<u32>> {
        self.ensure_active()?;
        let parent_label = self.team_label(parent)?;

        let next_id = *self.next_team_id.lock();
        let mut max_id = [0u32];
        self.transport
            .allreduce(parent_label, ReduceOp::Max, &[next_id], &mut max_id)?;
        let new_team_id = max_id[0];
        *self.next_team_id.lock() = new_team_id + 1;

        let label_top = *self.label_top.lock();
        let mut label_max = [0 as GroupLabel];
        self.transport
            .allreduce(parent_label, ReduceOp::Max, &[label_top], &mut label_max)?;

        if !group.contains(self.my_pe) {
            return Ok(None);
        }

        // mint labels until one clears every split partner's high-water mark
        let mut label = self.transport.group_create()?;
        while label <= label_max[0] {
            self.transport.group_delete(label)?;
            label = self.transport.group_create()?;
        }
        *self.label_top.lock() = label;

        for &member in group.members() {
            self.transport.group_add(label, member)?;
        }
        self.transport.group_commit(label)?;

        let alloc_result = self.teams.lock().alloc(TeamSlot {
            team_id: new_team_id,
            label,
            group: group.clone(),
        });

        // out-of-slots must fail uniformly across the new team
        let ok = [alloc_result.is_ok() as u32];
        let mut all_ok = [0u32];
        self.transport
            .allreduce(label, ReduceOp::Min, &ok, &mut all_ok)?;
        if all_ok[0] == 0 {
            if let Ok(index) = alloc_result {
                let _ = self.teams.lock().recycle(index);
            }
            self.transport.group_delete(label)?;
            return Err(Error::Exhausted("team slots during collective create".into()));
        }
        debug!(new_team_id, label, members = group.size(), "team created");
        Ok(Some(new_team_id))
    }

    /// Destroy a team, collective over its members. The transport group is
    /// deleted before the slot is recycled so a concurrent create can never
    /// observe a live foreign group in a recycled slot.
    pub fn team_destroy(&self, team_id: u32) -> Result<()> {
        self.ensure_active()?;
        if team_id == TEAM_ALL {
            return Err(Error::Invalid("the universal team cannot be destroyed".into()));
        }
        let label = self.team_label(team_id)?;
        self.transport.barrier(label)?;
        let index = {
            let teams = self.teams.lock();
            teams.convert(team_id)?
        };
        self.transport.group_delete(label)?;
        self.teams.lock().recycle(index)?;
        debug!(team_id, "team destroyed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // collectives over teams
    // ------------------------------------------------------------------

    pub fn barrier(&self, team_id: u32) -> Result<()> {
        self.ensure_active()?;
        let label = self.team_label(team_id)?;
        self.transport.barrier(label)
    }

    pub fn allreduce<T: Reduce>(
        &self,
        team_id: u32,
        op: ReduceOp,
        src: &[T],
        dst: &mut [T],
    ) -> Result<()> {
        self.ensure_active()?;
        let label = self.team_label(team_id)?;
        self.transport.allreduce(label, op, src, dst)
    }

    pub fn allgather<T: Remote>(&self, team_id: u32, src: &[T], dst: &mut [T]) -> Result<()> {
        self.ensure_active()?;
        let label = self.team_label(team_id)?;
        self.transport.allgather(label, src, dst)
    }

    pub fn bcast<T: Remote>(&self, team_id: u32, root: usize, data: &mut [T]) -> Result<()> {
        self.ensure_active()?;
        let label = self.team_label(team_id)?;
        self.transport.bcast(label, root, data)
    }

    // ------------------------------------------------------------------
    // one-sided RMA on global pointers
    // ------------------------------------------------------------------

    /// Absolute address of `gptr`'s target in its owner's address space.
    pub(crate) fn rma_target(&self, gptr: GlobalPtr) -> Result<(usize, usize)> {
        let pe = gptr.unit as usize;
        if pe >= self.num_pes {
            return Err(Error::Invalid(format!("unit {} out of range", pe)));
        }
        if gptr.seg_id != 0 {
            let local = {
                let teams = self.teams.lock();
                let slot = teams.get(gptr.flags as usize)?;
                slot.group.g2l(pe)?
            };
            let disp = self
                .table
                .lock()
                .get_disp(gptr.seg_id, local)
                .map_err(|_| Error::Invalid(format!("unmapped segment {}", gptr.seg_id)))?;
            Ok((pe, disp as usize + gptr.offset as usize))
        } else {
            Ok((pe, self.pool_bases[pe] as usize + gptr.offset as usize))
        }
    }

    /// Node-local fast path: the target's address in this process' own
    /// mapping, recorded once at allocation time.
    fn shared_target(&self, gptr: GlobalPtr, nbytes: usize) -> Option<usize> {
        if gptr.seg_id == 0 {
            return None;
        }
        let local = {
            let teams = self.teams.lock();
            let slot = teams.get(gptr.flags as usize).ok()?;
            slot.group.g2l(gptr.unit as usize).ok()?
        };
        let table = self.table.lock();
        let entry = table.get(gptr.seg_id).ok()?;
        if gptr.offset as usize + nbytes > entry.nbytes {
            return None;
        }
        entry
            .shared
            .as_ref()
            .map(|shared| shared[local] + gptr.offset as usize)
    }

    /// Blocking one-sided put of `src` into the memory referenced by `gptr`.
    pub fn put<T: Remote>(&self, gptr: GlobalPtr, src: &[T]) -> Result<()> {
        self.ensure_active()?;
        if let Some(addr) = self.shared_target(gptr, std::mem::size_of_val(src)) {
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), addr as *mut T, src.len());
            }
            return Ok(());
        }
        let (pe, addr) = self.rma_target(gptr)?;
        self.transport.put(pe, src, addr)
    }

    /// Blocking one-sided get from the memory referenced by `gptr`.
    pub fn get<T: Remote>(&self, gptr: GlobalPtr, dst: &mut [T]) -> Result<()> {
        self.ensure_active()?;
        if let Some(addr) = self.shared_target(gptr, std::mem::size_of_val(dst)) {
            unsafe {
                std::ptr::copy_nonoverlapping(addr as *const T, dst.as_mut_ptr(), dst.len());
            }
            return Ok(());
        }
        let (pe, addr) = self.rma_target(gptr)?;
        self.transport.get(pe, addr, dst)
    }

    /// Non-blocking put; completion is observed through the returned handle.
    pub fn put_handle<T: Remote>(&self, gptr: GlobalPtr, src: &[T]) -> Result<RmaHandle> {
        self.ensure_active()?;
        let (pe, addr) = self.rma_target(gptr)?;
        self.transport.put_handle(pe, src, addr)
    }

    /// Non-blocking get; completion is observed through the returned handle.
    pub fn get_handle<T: Remote>(&self, gptr: GlobalPtr, dst: &mut [T]) -> Result<RmaHandle> {
        self.ensure_active()?;
        let (pe, addr) = self.rma_target(gptr)?;
        self.transport.get_handle(pe, addr, dst)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.is_finalized() {
            trace!("runtime dropped without finalize");
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Runtime {{ pe {}/{}, backend {:?} }}",
            self.my_pe,
            self.num_pes,
            self.transport.backend()
        )
    }
}
