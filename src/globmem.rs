use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::translation::SegmentEntry;
use crate::transport::TransportOps;

use tracing::{debug, warn};

/// A pointer into the partitioned global address space.
///
/// `offset` is relative to the process-private local pool when `seg_id == 0`
/// and relative to the owning unit's sub-memory of segment `seg_id`
/// otherwise. For collective segments `flags` carries the team slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct GlobalPtr {
    pub unit: u32,
    pub seg_id: i16,
    pub flags: u16,
    pub offset: u64,
}

/// The null global pointer.
pub const GPTR_NULL: GlobalPtr = GlobalPtr {
    unit: 0,
    seg_id: 0,
    flags: 0,
    offset: 0,
};

impl GlobalPtr {
    pub fn is_null(&self) -> bool {
        *self == GPTR_NULL
    }

    /// Pure pointer arithmetic on the offset; no validity check.
    pub fn incaddr(&mut self, delta: i64) {
        self.offset = self.offset.wrapping_add(delta as u64);
    }

    /// Overwrite the owning unit.
    pub fn setunit(&mut self, unit: u32) {
        self.unit = unit;
    }
}

impl std::fmt::Display for GlobalPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "gptr(unit {}, seg {}, off {:#x})",
            self.unit, self.seg_id, self.offset
        )
    }
}

impl Runtime {
    /// Translate `gptr` to a local address. Resolves only on the owning
    /// unit; on any other unit the result is a null pointer, not an error.
    pub fn gptr_getaddr(&self, gptr: GlobalPtr) -> Result<*mut u8> {
        self.ensure_active()?;
        if self.myid() != gptr.unit as usize {
            return Ok(std::ptr::null_mut());
        }
        let base = if gptr.seg_id != 0 {
            self.table
                .lock()
                .get_selfbaseptr(gptr.seg_id)
                .map_err(|_| Error::Invalid(format!("unmapped segment {}", gptr.seg_id)))?
        } else {
            self.pool_base
        };
        Ok((base + gptr.offset as usize) as *mut u8)
    }

    /// Inverse of [`gptr_getaddr`](Runtime::gptr_getaddr): recompute the
    /// offset of `addr` relative to the pointer's segment base.
    pub fn gptr_setaddr(&self, gptr: &mut GlobalPtr, addr: *mut u8) -> Result<()> {
        self.ensure_active()?;
        let base = if gptr.seg_id != 0 {
            self.table
                .lock()
                .get_selfbaseptr(gptr.seg_id)
                .map_err(|_| Error::Invalid(format!("unmapped segment {}", gptr.seg_id)))?
        } else {
            self.pool_base
        };
        gptr.offset = (addr as usize).wrapping_sub(base) as u64;
        Ok(())
    }

    /// Allocate `nbytes` from the process-local pool. Local operation; the
    /// returned pointer has `seg_id == 0` and is owned by this unit.
    pub fn memalloc(&self, nbytes: usize) -> Result<GlobalPtr> {
        self.ensure_active()?;
        let offset = self
            .pool
            .lock()
            .alloc(nbytes)
            .ok_or_else(|| Error::Exhausted(format!("local pool ({} bytes requested)", nbytes)))?;
        debug!(unit = self.myid(), nbytes, offset, "local alloc");
        Ok(GlobalPtr {
            unit: self.myid() as u32,
            seg_id: 0,
            flags: 0,
            offset,
        })
    }

    /// Return a local allocation to the pool.
    pub fn memfree(&self, gptr: GlobalPtr) -> Result<()> {
        if self.is_finalized() {
            warn!(%gptr, "memfree after finalize ignored");
            return Ok(());
        }
        self.ensure_active()?;
        if gptr.seg_id != 0 || gptr.unit as usize != self.myid() {
            return Err(Error::Invalid(format!("{} is not a local allocation", gptr)));
        }
        self.pool
            .lock()
            .free(gptr.offset)
            .map_err(|_| Error::Invalid(format!("unknown offset {:#x}", gptr.offset)))?;
        debug!(unit = self.myid(), offset = gptr.offset, "local free");
        Ok(())
    }

    /// Collectively allocate `nbytes` per member of `team_id`, register the
    /// backing with the transport, and gather every member's displacement
    /// into the translation table.
    ///
    /// All members observe the same segment id (the counter advances in
    /// lockstep) and receive a pointer to the allocation owned by the team's
    /// local rank 0.
    pub fn team_memalloc_aligned(&self, team_id: u32, nbytes: usize) -> Result<GlobalPtr> {
        self.ensure_active()?;
        let (index, label, group) = {
            let teams = self.teams.lock();
            let index = teams.convert(team_id)?;
            let slot = teams.get(index)?;
            (index, slot.label, slot.group.clone())
        };
        group.g2l(self.myid())?;

        let sub_mem = self.transport.register(nbytes)?;
        let mut disp = vec![0u64; group.size()];
        self.transport.allgather(label, &[sub_mem as u64], &mut disp)?;

        let seg_id = {
            let mut next = self.next_seg_id.lock();
            if *next == i16::MAX {
                return Err(Error::Exhausted("collective segment ids".into()));
            }
            let id = *next;
            *next += 1;
            id
        };

        let shared = self.gather_shared(&group, &disp);
        self.table.lock().add(SegmentEntry {
            seg_id,
            nbytes,
            disp,
            self_base: sub_mem,
            shared,
        })?;

        let owner = group.l2g(0)?;
        debug!(
            unit = self.myid(),
            nbytes, seg_id, owner, team_id, "collective alloc"
        );
        Ok(GlobalPtr {
            unit: owner as u32,
            seg_id,
            flags: index as u16,
            offset: 0,
        })
    }

    /// Collectively free a segment: detach the backing, drop the
    /// translation entry. Members must pass the pointer returned by the
    /// matching allocation.
    pub fn team_memfree(&self, team_id: u32, gptr: GlobalPtr) -> Result<()> {
        if self.is_finalized() {
            warn!(%gptr, "team_memfree after finalize ignored");
            return Ok(());
        }
        self.ensure_active()?;
        if gptr.seg_id == 0 {
            return Err(Error::Invalid(format!("{} is not a collective segment", gptr)));
        }
        let label = {
            let teams = self.teams.lock();
            let index = teams.convert(team_id)?;
            teams.get(index)?.label
        };
        // every member reaches the free before any backing disappears
        self.transport.barrier(label)?;
        let entry = self
            .table
            .lock()
            .remove(gptr.seg_id)
            .map_err(|_| Error::Invalid(format!("unmapped segment {}", gptr.seg_id)))?;
        self.transport.unregister(entry.self_base);
        debug!(
            unit = self.myid(),
            seg_id = gptr.seg_id,
            team_id,
            "collective free"
        );
        Ok(())
    }

    /// Collectively register caller-provided memory with the team, returning
    /// a global pointer to team-local rank 0's registration. Registered
    /// segments draw from their own (negative) id space so they never
    /// collide with collective allocations.
    pub fn team_memregister(
        &self,
        team_id: u32,
        addr: *mut u8,
        nbytes: usize,
    ) -> Result<GlobalPtr> {
        self.ensure_active()?;
        if addr.is_null() {
            return Err(Error::Invalid("cannot register a null pointer".into()));
        }
        let (index, label, group) = {
            let teams = self.teams.lock();
            let index = teams.convert(team_id)?;
            let slot = teams.get(index)?;
            (index, slot.label, slot.group.clone())
        };
        group.g2l(self.myid())?;

        let mut disp = vec![0u64; group.size()];
        self.transport
            .allgather(label, &[addr as u64], &mut disp)?;

        let seg_id = {
            let mut next = self.next_reg_id.lock();
            if *next == i16::MIN {
                return Err(Error::Exhausted("registered segment ids".into()));
            }
            let id = *next;
            *next -= 1;
            id
        };

        let shared = self.gather_shared(&group, &disp);
        self.table.lock().add(SegmentEntry {
            seg_id,
            nbytes,
            disp,
            self_base: addr as usize,
            shared,
        })?;

        let owner = group.l2g(0)?;
        debug!(unit = self.myid(), nbytes, seg_id, team_id, "memregister");
        Ok(GlobalPtr {
            unit: owner as u32,
            seg_id,
            flags: index as u16,
            offset: 0,
        })
    }

    /// Collectively deregister memory previously attached with
    /// [`team_memregister`](Runtime::team_memregister). The caller keeps
    /// ownership of the backing bytes.
    pub fn team_memderegister(&self, team_id: u32, gptr: GlobalPtr) -> Result<()> {
        if self.is_finalized() {
            warn!(%gptr, "team_memderegister after finalize ignored");
            return Ok(());
        }
        self.ensure_active()?;
        if gptr.seg_id >= 0 {
            return Err(Error::Invalid(format!("{} is not a registered segment", gptr)));
        }
        let label = {
            let teams = self.teams.lock();
            let index = teams.convert(team_id)?;
            teams.get(index)?.label
        };
        self.transport.barrier(label)?;
        self.table
            .lock()
            .remove(gptr.seg_id)
            .map_err(|_| Error::Invalid(format!("unmapped segment {}", gptr.seg_id)))?;
        debug!(unit = self.myid(), seg_id = gptr.seg_id, "memderegister");
        Ok(())
    }

    /// Node-local fast-path addresses for every member's sub-memory, when
    /// the backend provides them.
    fn gather_shared(&self, group: &crate::group::Group, disp: &[u64]) -> Option<Vec<usize>> {
        group
            .members()
            .iter()
            .zip(disp.iter())
            .map(|(&pe, &addr)| self.transport.shared_base(pe, addr as usize))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incaddr_roundtrip() {
        let mut g = GlobalPtr {
            unit: 3,
            seg_id: 2,
            flags: 1,
            offset: 0x40,
        };
        let orig = g;
        g.incaddr(0x100);
        g.incaddr(-0x100);
        assert_eq!(g, orig);
    }

    #[test]
    fn setunit_overwrites_owner() {
        let mut g = GPTR_NULL;
        g.setunit(5);
        assert_eq!(g.unit, 5);
        assert!(!g.is_null());
    }

    #[test]
    fn null_is_null() {
        assert!(GPTR_NULL.is_null());
    }
}
