use crate::error::{Error, Result};
use crate::group::Group;
use crate::transport::GroupLabel;

/// Maximum number of live teams per process.
pub const TEAM_CAP: usize = 256;

/// The universal team holding every unit; permanently bound to slot 0.
pub const TEAM_ALL: u32 = 0;

/// Sentinel returned to units that are not members of a newly created team.
pub const TEAM_NULL: u32 = u32::MAX;

#[derive(Debug)]
pub(crate) struct TeamSlot {
    pub(crate) team_id: u32,
    pub(crate) label: GroupLabel,
    pub(crate) group: Group,
}

/// Fixed-capacity table of active teams. Slot 0 always holds the universal
/// team; other slots are allocated on team creation and recycled on destroy.
#[derive(Debug)]
pub(crate) struct TeamRegistry {
    slots: Vec<Option<TeamSlot>>,
}

impl TeamRegistry {
    pub(crate) fn new(world_size: usize) -> TeamRegistry {
        let mut slots: Vec<Option<TeamSlot>> = (0..TEAM_CAP).map(|_| None).collect();
        slots[0] = Some(TeamSlot {
            team_id: TEAM_ALL,
            label: 0,
            group: Group::universe(world_size),
        });
        TeamRegistry { slots }
    }

    /// Find the slot index holding `team_id`.
    pub(crate) fn convert(&self, team_id: u32) -> Result<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, Some(slot) if slot.team_id == team_id))
            .ok_or_else(|| Error::Invalid(format!("unknown team {}", team_id)))
    }

    /// Claim a free slot for a new team.
    pub(crate) fn alloc(&mut self, slot: TeamSlot) -> Result<usize> {
        let index = self
            .slots
            .iter()
            .skip(1)
            .position(|s| s.is_none())
            .map(|i| i + 1)
            .ok_or_else(|| Error::Exhausted(format!("all {} team slots in use", TEAM_CAP)))?;
        self.slots[index] = Some(slot);
        Ok(index)
    }

    /// Release a slot for reuse. Slot 0 is never recycled.
    pub(crate) fn recycle(&mut self, index: usize) -> Result<TeamSlot> {
        if index == 0 || index >= TEAM_CAP {
            return Err(Error::Invalid(format!("slot {} cannot be recycled", index)));
        }
        self.slots[index]
            .take()
            .ok_or_else(|| Error::Invalid(format!("slot {} is already free", index)))
    }

    pub(crate) fn get(&self, index: usize) -> Result<&TeamSlot> {
        self.slots
            .get(index)
            .and_then(|s| s.as_ref())
            .ok_or_else(|| Error::Invalid(format!("slot {} is not in use", index)))
    }

    pub(crate) fn live_teams(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(team_id: u32) -> TeamSlot {
        TeamSlot {
            team_id,
            label: team_id as GroupLabel,
            group: Group::new(&[0], 1).unwrap(),
        }
    }

    #[test]
    fn universal_team_in_slot_zero() {
        let reg = TeamRegistry::new(4);
        assert_eq!(reg.convert(TEAM_ALL).unwrap(), 0);
        assert_eq!(reg.get(0).unwrap().group.size(), 4);
    }

    #[test]
    fn alloc_convert_recycle() {
        let mut reg = TeamRegistry::new(2);
        let idx = reg.alloc(slot(1)).unwrap();
        assert_eq!(reg.convert(1).unwrap(), idx);
        let freed = reg.recycle(idx).unwrap();
        assert_eq!(freed.team_id, 1);
        assert!(matches!(reg.convert(1), Err(Error::Invalid(_))));
        // the slot is reusable
        let idx2 = reg.alloc(slot(2)).unwrap();
        assert_eq!(idx2, idx);
    }

    #[test]
    fn slot_zero_is_permanent() {
        let mut reg = TeamRegistry::new(2);
        assert!(reg.recycle(0).is_err());
    }

    #[test]
    fn exhaustion() {
        let mut reg = TeamRegistry::new(2);
        for id in 1..TEAM_CAP as u32 {
            reg.alloc(slot(id)).unwrap();
        }
        assert!(matches!(reg.alloc(slot(999)), Err(Error::Exhausted(_))));
        assert_eq!(reg.live_teams(), TEAM_CAP);
    }

    #[test]
    fn double_recycle_rejected() {
        let mut reg = TeamRegistry::new(2);
        let idx = reg.alloc(slot(1)).unwrap();
        reg.recycle(idx).unwrap();
        assert!(reg.recycle(idx).is_err());
    }
}
