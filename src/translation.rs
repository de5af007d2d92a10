use crate::error::{Error, Result};

use std::collections::HashMap;

/// Descriptor of one registered segment: the per-member sub-memory addresses
/// gathered at allocation time, this process' own base, and the node-local
/// mapped addresses when the backend has a shared-memory fast path.
#[derive(Debug, Clone)]
pub(crate) struct SegmentEntry {
    pub(crate) seg_id: i16,
    pub(crate) nbytes: usize,
    /// team-local rank -> sub-memory address on that unit
    pub(crate) disp: Vec<u64>,
    /// this process' own sub-memory base
    pub(crate) self_base: usize,
    /// team-local rank -> address of that unit's sub-memory in this process'
    /// mapping, when the transport can provide one
    pub(crate) shared: Option<Vec<usize>>,
}

impl SegmentEntry {
    pub(crate) fn disp_of(&self, team_local: usize) -> Result<u64> {
        self.disp.get(team_local).copied().ok_or_else(|| {
            Error::Invalid(format!(
                "rank {} out of range for segment {}",
                team_local, self.seg_id
            ))
        })
    }
}

/// Process-local table mapping segment ids to their descriptors. Mutated only
/// on collective allocation and free paths; removal is by id in any order.
#[derive(Debug, Default)]
pub(crate) struct TranslationTable {
    entries: HashMap<i16, SegmentEntry>,
}

impl TranslationTable {
    pub(crate) fn new() -> TranslationTable {
        TranslationTable {
            entries: HashMap::new(),
        }
    }

    pub(crate) fn add(&mut self, entry: SegmentEntry) -> Result<()> {
        let seg_id = entry.seg_id;
        if self.entries.insert(seg_id, entry).is_some() {
            return Err(Error::Invalid(format!("segment {} already mapped", seg_id)));
        }
        Ok(())
    }

    pub(crate) fn remove(&mut self, seg_id: i16) -> Result<SegmentEntry> {
        self.entries
            .remove(&seg_id)
            .ok_or_else(|| Error::NotFound(format!("segment {}", seg_id)))
    }

    pub(crate) fn get(&self, seg_id: i16) -> Result<&SegmentEntry> {
        self.entries
            .get(&seg_id)
            .ok_or_else(|| Error::NotFound(format!("segment {}", seg_id)))
    }

    pub(crate) fn get_selfbaseptr(&self, seg_id: i16) -> Result<usize> {
        Ok(self.get(seg_id)?.self_base)
    }

    pub(crate) fn get_disp(&self, seg_id: i16, team_local: usize) -> Result<u64> {
        self.get(seg_id)?.disp_of(team_local)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
