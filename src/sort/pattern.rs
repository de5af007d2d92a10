/// Block distribution of a global index space over the units of a team.
///
/// Unit `u` (team-local rank) owns the contiguous global range
/// `[prefix[u], prefix[u] + counts[u])`.
#[derive(Debug, Clone)]
pub struct BlockPattern {
    counts: Vec<usize>,
    prefix: Vec<usize>,
}

impl BlockPattern {
    pub fn new(counts: Vec<usize>) -> BlockPattern {
        let mut prefix = Vec::with_capacity(counts.len() + 1);
        let mut acc = 0usize;
        prefix.push(0);
        for &c in &counts {
            acc += c;
            prefix.push(acc);
        }
        BlockPattern { counts, prefix }
    }

    pub fn num_units(&self) -> usize {
        self.counts.len()
    }

    pub fn total(&self) -> usize {
        *self.prefix.last().unwrap_or(&0)
    }

    pub fn local_count(&self, unit: usize) -> usize {
        self.counts[unit]
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Exclusive prefix sums; `prefix()[u]` is the global index of unit `u`'s
    /// first element, `prefix()[num_units()]` the total.
    pub fn prefix(&self) -> &[usize] {
        &self.prefix
    }

    /// The unit owning global position `pos`. Units with empty ranges never
    /// own a position.
    pub fn unit_at(&self, pos: usize) -> Option<usize> {
        if pos >= self.total() {
            return None;
        }
        // first unit whose range ends beyond pos
        (0..self.counts.len()).find(|&u| pos < self.prefix[u + 1])
    }

    /// Global index of `local_offset` on `unit`.
    pub fn global_index(&self, unit: usize, local_offset: usize) -> usize {
        self.prefix[unit] + local_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_ownership() {
        let p = BlockPattern::new(vec![3, 0, 2]);
        assert_eq!(p.total(), 5);
        assert_eq!(p.unit_at(0), Some(0));
        assert_eq!(p.unit_at(2), Some(0));
        assert_eq!(p.unit_at(3), Some(2));
        assert_eq!(p.unit_at(4), Some(2));
        assert_eq!(p.unit_at(5), None);
    }

    #[test]
    fn global_index_is_prefix_plus_offset() {
        let p = BlockPattern::new(vec![4, 4]);
        assert_eq!(p.global_index(0, 2), 2);
        assert_eq!(p.global_index(1, 0), 4);
        assert_eq!(p.prefix(), &[0, 4, 8]);
    }

    #[test]
    fn empty_pattern() {
        let p = BlockPattern::new(vec![0, 0]);
        assert_eq!(p.total(), 0);
        assert_eq!(p.unit_at(0), None);
    }
}
