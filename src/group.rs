use crate::error::{Error, Result};

/// Ordered membership backing a team: a strictly increasing list of global
/// unit ids plus its reverse map over the world.
///
/// `g2l[l2g[i]] == Some(i)` for every local `i`; non-members map to `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    l2g: Vec<usize>,
    g2l: Vec<Option<usize>>,
}

impl Group {
    /// Build the canonical group for `members` in a world of `world_size`
    /// units. Members are deduplicated and sorted into canonical order.
    pub fn new(members: &[usize], world_size: usize) -> Result<Group> {
        if members.is_empty() {
            return Err(Error::Invalid("group must have at least one member".into()));
        }
        let mut l2g: Vec<usize> = members.to_vec();
        l2g.sort_unstable();
        l2g.dedup();
        if let Some(&last) = l2g.last() {
            if last >= world_size {
                return Err(Error::Invalid(format!(
                    "unit {} outside world of {}",
                    last, world_size
                )));
            }
        }
        let mut g2l = vec![None; world_size];
        for (local, &global) in l2g.iter().enumerate() {
            g2l[global] = Some(local);
        }
        Ok(Group { l2g, g2l })
    }

    /// The group covering every unit in the world.
    pub fn universe(world_size: usize) -> Group {
        Group {
            l2g: (0..world_size).collect(),
            g2l: (0..world_size).map(Some).collect(),
        }
    }

    pub fn size(&self) -> usize {
        self.l2g.len()
    }

    pub fn contains(&self, global: usize) -> bool {
        self.g2l.get(global).map_or(false, |l| l.is_some())
    }

    /// Team-local rank -> global unit id.
    pub fn l2g(&self, local: usize) -> Result<usize> {
        self.l2g
            .get(local)
            .copied()
            .ok_or_else(|| Error::Invalid(format!("local id {} out of range", local)))
    }

    /// Global unit id -> team-local rank.
    pub fn g2l(&self, global: usize) -> Result<usize> {
        self.g2l
            .get(global)
            .copied()
            .flatten()
            .ok_or_else(|| Error::Invalid(format!("unit {} is not a group member", global)))
    }

    /// Members in canonical order.
    pub fn members(&self) -> &[usize] {
        &self.l2g
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2g_g2l_roundtrip() {
        let g = Group::new(&[5, 1, 3], 8).unwrap();
        assert_eq!(g.size(), 3);
        for i in 0..g.size() {
            assert_eq!(g.g2l(g.l2g(i).unwrap()).unwrap(), i);
        }
        assert_eq!(g.members(), &[1, 3, 5]);
    }

    #[test]
    fn dedup_and_order() {
        let g = Group::new(&[2, 0, 2, 0], 4).unwrap();
        assert_eq!(g.members(), &[0, 2]);
        assert!(g.contains(0));
        assert!(!g.contains(1));
    }

    #[test]
    fn single_member() {
        let g = Group::new(&[3], 4).unwrap();
        assert_eq!(g.l2g(0).unwrap(), 3);
        assert_eq!(g.g2l(3).unwrap(), 0);
    }

    #[test]
    fn non_member_is_invalid() {
        let g = Group::new(&[1, 2], 4).unwrap();
        assert!(matches!(g.g2l(0), Err(Error::Invalid(_))));
        assert!(matches!(g.l2g(2), Err(Error::Invalid(_))));
        assert!(Group::new(&[], 4).is_err());
        assert!(Group::new(&[4], 4).is_err());
    }

    #[test]
    fn universe_covers_world() {
        let g = Group::universe(6);
        assert_eq!(g.size(), 6);
        assert_eq!(g.g2l(4).unwrap(), 4);
    }
}
