use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::sort::pattern::BlockPattern;
use crate::transport::ReduceOp;

use tracing::trace;

/// Keys the splitter search can bisect over. Restricted to integer-like
/// types: the search needs a midpoint in value space, not just an ordering.
pub trait SortKey: Ord + Copy + Default + Send + Sync + 'static {
    fn midpoint(lo: Self, hi: Self) -> Self;
}

macro_rules! impl_sort_key {
    ($($t:ty),*) => {
        $(impl SortKey for $t {
            fn midpoint(lo: Self, hi: Self) -> Self {
                // floor division keeps the probe at `lo` on a two-value
                // bracket, which the collapse step in the search relies on
                ((lo as i128 + hi as i128).div_euclid(2)) as $t
            }
        })*
    };
}
impl_sort_key!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

/// The partition plan produced by splitter selection.
///
/// `sep[u][i]` is the number of unit `u`'s locally sorted elements assigned
/// to partitions `0..=i`; partition `r` therefore receives unit `u`'s local
/// range `[border(u, r), border(u, r + 1))`. Row sums over units reproduce
/// the global partition boundaries exactly, so every unit's final slice
/// matches its capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SplitterPlan {
    pub(crate) counts: Vec<usize>,
    pub(crate) sep: Vec<Vec<usize>>,
}

impl SplitterPlan {
    pub(crate) fn num_units(&self) -> usize {
        self.counts.len()
    }

    pub(crate) fn border(&self, unit: usize, r: usize) -> usize {
        let p = self.num_units();
        if r == 0 {
            0
        } else if r >= p {
            self.counts[unit]
        } else {
            self.sep[unit][r - 1]
        }
    }

    /// `(target_count, src_disp, target_disp)` for unit `me` pulling from
    /// source unit `u`.
    pub(crate) fn send_info(&self, me: usize, u: usize) -> (usize, usize, usize) {
        let count = self.border(u, me + 1) - self.border(u, me);
        let src_disp = self.border(u, me);
        let target_disp = (0..u).map(|v| self.target_count(me, v)).sum();
        (count, src_disp, target_disp)
    }

    pub(crate) fn target_count(&self, me: usize, u: usize) -> usize {
        self.border(u, me + 1) - self.border(u, me)
    }

    /// Elements unit `me` must pull from each source unit.
    pub(crate) fn target_counts(&self, me: usize) -> Vec<usize> {
        (0..self.num_units())
            .map(|u| self.target_count(me, u))
            .collect()
    }

    /// Partition boundaries, in boundary order. Boundary `s` separates the
    /// final slices of units `s` and `s + 1`.
    pub(crate) fn splitters(&self) -> Vec<usize> {
        (0..self.num_units().saturating_sub(1)).collect()
    }
}

/// One boundary's bisection bracket. The invariants `global_lt(lo) <= target`
/// and `global_le(hi) >= target` guarantee a resolving value stays inside
/// the bracket.
#[derive(Debug, Clone)]
struct BoundaryState<K> {
    target: usize,
    lo: K,
    hi: K,
    probe: K,
    resolved: bool,
    global_lt: usize,
}

impl<K: SortKey> BoundaryState<K> {
    fn new(target: usize, lo: K, hi: K) -> BoundaryState<K> {
        BoundaryState {
            target,
            lo,
            hi,
            probe: K::midpoint(lo, hi),
            resolved: false,
            global_lt: 0,
        }
    }

    fn advance(&mut self, global_lt: usize, global_le: usize) {
        if self.resolved {
            return;
        }
        if global_lt <= self.target && self.target <= global_le {
            self.resolved = true;
            self.global_lt = global_lt;
        } else if global_le < self.target {
            // threshold too low; on a collapsed interval the upper end must
            // resolve, so force-probe it
            if self.probe == self.lo && self.hi != self.lo {
                self.lo = self.hi;
            } else {
                self.lo = self.probe;
            }
            self.probe = K::midpoint(self.lo, self.hi);
        } else {
            self.hi = self.probe;
            self.probe = K::midpoint(self.lo, self.hi);
        }
    }
}

fn local_lt_le<K: SortKey>(sorted: &[K], v: K) -> (usize, usize) {
    let lt = sorted.partition_point(|&k| k < v);
    let le = sorted.partition_point(|&k| k <= v);
    (lt, le)
}

/// Deterministic tie apportionment: hand boundary `target - global_lt` tied
/// elements to units in ascending unit order.
fn apportion(lt: &[usize], ties: &[usize], want: usize) -> Vec<usize> {
    let mut sep = Vec::with_capacity(lt.len());
    let mut remaining = want;
    for (l, t) in lt.iter().zip(ties.iter()) {
        let take = (*t).min(remaining);
        remaining -= take;
        sep.push(l + take);
    }
    debug_assert_eq!(remaining, 0, "tie apportionment fell short");
    sep
}

const MAX_ROUNDS: usize = 200;

/// Collective splitter selection over `team_id`. Every member contributes
/// its locally sorted keys and computes the identical plan: the bisection
/// state evolves only through allreduced histograms.
pub(crate) fn select_splitters<K: SortKey>(
    rt: &Runtime,
    team_id: u32,
    sorted_keys: &[K],
    pattern: &BlockPattern,
) -> Result<SplitterPlan> {
    let p = pattern.num_units();
    let counts = pattern.counts().to_vec();
    let total = pattern.total();
    let me_keys = sorted_keys;

    if p == 1 || total == 0 {
        return Ok(SplitterPlan {
            sep: vec![vec![0; p.saturating_sub(1)]; p],
            counts,
        });
    }

    // global key range, ignoring empty units
    let my_min = me_keys.first().copied().unwrap_or_default();
    let my_max = me_keys.last().copied().unwrap_or_default();
    let mut mins = vec![K::default(); p];
    let mut maxs = vec![K::default(); p];
    rt.allgather(team_id, &[my_min], &mut mins)?;
    rt.allgather(team_id, &[my_max], &mut maxs)?;
    let mut lo = None;
    let mut hi = None;
    for u in 0..p {
        if counts[u] == 0 {
            continue;
        }
        lo = Some(lo.map_or(mins[u], |l: K| l.min(mins[u])));
        hi = Some(hi.map_or(maxs[u], |h: K| h.max(maxs[u])));
    }
    let lo = lo.ok_or_else(|| Error::Invalid("no unit holds data".into()))?;
    let hi = hi.ok_or_else(|| Error::Invalid("no unit holds data".into()))?;

    // deduplicated non-trivial boundary targets
    let prefix = pattern.prefix();
    let mut targets: Vec<usize> = Vec::new();
    for i in 0..p - 1 {
        let b = prefix[i + 1];
        if b != 0 && b != total && !targets.contains(&b) {
            targets.push(b);
        }
    }

    let mut states: Vec<BoundaryState<K>> = targets
        .iter()
        .map(|&b| BoundaryState::new(b, lo, hi))
        .collect();

    let mut rounds = 0;
    while states.iter().any(|s| !s.resolved) {
        if rounds > MAX_ROUNDS {
            return Err(Error::Invalid(
                "splitter search failed to converge".into(),
            ));
        }
        rounds += 1;
        let mut hist = vec![0usize; states.len() * 2];
        for (i, s) in states.iter().enumerate() {
            let (lt, le) = local_lt_le(me_keys, s.probe);
            hist[i * 2] = lt;
            hist[i * 2 + 1] = le;
        }
        let mut global = vec![0usize; hist.len()];
        rt.allreduce(team_id, ReduceOp::Sum, &hist, &mut global)?;
        for (i, s) in states.iter_mut().enumerate() {
            s.advance(global[i * 2], global[i * 2 + 1]);
        }
    }
    trace!(rounds, boundaries = states.len(), "splitters resolved");

    // gather per-unit strictly-below and tie counts at the resolved values
    let mut local_counts = vec![0usize; states.len() * 2];
    for (i, s) in states.iter().enumerate() {
        let (lt, le) = local_lt_le(me_keys, s.probe);
        local_counts[i * 2] = lt;
        local_counts[i * 2 + 1] = le - lt;
    }
    let mut gathered = vec![0usize; local_counts.len() * p];
    rt.allgather(team_id, &local_counts, &mut gathered)?;

    let stride = states.len() * 2;
    let mut sep = vec![vec![0usize; p - 1]; p];
    for i in 0..p - 1 {
        let b = prefix[i + 1];
        if b == 0 {
            continue;
        }
        if b == total {
            for u in 0..p {
                sep[u][i] = counts[u];
            }
            continue;
        }
        let k = targets
            .iter()
            .position(|&t| t == b)
            .ok_or_else(|| Error::Invalid(format!("unsolved partition boundary {}", b)))?;
        let lt: Vec<usize> = (0..p).map(|u| gathered[u * stride + k * 2]).collect();
        let ties: Vec<usize> = (0..p).map(|u| gathered[u * stride + k * 2 + 1]).collect();
        let want = b - states[k].global_lt;
        let per_unit = apportion(&lt, &ties, want);
        for u in 0..p {
            sep[u][i] = per_unit[u];
        }
    }

    Ok(SplitterPlan { sep, counts })
}

/// Sequential reference of the same selection, computed from a global view.
/// The distributed path must agree with this on identical input.
#[cfg(test)]
pub(crate) fn compute_plan<K: SortKey>(keys_per_unit: &[Vec<K>]) -> SplitterPlan {
    let p = keys_per_unit.len();
    let counts: Vec<usize> = keys_per_unit.iter().map(|k| k.len()).collect();
    let pattern = BlockPattern::new(counts.clone());
    let total = pattern.total();
    if p == 1 || total == 0 {
        return SplitterPlan {
            sep: vec![vec![0; p.saturating_sub(1)]; p],
            counts,
        };
    }
    let lo = keys_per_unit
        .iter()
        .filter_map(|k| k.first())
        .min()
        .copied()
        .unwrap();
    let hi = keys_per_unit
        .iter()
        .filter_map(|k| k.last())
        .max()
        .copied()
        .unwrap();

    let prefix = pattern.prefix().to_vec();
    let mut sep = vec![vec![0usize; p - 1]; p];
    for i in 0..p - 1 {
        let b = prefix[i + 1];
        if b == 0 {
            continue;
        }
        if b == total {
            for u in 0..p {
                sep[u][i] = counts[u];
            }
            continue;
        }
        let mut state = BoundaryState::new(b, lo, hi);
        let mut rounds = 0;
        while !state.resolved {
            assert!(rounds <= MAX_ROUNDS, "reference search diverged");
            rounds += 1;
            let mut glt = 0;
            let mut gle = 0;
            for keys in keys_per_unit {
                let (lt, le) = local_lt_le(keys, state.probe);
                glt += lt;
                gle += le;
            }
            state.advance(glt, gle);
        }
        let lt: Vec<usize> = keys_per_unit
            .iter()
            .map(|k| local_lt_le(k, state.probe).0)
            .collect();
        let ties: Vec<usize> = keys_per_unit
            .iter()
            .map(|k| {
                let (lt, le) = local_lt_le(k, state.probe);
                le - lt
            })
            .collect();
        let per_unit = apportion(&lt, &ties, b - state.global_lt);
        for u in 0..p {
            sep[u][i] = per_unit[u];
        }
    }
    SplitterPlan { sep, counts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    #[test]
    fn globally_sorted_input_stays_put() {
        // two units already holding their final data
        let plan = compute_plan(&[vec![1i64, 2, 3], vec![4, 5, 6]]);
        assert_eq!(plan.target_counts(0), vec![3, 0]);
        assert_eq!(plan.target_counts(1), vec![0, 3]);
    }

    #[test]
    fn globally_reversed_input_swaps() {
        let plan = compute_plan(&[vec![4i64, 5, 6], vec![1, 2, 3]]);
        assert_eq!(plan.target_counts(0), vec![0, 3]);
        assert_eq!(plan.target_counts(1), vec![3, 0]);
        // unit 0 pulls unit 1's whole slice from its start
        assert_eq!(plan.send_info(0, 1), (3, 0, 0));
        assert_eq!(plan.send_info(1, 0), (3, 0, 0));
    }

    #[test]
    fn duplicate_keys_apportion_exactly() {
        let plan = compute_plan(&[vec![5i64; 4], vec![5; 4], vec![5; 4]]);
        for me in 0..3 {
            let total: usize = plan.target_counts(me).iter().sum();
            assert_eq!(total, 4);
        }
    }

    #[test]
    fn empty_units_participate() {
        let plan = compute_plan(&[vec![], vec![3i64, 1, 9].sorted(), vec![]]);
        assert_eq!(plan.target_counts(0), vec![0, 0, 0]);
        let total: usize = plan.target_counts(1).iter().sum();
        assert_eq!(total, 3);
        assert_eq!(plan.target_counts(2), vec![0, 0, 0]);
    }

    #[test]
    fn borders_are_monotone_and_exact() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let p = rng.gen_range(2..6);
            let keys_per_unit: Vec<Vec<i64>> = (0..p)
                .map(|_| {
                    let n = rng.gen_range(0..40);
                    let mut v: Vec<i64> = (0..n).map(|_| rng.gen_range(-50..50)).collect();
                    v.sort_unstable();
                    v
                })
                .collect();
            let plan = compute_plan(&keys_per_unit);
            for u in 0..p {
                for r in 0..p {
                    assert!(plan.border(u, r) <= plan.border(u, r + 1));
                }
            }
            // each unit's final slice matches its capacity exactly
            for me in 0..p {
                let total: usize = plan.target_counts(me).iter().sum();
                assert_eq!(total, keys_per_unit[me].len());
            }
            // partition boundaries respect the global order
            let mut all: Vec<i64> = keys_per_unit.iter().flatten().copied().collect();
            all.sort_unstable();
            let pattern = BlockPattern::new(plan.counts.clone());
            for me in 0..p {
                let start = pattern.prefix()[me];
                for u in 0..p {
                    let (count, src, _) = plan.send_info(me, u);
                    for j in 0..count {
                        let k = keys_per_unit[u][src + j];
                        // every pulled key belongs to my global slice's key range
                        let slice = &all[start..start + keys_per_unit[me].len()];
                        assert!(k >= slice[0] && k <= slice[slice.len() - 1]);
                    }
                }
            }
        }
    }

    trait Sorted {
        fn sorted(self) -> Self;
    }
    impl Sorted for Vec<i64> {
        fn sorted(mut self) -> Self {
            self.sort_unstable();
            self
        }
    }
}
