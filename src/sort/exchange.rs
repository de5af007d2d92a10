use crate::error::Result;
use crate::globmem::GlobalPtr;
use crate::handle::RmaHandle;
use crate::runtime::Runtime;
use crate::sort::splitters::SplitterPlan;
use crate::transport::Remote;

use tracing::trace;

/// The ordered set of units this unit must pull non-empty data from,
/// excluding itself. Order matters: it dictates handle slots and chunk
/// dependency keys downstream.
pub(crate) fn remote_partitions(
    plan: &SplitterPlan,
    me: usize,
    unit_at_begin: usize,
) -> Vec<usize> {
    let target_counts = plan.target_counts(me);
    let mut remote = Vec::with_capacity(plan.num_units());
    if target_counts[unit_at_begin] > 0 && me != unit_at_begin {
        remote.push(unit_at_begin);
    }
    for s in plan.splitters() {
        let r = s + 1;
        if target_counts[r] > 0 && r != me && r != unit_at_begin {
            remote.push(r);
        }
    }
    remote
}

/// Issue one non-blocking get per remote partition, pulling `target_count`
/// elements from the source unit's sorted slice into the merge buffer at
/// `target_disp`. Handles are indexed by source unit; units outside
/// `remote` keep the null handle.
///
/// # Safety
/// `dst_base` must point to a buffer holding at least this unit's final
/// element count, and the per-partition destination ranges are disjoint by
/// construction of the plan.
pub(crate) unsafe fn exchange_data<T: Remote>(
    rt: &Runtime,
    team_id: u32,
    seg_gptr: GlobalPtr,
    plan: &SplitterPlan,
    remote: &[usize],
    me: usize,
    dst_base: *mut T,
) -> Result<Vec<RmaHandle>> {
    let mut handles: Vec<RmaHandle> = (0..plan.num_units()).map(|_| RmaHandle::null()).collect();

    for &unit in remote {
        let (target_count, src_disp, target_disp) = plan.send_info(me, unit);
        if target_count == 0 {
            continue;
        }
        trace!(
            source = unit,
            target_count,
            src_disp,
            target_disp,
            "async partition copy"
        );
        let global_unit = rt.team_unit_l2g(team_id, unit)?;
        let mut src = seg_gptr;
        src.setunit(global_unit as u32);
        src.offset = (src_disp * std::mem::size_of::<T>()) as u64;
        let dst = std::slice::from_raw_parts_mut(dst_base.add(target_disp), target_count);
        handles[unit] = rt.get_handle(src, dst)?;
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sort::splitters::compute_plan;

    #[test]
    fn remote_set_preserves_order_and_skips_self() {
        let plan = compute_plan(&[vec![4i64, 5, 6], vec![1, 2, 3]]);
        assert_eq!(remote_partitions(&plan, 0, 0), vec![1]);
        assert_eq!(remote_partitions(&plan, 1, 0), vec![0]);
    }

    #[test]
    fn sorted_input_needs_no_exchange() {
        let plan = compute_plan(&[vec![1i64, 2, 3], vec![4, 5, 6]]);
        assert!(remote_partitions(&plan, 0, 0).is_empty());
        assert!(remote_partitions(&plan, 1, 0).is_empty());
    }

    #[test]
    fn begin_unit_is_not_duplicated() {
        // unit 0 empty, the range begins on unit 1
        let plan = compute_plan(&[vec![], vec![2i64, 4, 6], vec![1, 3, 5]]);
        let remote = remote_partitions(&plan, 2, 1);
        let dups = remote.iter().filter(|&&u| u == 1).count();
        assert!(dups <= 1);
        assert!(!remote.contains(&2));
    }
}
