//! CPU placement and radio ownership for worker threads.
//!
//! Workers are pinned to consecutive cores starting at a configured offset
//! (`core_offset + tid`; the sender reserves `core_offset` for its master and
//! starts workers one core later). Radios are split into contiguous blocks,
//! one block per worker:
//!
//! ```text
//! worker t owns radios [t·R/T, (t+1)·R/T)
//! ```
//!
//! Uses `num_cpus` for core counts and `core_affinity` for pinning.

use std::ops::Range;

use core_affinity::CoreId;

use crate::trace::{debug, warn};

/// CPU topology information detected at runtime.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    /// Total logical cores (including SMT/hyperthreads).
    pub logical_cores: usize,
    /// Total physical cores.
    pub physical_cores: usize,
    /// Available core IDs for pinning.
    pub available_cores: Vec<usize>,
}

impl CpuTopology {
    /// Detects the CPU topology of the current system.
    #[must_use]
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get();
        let physical_cores = num_cpus::get_physical();
        let available_cores = core_affinity::get_core_ids()
            .map(|ids| ids.into_iter().map(|id| id.id).collect())
            .unwrap_or_else(|| (0..logical_cores).collect());

        Self { logical_cores, physical_cores, available_cores }
    }

    /// Whether cores `first..first + count` can all be pinned to.
    #[must_use]
    pub fn has_cores(&self, first: usize, count: usize) -> bool {
        (first..first + count).all(|core| self.available_cores.contains(&core))
    }

    /// Logs a warning if a pinning plan reaches past the available cores.
    /// Workers on missing cores still run, unpinned.
    pub fn check_plan(&self, first: usize, count: usize) {
        if !self.has_cores(first, count) {
            warn!(
                first,
                count,
                logical = self.logical_cores,
                physical = self.physical_cores,
                "pinning plan exceeds available cores"
            );
        }
    }
}

/// Pins the current thread to the specified core.
///
/// Returns `true` if pinning succeeded, `false` otherwise.
/// Pinning may fail if the core ID is invalid or the OS denies the request.
pub fn pin_to_core(core_id: usize) -> bool {
    let core = CoreId { id: core_id };
    core_affinity::set_for_current(core)
}

/// Pins the calling worker to `core_offset + index`, if an offset is set.
/// A failed pin is logged and the worker carries on unpinned.
pub fn pin_worker(core_offset: Option<usize>, index: usize) {
    let Some(offset) = core_offset else {
        return;
    };
    let core = offset + index;
    if pin_to_core(core) {
        debug!(core, "pinned");
    } else {
        warn!(core, "failed to pin thread, running unpinned");
    }
}

/// Items owned by part `index` when `total` items are split into `parts`
/// contiguous blocks.
///
/// Blocks differ in size by at most one and together cover `0..total`
/// exactly once.
#[must_use]
pub const fn partition(total: usize, parts: usize, index: usize) -> Range<usize> {
    (index * total / parts)..((index + 1) * total / parts)
}

/// Part that owns `item` under [`partition`]. Requires `parts <= total`.
#[must_use]
pub const fn owner_of(total: usize, parts: usize, item: usize) -> usize {
    ((item + 1) * parts - 1) / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn topology_detection_returns_valid_counts() {
        let topo = CpuTopology::detect();

        assert!(topo.logical_cores > 0, "should have at least 1 logical core");
        assert!(topo.physical_cores > 0, "should have at least 1 physical core");
        assert!(!topo.available_cores.is_empty(), "should have available cores");
    }

    #[test]
    fn plan_past_last_core_does_not_fit() {
        let topo = CpuTopology::detect();
        assert!(!topo.has_cores(usize::MAX / 2, 1));
        assert!(topo.has_cores(0, 0));
    }

    #[test]
    fn partition_of_eight_radios() {
        let ranges: Vec<_> = (0..2).map(|t| partition(8, 2, t)).collect();
        assert_eq!(ranges, vec![0..4, 4..8]);
        let ranges: Vec<_> = (0..3).map(|t| partition(8, 3, t)).collect();
        assert_eq!(ranges, vec![0..2, 2..5, 5..8]);
    }

    proptest! {
        #[test]
        fn partition_covers_every_item_once(
            (total, parts) in (1usize..512).prop_flat_map(|t| (Just(t), 1..=t))
        ) {
            let mut next = 0;
            for index in 0..parts {
                let range = partition(total, parts, index);
                prop_assert_eq!(range.start, next);
                prop_assert!(!range.is_empty());
                for item in range.clone() {
                    prop_assert_eq!(owner_of(total, parts, item), index);
                }
                next = range.end;
            }
            prop_assert_eq!(next, total);
        }
    }
}
