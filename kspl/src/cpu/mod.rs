// SPDX-License-Identifier: MPL-2.0

//! CPU-related definitions.

pub mod set;

pub use set::CpuSet;

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::prelude::*;

/// The ID of a CPU in the system.
///
/// If converting from/to an integer, the integer must start from 0 and be
/// less than the number of CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuId(u32);

impl CpuId {
    /// Returns the CPU ID of the bootstrap processor (BSP).
    pub const fn bsp() -> Self {
        CpuId(0)
    }

    /// Creates a CPU ID from a raw index.
    ///
    /// The index must be less than the number of CPUs of the domain the ID
    /// is used with; out-of-range IDs are rejected by the consuming APIs.
    pub const fn new(id: u32) -> Self {
        CpuId(id)
    }

    /// Converts the CPU ID to an `usize`.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A per-CPU event counter.
///
/// Updates touch only the calling CPU's slot, so counting on the hot path
/// never contends across CPUs. Reading sums all slots and is allowed to be
/// inaccurate under concurrent updates; the counters feed the diagnostic
/// surface, not the correctness contract.
pub struct PerCpuCounter {
    slots: Box<[AtomicUsize]>,
}

impl PerCpuCounter {
    /// Creates a zero-valued counter with one slot per CPU.
    pub fn new(num_cpus: usize) -> Self {
        let slots = (0..num_cpus)
            .map(|_| AtomicUsize::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    /// Adds `increment` to the counter on the given CPU.
    pub fn add_on_cpu(&self, on_cpu: CpuId, increment: usize) {
        self.slots[on_cpu.as_usize()].fetch_add(increment, Ordering::Relaxed);
    }

    /// Gets the counter value on a specific CPU.
    pub fn get_on_cpu(&self, on_cpu: CpuId) -> usize {
        self.slots[on_cpu.as_usize()].load(Ordering::Relaxed)
    }

    /// Gets the total counter value across all CPUs.
    pub fn sum_all_cpus(&self) -> usize {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn per_cpu_counter_sums_slots() {
        let counter = PerCpuCounter::new(4);
        counter.add_on_cpu(CpuId::new(0), 1);
        counter.add_on_cpu(CpuId::new(2), 2);
        counter.add_on_cpu(CpuId::new(2), 3);
        assert_eq!(counter.get_on_cpu(CpuId::new(0)), 1);
        assert_eq!(counter.get_on_cpu(CpuId::new(1)), 0);
        assert_eq!(counter.get_on_cpu(CpuId::new(2)), 5);
        assert_eq!(counter.sum_all_cpus(), 6);
    }
}
