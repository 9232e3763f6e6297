// SPDX-License-Identifier: MPL-2.0

//! A software board for unit tests.
//!
//! `TestHal` stands in for a machine: the "current CPU" is a thread-local
//! the test moves with [`TestHal::switch_to`], the hardware mask is a
//! per-CPU word the arbiter writes through [`IplHal::set_mask`], and
//! doorbells only count. Tests drive interrupts by calling
//! [`IntrDomain::handle_irq`] directly.

use std::{
    cell::Cell,
    sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering},
    thread_local,
};

use bit_field::BitField;

use crate::{
    cpu::CpuId,
    domain::IntrDomain,
    hal::{HwMask, IplHal},
    ipl::IplTable,
    irq::NR_VECTORS,
    prelude::*,
};

thread_local! {
    static CURRENT_CPU: Cell<u32> = const { Cell::new(0) };
}

pub(crate) struct TestHal {
    num_cpus: usize,
    masks: Box<[AtomicU16]>,
    doorbells: Box<[AtomicUsize]>,
    enabled: [AtomicU64; NR_VECTORS / 64],
}

impl TestHal {
    pub(crate) fn new(num_cpus: usize) -> Arc<Self> {
        Arc::new(Self {
            num_cpus,
            masks: (0..num_cpus)
                .map(|_| AtomicU16::new(0))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            doorbells: (0..num_cpus)
                .map(|_| AtomicUsize::new(0))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            enabled: core::array::from_fn(|_| AtomicU64::new(0)),
        })
    }

    /// Makes the calling thread execute as `cpu` from now on.
    pub(crate) fn switch_to(&self, cpu: u32) {
        assert!((cpu as usize) < self.num_cpus);
        CURRENT_CPU.with(|current| current.set(cpu));
    }

    /// Returns how many times `cpu`'s doorbell has been rung.
    pub(crate) fn doorbell_count(&self, cpu: usize) -> usize {
        self.doorbells[cpu].load(Ordering::SeqCst)
    }

    /// Returns whether the source behind `vector` is unmasked at the
    /// controller.
    pub(crate) fn source_enabled(&self, vector: u8) -> bool {
        let (word, bit) = (vector as usize / 64, vector as usize % 64);
        self.enabled[word].load(Ordering::SeqCst).get_bit(bit)
    }

    /// Returns the mask word last written for `cpu`.
    pub(crate) fn mask_of(&self, cpu: usize) -> HwMask {
        HwMask::from_bits(self.masks[cpu].load(Ordering::SeqCst))
    }
}

impl IplHal for TestHal {
    fn current_cpu(&self) -> CpuId {
        CURRENT_CPU.with(|current| CpuId::new(current.get()))
    }

    fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    fn set_mask(&self, cpu: CpuId, mask: HwMask) {
        self.masks[cpu.as_usize()].store(mask.bits(), Ordering::SeqCst);
    }

    fn doorbell(&self, cpu: CpuId) {
        self.doorbells[cpu.as_usize()].fetch_add(1, Ordering::SeqCst);
    }

    fn enable_source(&self, vector: u8) {
        let (word, bit) = (vector as usize / 64, vector as usize % 64);
        self.enabled[word].fetch_or(1 << bit, Ordering::SeqCst);
    }

    fn disable_source(&self, vector: u8) {
        let (word, bit) = (vector as usize / 64, vector as usize % 64);
        self.enabled[word].fetch_and(!(1 << bit), Ordering::SeqCst);
    }
}

pub(crate) fn domain_with_cpus(num_cpus: usize) -> (Arc<IntrDomain>, Arc<TestHal>) {
    let hal = TestHal::new(num_cpus);
    let domain = IntrDomain::new(hal.clone(), IplTable::linear());
    (domain, hal)
}

pub(crate) fn single_cpu_domain() -> (Arc<IntrDomain>, Arc<TestHal>) {
    domain_with_cpus(1)
}
