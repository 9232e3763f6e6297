// SPDX-License-Identifier: MPL-2.0

//! A paravirtual port model: event channels behind a shared mask flag.
//!
//! On a Xen-style port the interrupt "controller" is the hypervisor, the
//! mask register is a flag in memory shared with it, and masked events do
//! not re-fire on their own: the hypervisor checked the flag once, marked
//! the event pending and moved on. Such a port therefore must implement
//! [`IplHal::pop_pending`], and the arbiter's lowering path polls it so
//! that no event is stranded behind a mask transition the hypervisor never
//! re-examines.
//!
//! [`XenHal`] is a software rendition of that contract. It backs the
//! in-tree upcall tests and doubles as the reference for real paravirtual
//! ports: [`XenHal::inject`] plays the hypervisor's side of delivery, and
//! [`IntrDomain::upcall`] is the guest's upcall entry point.

use core::{
    array,
    sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering},
};

use bit_field::BitField;

use crate::{
    cpu::CpuId,
    domain::IntrDomain,
    hal::{HwMask, IplHal},
    ipl::Ipl,
    irq::NR_VECTORS,
    prelude::*,
};

/// The event channel carrying inter-processor doorbells.
pub const DOORBELL_VECTOR: u8 = 0;

const PENDING_WORDS: usize = NR_VECTORS / 64;

/// Per-vCPU shared-info state, as the hypervisor side sees it.
struct VcpuInfo {
    // The all-or-nothing upcall gate; events still become pending while
    // it is set, they just raise no upcall.
    upcall_mask: AtomicBool,
    mask_word: AtomicU16,
    pending: [AtomicU64; PENDING_WORDS],
}

impl VcpuInfo {
    fn new() -> Self {
        Self {
            upcall_mask: AtomicBool::new(false),
            mask_word: AtomicU16::new(0),
            pending: array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

/// The software event-channel board.
///
/// Holds one pending bitset and upcall mask per vCPU plus the global
/// per-channel enable bits. The guest side is wired up by handing an
/// `Arc<XenHal>` to [`IntrDomain::new`]; the hypervisor side is driven
/// with [`inject`].
///
/// [`inject`]: Self::inject
pub struct XenHal {
    vcpus: Box<[VcpuInfo]>,
    enabled: [AtomicU64; PENDING_WORDS],
    current: AtomicU32,
}

impl XenHal {
    /// Creates the board with `num_vcpus` virtual CPUs, executing as vCPU
    /// 0.
    pub fn new(num_vcpus: usize) -> Arc<Self> {
        assert!(num_vcpus > 0);
        Arc::new(Self {
            vcpus: (0..num_vcpus)
                .map(|_| VcpuInfo::new())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            enabled: array::from_fn(|_| AtomicU64::new(0)),
            current: AtomicU32::new(0),
        })
    }

    /// Makes subsequent guest-side calls execute as `vcpu`.
    pub fn switch_to(&self, vcpu: CpuId) {
        assert!(vcpu.as_usize() < self.vcpus.len());
        self.current.store(vcpu.as_usize() as u32, Ordering::SeqCst);
    }

    /// Delivers event `vector` to `vcpu`, the hypervisor's half of the
    /// protocol.
    ///
    /// A disabled channel drops the event and returns `false`. Otherwise
    /// the event is marked pending and the return value says whether an
    /// upcall is raised for it now: `false` means the vCPU's upcall mask
    /// was set, and the event waits in the shared bitset until a lowering
    /// transition polls it back out.
    pub fn inject(&self, vcpu: CpuId, vector: u8) -> bool {
        let (word, bit) = (vector as usize / 64, vector as usize % 64);
        if !self.enabled[word].load(Ordering::SeqCst).get_bit(bit) {
            return false;
        }
        let info = &self.vcpus[vcpu.as_usize()];
        info.pending[word].fetch_or(1 << bit, Ordering::SeqCst);
        !info.upcall_mask.load(Ordering::SeqCst)
    }

    /// Returns whether `vcpu`'s upcall mask is currently set.
    pub fn upcall_masked(&self, vcpu: CpuId) -> bool {
        self.vcpus[vcpu.as_usize()].upcall_mask.load(Ordering::SeqCst)
    }
}

impl IplHal for XenHal {
    fn current_cpu(&self) -> CpuId {
        CpuId::new(self.current.load(Ordering::SeqCst))
    }

    fn num_cpus(&self) -> usize {
        self.vcpus.len()
    }

    fn set_mask(&self, cpu: CpuId, mask: HwMask) {
        let info = &self.vcpus[cpu.as_usize()];
        info.mask_word.store(mask.bits(), Ordering::SeqCst);
        // The port has no per-level gate, only the all-or-nothing upcall
        // flag; anything short of masking everything leaves upcalls on
        // and lets the arbiter sort deliveries by level.
        info.upcall_mask
            .store(mask.covers(Ipl::High), Ordering::SeqCst);
    }

    fn doorbell(&self, cpu: CpuId) {
        self.inject(cpu, DOORBELL_VECTOR);
    }

    fn enable_source(&self, vector: u8) {
        let (word, bit) = (vector as usize / 64, vector as usize % 64);
        self.enabled[word].fetch_or(1 << bit, Ordering::SeqCst);
    }

    fn disable_source(&self, vector: u8) {
        let (word, bit) = (vector as usize / 64, vector as usize % 64);
        self.enabled[word].fetch_and(!(1 << bit), Ordering::SeqCst);
    }

    fn pop_pending(&self, cpu: CpuId) -> Option<u8> {
        let info = &self.vcpus[cpu.as_usize()];
        for word in 0..PENDING_WORDS {
            loop {
                let snapshot = info.pending[word].load(Ordering::SeqCst);
                if snapshot == 0 {
                    break;
                }
                let bit = snapshot.trailing_zeros() as usize;
                let cleared = info.pending[word]
                    .fetch_and(!(1 << bit), Ordering::SeqCst);
                if cleared.get_bit(bit) {
                    return Some((word * 64 + bit) as u8);
                }
            }
        }
        None
    }
}

impl IntrDomain {
    /// The upcall entry point of a paravirtual port.
    ///
    /// Called by the port's upcall trampoline when the hypervisor raises
    /// an upcall on the calling vCPU: drains the pending events the HAL
    /// reports, delivering or pending each one by level, then lowers
    /// through the ordinary drain path.
    pub fn upcall(&self) {
        let cpu = self.current_cpu();
        while let Some(vector) = self.hal.pop_pending(cpu) {
            self.deliver(cpu, vector);
        }
        self.run_pending(cpu);
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::{
        ipl::IplTable,
        irq::SharePolicy,
        smp::{IpiKind, IpiTarget},
    };

    fn xen_domain(num_vcpus: usize) -> (Arc<IntrDomain>, Arc<XenHal>) {
        let hal = XenHal::new(num_vcpus);
        let domain = IntrDomain::new(hal.clone(), IplTable::linear());
        (domain, hal)
    }

    #[test]
    fn masked_event_is_replayed_when_the_mask_drops() {
        let (domain, hal) = xen_domain(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _handle = domain
            .intr_establish(5, Ipl::Vm, SharePolicy::Shared, move || {
                h.fetch_add(1, Ordering::SeqCst);
                true
            })
            .unwrap();

        let saved = domain.splhigh();
        assert!(hal.upcall_masked(CpuId::bsp()));

        // The hypervisor marks the event pending but raises no upcall.
        assert!(!hal.inject(CpuId::bsp(), 5));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // Lowering must poll the shared bitset; nobody else will.
        domain.splx(saved);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unmasked_event_runs_through_the_upcall() {
        let (domain, hal) = xen_domain(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _handle = domain
            .intr_establish(7, Ipl::SoftNet, SharePolicy::Shared, move || {
                h.fetch_add(1, Ordering::SeqCst);
                true
            })
            .unwrap();

        assert!(hal.inject(CpuId::bsp(), 7));
        domain.upcall();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(domain.current_ipl(), Ipl::None);
    }

    #[test]
    fn partially_masked_event_pends_by_level() {
        let (domain, hal) = xen_domain(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _handle = domain
            .intr_establish(6, Ipl::Vm, SharePolicy::Shared, move || {
                h.fetch_add(1, Ordering::SeqCst);
                true
            })
            .unwrap();

        // Sched leaves the upcall gate open; the level check is the
        // arbiter's job.
        let saved = domain.splsched();
        assert!(!hal.upcall_masked(CpuId::bsp()));
        assert!(hal.inject(CpuId::bsp(), 6));
        domain.upcall();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        domain.splx(saved);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disabled_channel_drops_the_event() {
        let (domain, hal) = xen_domain(1);
        // No handler established, so channel 9 was never enabled.
        assert!(!hal.inject(CpuId::bsp(), 9));
        domain.upcall();
        assert_eq!(domain.spurious_count(9), 0);
    }

    #[test]
    fn ipi_rides_the_doorbell_channel() {
        let (domain, hal) = xen_domain(2);
        let halts = Arc::new(AtomicUsize::new(0));
        let h = halts.clone();
        domain.ipi_register(IpiKind::Halt, move |_cpu| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let d = domain.clone();
        let _doorbell = domain
            .intr_establish(DOORBELL_VECTOR, Ipl::High, SharePolicy::Exclusive, move || {
                d.ipi_intr();
                true
            })
            .unwrap();

        hal.switch_to(CpuId::bsp());
        domain.ipi_send(IpiTarget::One(CpuId::new(1)), IpiKind::Halt);
        assert_eq!(halts.load(Ordering::SeqCst), 0);

        hal.switch_to(CpuId::new(1));
        domain.upcall();
        assert_eq!(halts.load(Ordering::SeqCst), 1);
    }
}
