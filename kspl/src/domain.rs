// SPDX-License-Identifier: MPL-2.0

//! The interrupt domain: the per-CPU priority state, the handler registry
//! and the inter-processor mailboxes of one machine, composed over an
//! [`IplHal`].

use alloc::collections::VecDeque;
use core::{
    array,
    sync::atomic::{AtomicU64, AtomicU8, Ordering},
};

use bit_field::BitField;
use spin::{Mutex as SpinLock, Once};

use crate::{
    cpu::{CpuId, PerCpuCounter},
    hal::IplHal,
    ipl::{Ipl, IplTable, NR_IPLS},
    irq::{Vector, NR_VECTORS},
    prelude::*,
    smp::{IpiMailbox, NR_IPI_KINDS},
};

pub(crate) type BottomHalfHandler = Box<dyn Fn(CpuId) + Send + Sync>;
pub(crate) type IpiHandler = Box<dyn Fn(CpuId) + Send + Sync>;
pub(crate) type XcallItem = Box<dyn FnOnce() + Send>;

const IPENDING_WORDS: usize = NR_VECTORS / 64;

/// Per-CPU priority state.
///
/// Owned by its CPU: only the owning CPU moves the level or takes pending
/// bits. The fields are atomics because handlers running on the same CPU
/// re-enter the arbiter, not because other CPUs write them.
pub(crate) struct CpuIplState {
    level: AtomicU8,
    ipending: [AtomicU64; IPENDING_WORDS],
}

impl CpuIplState {
    fn new() -> Self {
        Self {
            level: AtomicU8::new(Ipl::None.as_u8()),
            ipending: array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub(crate) fn level(&self) -> Ipl {
        // Only valid level indices are ever stored.
        Ipl::from_raw(self.level.load(Ordering::Relaxed)).unwrap()
    }

    pub(crate) fn set_level(&self, ipl: Ipl) {
        self.level.store(ipl.as_u8(), Ordering::Relaxed);
    }

    /// Records `vector` as fired-while-masked, to be replayed by the next
    /// lowering transition that unmasks it.
    pub(crate) fn set_pending(&self, vector: u8) {
        let (word, bit) = (vector as usize / 64, vector as usize % 64);
        self.ipending[word].fetch_or(1 << bit, Ordering::Release);
    }

    /// Clears `vector`'s pending bit, returning whether it was set.
    pub(crate) fn clear_pending(&self, vector: u8) -> bool {
        let (word, bit) = (vector as usize / 64, vector as usize % 64);
        let old = self.ipending[word].fetch_and(!(1 << bit), Ordering::AcqRel);
        old.get_bit(bit)
    }

    /// Iterates a snapshot of the vectors currently marked pending.
    pub(crate) fn pending_vectors(&self) -> impl Iterator<Item = u8> + '_ {
        (0..IPENDING_WORDS).flat_map(move |word| {
            let snapshot = self.ipending[word].load(Ordering::Acquire);
            (0..64).filter_map(move |bit| {
                if snapshot.get_bit(bit) {
                    Some((word * 64 + bit) as u8)
                } else {
                    None
                }
            })
        })
    }
}

/// The interrupt core of one machine.
///
/// An `IntrDomain` owns everything the ports used to duplicate: one
/// [`CpuIplState`] per CPU, the per-vector handler registry, the
/// inter-processor mailboxes and the level-to-mask table, all driven
/// through the injected [`IplHal`].
///
/// The arbiter operations ([`splraise`], [`splx`], [`spllower`]) act on the
/// CPU the caller executes on, as reported by the HAL.
///
/// [`splraise`]: Self::splraise
/// [`splx`]: Self::splx
/// [`spllower`]: Self::spllower
pub struct IntrDomain {
    pub(crate) hal: Arc<dyn IplHal>,
    pub(crate) table: IplTable,
    pub(crate) cpus: Box<[CpuIplState]>,
    pub(crate) vectors: Box<[Vector]>,
    pub(crate) mailboxes: Box<[IpiMailbox]>,
    pub(crate) ipi_handlers: [Once<IpiHandler>; NR_IPI_KINDS],
    pub(crate) xcall_queues: Box<[SpinLock<VecDeque<XcallItem>>]>,
    pub(crate) bottom_half: Once<BottomHalfHandler>,
    pub(crate) ipl_counts: [PerCpuCounter; NR_IPLS],
    pub(crate) spurious_doorbells: PerCpuCounter,
}

impl IntrDomain {
    /// Creates the domain over `hal` with the given level-to-mask table.
    ///
    /// All CPUs start at [`Ipl::None`] with empty pending state; the HAL's
    /// mask is initialized accordingly.
    pub fn new(hal: Arc<dyn IplHal>, table: IplTable) -> Arc<Self> {
        let num_cpus = hal.num_cpus();
        assert!(num_cpus > 0, "the HAL must drive at least one CPU");

        let domain = Arc::new(Self {
            cpus: (0..num_cpus)
                .map(|_| CpuIplState::new())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            vectors: (0..NR_VECTORS)
                .map(|_| Vector::new())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            mailboxes: (0..num_cpus)
                .map(|_| IpiMailbox::new())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            ipi_handlers: array::from_fn(|_| Once::new()),
            xcall_queues: (0..num_cpus)
                .map(|_| SpinLock::new(VecDeque::new()))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            bottom_half: Once::new(),
            ipl_counts: array::from_fn(|_| PerCpuCounter::new(num_cpus)),
            spurious_doorbells: PerCpuCounter::new(num_cpus),
            table,
            hal,
        });

        for cpu in domain.all_cpus() {
            domain
                .hal
                .set_mask(cpu, domain.table.mask_of(Ipl::None));
        }
        domain
    }

    /// Returns the number of CPUs in the domain.
    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Returns the CPU the caller executes on.
    pub fn current_cpu(&self) -> CpuId {
        self.hal.current_cpu()
    }

    /// Returns the IPL currently in effect on the calling CPU.
    pub fn current_ipl(&self) -> Ipl {
        self.cpu_state(self.current_cpu()).level()
    }

    /// Iterates all CPU IDs of the domain, in ascending order.
    pub fn all_cpus(&self) -> impl Iterator<Item = CpuId> + '_ {
        (0..self.num_cpus()).map(|id| CpuId::new(id as u32))
    }

    /// Registers the bottom-half handler.
    ///
    /// The handler is invoked on every lowering transition, after deferred
    /// hardware vectors have been replayed; it must only run work at
    /// levels strictly above the calling CPU's current level. The in-tree
    /// software-interrupt dispatcher registers itself here.
    ///
    /// # Panics
    ///
    /// The bottom-half handler can be registered only once.
    pub fn register_bottom_half_handler(&self, handler: impl Fn(CpuId) + Send + Sync + 'static) {
        assert!(
            self.bottom_half.get().is_none(),
            "the bottom-half handler is already registered"
        );
        self.bottom_half.call_once(|| Box::new(handler));
    }

    /// Returns the count of dispatches that ran at `ipl`, summed over all
    /// CPUs.
    pub fn ipl_count(&self, ipl: Ipl) -> usize {
        self.ipl_counts[ipl.as_usize()].sum_all_cpus()
    }

    /// Returns the count of dispatches that ran at `ipl` on one CPU.
    pub fn ipl_count_on_cpu(&self, ipl: Ipl, cpu: CpuId) -> usize {
        self.ipl_counts[ipl.as_usize()].get_on_cpu(cpu)
    }

    pub(crate) fn cpu_state(&self, cpu: CpuId) -> &CpuIplState {
        &self.cpus[cpu.as_usize()]
    }
}
