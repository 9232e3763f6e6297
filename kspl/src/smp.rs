// SPDX-License-Identifier: MPL-2.0

//! The inter-processor notification channel.
//!
//! Each CPU owns a mailbox: an atomic bitset of pending message kinds with
//! a fixed kind-to-handler table, so posting and delivering never
//! allocate. A sender sets the kind's bit and rings the target's doorbell
//! through the HAL; the receiving CPU services the doorbell with
//! [`IntrDomain::ipi_intr`] at `splhigh`. Delivery is at-least-once and
//! coalesced per kind; two different kinds sent to the same target are not
//! ordered with respect to each other.
//!
//! The cross-call facility is layered on the [`IpiKind::Xcall`] message:
//! per-CPU queues of closures plus, for the synchronous flavor, an
//! acknowledgement countdown the caller spins on. The channel itself only
//! delivers.

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::{
    cpu::{CpuId, CpuSet},
    domain::{IntrDomain, XcallItem},
    prelude::*,
};

/// The number of inter-processor message kinds.
pub const NR_IPI_KINDS: usize = 3;

/// A kind of inter-processor message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiKind {
    /// Ask the target CPU to halt; used at shutdown.
    Halt = 0,
    /// Run queued cross-calls; reserved for the cross-call facility.
    Xcall = 1,
    /// Invalidate the target CPU's TLB.
    TlbFlush = 2,
}

impl IpiKind {
    /// All kinds, in bit order.
    pub const ALL: [IpiKind; NR_IPI_KINDS] = [IpiKind::Halt, IpiKind::Xcall, IpiKind::TlbFlush];

    fn as_set(self) -> IpiKindSet {
        IpiKindSet::from_bits_truncate(1 << self as u8)
    }
}

bitflags! {
    /// A set of [`IpiKind`]s, as held in a CPU mailbox.
    pub struct IpiKindSet: u8 {
        /// See [`IpiKind::Halt`].
        const HALT = 1 << 0;
        /// See [`IpiKind::Xcall`].
        const XCALL = 1 << 1;
        /// See [`IpiKind::TlbFlush`].
        const TLB_FLUSH = 1 << 2;
    }
}

/// Destination selector for [`IntrDomain::ipi_send`].
#[derive(Debug, Clone, Copy)]
pub enum IpiTarget {
    /// One specific CPU (which may be the sender itself).
    One(CpuId),
    /// Every CPU except the sender.
    AllButSelf,
    /// Every CPU, the sender included.
    All,
}

/// The per-CPU mailbox of pending cross-CPU requests.
///
/// The pending bitset is the one piece of per-CPU state other CPUs write;
/// all access is atomic bit-set and swap.
pub(crate) struct IpiMailbox {
    pending: AtomicU8,
}

impl IpiMailbox {
    pub(crate) fn new() -> Self {
        Self {
            pending: AtomicU8::new(0),
        }
    }
}

impl IntrDomain {
    /// Registers the handler invoked on the receiving CPU for `kind`.
    ///
    /// # Panics
    ///
    /// Each kind can be registered once, and [`IpiKind::Xcall`] is
    /// reserved for the cross-call facility.
    pub fn ipi_register(&self, kind: IpiKind, handler: impl Fn(CpuId) + Send + Sync + 'static) {
        assert!(
            kind != IpiKind::Xcall,
            "the cross-call kind is serviced internally"
        );
        let slot = &self.ipi_handlers[kind as usize];
        assert!(slot.get().is_none(), "{:?} is already registered", kind);
        slot.call_once(|| Box::new(handler));
    }

    /// Posts `kind` to the target mailbox(es) and rings each doorbell.
    ///
    /// Never blocks and never allocates. Posting the same kind again
    /// before the target services its doorbell coalesces into a single
    /// delivery.
    pub fn ipi_send(&self, target: IpiTarget, kind: IpiKind) {
        let me = self.current_cpu();
        for cpu in self.all_cpus() {
            let wanted = match target {
                IpiTarget::One(id) => cpu == id,
                IpiTarget::AllButSelf => cpu != me,
                IpiTarget::All => true,
            };
            if wanted {
                self.post(cpu, kind);
            }
        }
    }

    /// Posts `kind` to `cpu` and spins until the mailbox bit is observed
    /// clear, i.e. until the target has serviced the request.
    ///
    /// The wait has no timeout: it is bounded only by the remote CPU
    /// reaching its doorbell, which is acceptable for the shutdown-time
    /// requests ([`IpiKind::Halt`]) this is meant for and for nothing
    /// else.
    pub fn ipi_send_and_wait(&self, cpu: CpuId, kind: IpiKind) {
        self.post(cpu, kind);
        let mailbox = &self.mailboxes[cpu.as_usize()];
        while IpiKindSet::from_bits_truncate(mailbox.pending.load(Ordering::Acquire))
            .contains(kind.as_set())
        {
            core::hint::spin_loop();
        }
    }

    fn post(&self, cpu: CpuId, kind: IpiKind) {
        self.mailboxes[cpu.as_usize()]
            .pending
            .fetch_or(kind.as_set().bits(), Ordering::Release);
        self.hal.doorbell(cpu);
    }

    /// Services the calling CPU's doorbell.
    ///
    /// Dispatched like any other high-priority interrupt source: a port
    /// establishes its doorbell vector with a handler that calls this.
    /// Atomically takes the mailbox bitset and invokes the handler of
    /// every kind present; an empty take is a counted, silent no-op
    /// (spurious doorbell).
    pub fn ipi_intr(&self) {
        let cpu = self.current_cpu();
        let saved = self.splhigh();

        let taken =
            IpiKindSet::from_bits_truncate(self.mailboxes[cpu.as_usize()].pending.swap(0, Ordering::AcqRel));
        if taken.is_empty() {
            self.spurious_doorbells.add_on_cpu(cpu, 1);
        } else {
            for kind in IpiKind::ALL {
                if !taken.contains(kind.as_set()) {
                    continue;
                }
                if kind == IpiKind::Xcall {
                    self.run_xcalls(cpu);
                } else if let Some(handler) = self.ipi_handlers[kind as usize].get() {
                    handler(cpu);
                } else {
                    log::warn!("{:?} delivered to {:?} with no handler", kind, cpu);
                }
            }
        }

        self.splx(saved);
    }

    /// Returns the spurious-doorbell count, summed over all CPUs.
    pub fn spurious_doorbell_count(&self) -> usize {
        self.spurious_doorbells.sum_all_cpus()
    }

    /// Queues `f` on every target CPU and posts a cross-call message.
    ///
    /// `f` runs asynchronously on the targets, in doorbell context with
    /// the mask at `splhigh`; if the calling CPU is a target, `f` runs on
    /// it synchronously. Queueing allocates on the sending side only;
    /// delivery does not.
    pub fn xcall(&self, targets: &CpuSet, f: fn()) {
        let me = self.current_cpu();
        let mut call_on_self = false;
        for cpu in targets.iter() {
            if cpu == me {
                call_on_self = true;
                continue;
            }
            self.queue_xcall(cpu, Box::new(f));
        }
        if call_on_self {
            f();
        }
    }

    /// Like [`xcall`], but returns only once every target has run `f`.
    ///
    /// The acknowledgement barrier is an atomic countdown carried by the
    /// queued calls themselves; the channel below stays fire-and-forget.
    ///
    /// [`xcall`]: Self::xcall
    pub fn xcall_sync(&self, targets: &CpuSet, f: fn()) {
        let me = self.current_cpu();
        let remote = targets.iter().filter(|cpu| *cpu != me).count();
        let acks = Arc::new(AtomicUsize::new(remote));

        for cpu in targets.iter() {
            if cpu == me {
                continue;
            }
            let acks = acks.clone();
            self.queue_xcall(
                cpu,
                Box::new(move || {
                    f();
                    acks.fetch_sub(1, Ordering::Release);
                }),
            );
        }
        if targets.contains(me) {
            f();
        }
        while acks.load(Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }
    }

    fn queue_xcall(&self, cpu: CpuId, item: XcallItem) {
        self.xcall_queues[cpu.as_usize()].lock().push_back(item);
        self.post(cpu, IpiKind::Xcall);
    }

    fn run_xcalls(&self, cpu: CpuId) {
        loop {
            let Some(item) = self.xcall_queues[cpu.as_usize()].lock().pop_front() else {
                break;
            };
            log::trace!("running cross-call on {:?}", cpu);
            item();
        }
    }
}
