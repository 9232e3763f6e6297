// SPDX-License-Identifier: MPL-2.0

//! Soft (deferred) interrupt dispatch.
//!
//! A soft interrupt is work a top-half handler hands off to run later, at
//! one of the four soft priority levels, once the CPU's mask drops below
//! that level. The dispatcher registers itself as the bottom-half handler
//! of an [`IntrDomain`]: every lowering transition of the priority mask
//! drains the calling CPU's scheduled soft interrupts, highest level
//! first, each one running with the mask raised to exactly its own level.
//!
//! Scheduling is edge-style and coalescing: marking an already-pending
//! handle is a no-op, and one drain pass runs the callback once no matter
//! how many times it was scheduled in between. A callback may reschedule
//! itself; the per-drain pass bound keeps a self-rescheduling handler
//! from starving the interrupted context.

#![no_std]
#![deny(unsafe_code)]
#![warn(missing_docs)]

extern crate alloc;
#[cfg(test)]
extern crate std;

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
};

use kspl::{
    cpu::{CpuId, PerCpuCounter},
    ipl::Ipl,
    Error, IntrDomain, Result,
};
use spin::Mutex as SpinLock;

/// The number of soft interrupt levels.
pub const NR_SOFT_LEVELS: usize = 4;

/// The maximum number of drain passes one lowering transition runs.
///
/// A callback that reschedules itself keeps its level pending; the bound
/// stops the drain from livelocking in it. Whatever is left over is
/// picked up by the next lowering transition.
const RUN_PASSES: usize = 5;

fn soft_idx(level: Ipl) -> usize {
    // SoftClock..SoftSerial are the contiguous levels 1..=4.
    level.as_usize() - 1
}

/// An established soft interrupt.
///
/// Created by [`SoftintDispatcher::establish`] and armed with
/// [`SoftintDispatcher::schedule`].
pub struct SoftintHandle {
    level: Ipl,
    callback: Box<dyn Fn() + Send + Sync>,
    pending: AtomicBool,
    runs: AtomicUsize,
}

impl SoftintHandle {
    /// Returns the soft level the callback runs at.
    pub fn level(&self) -> Ipl {
        self.level
    }

    /// Returns how many times the callback has run.
    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for SoftintHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The boxed callback is opaque; print the scheduling state.
        f.debug_struct("SoftintHandle")
            .field("level", &self.level)
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// The per-domain soft interrupt dispatcher.
///
/// One instance hooks the bottom half of one [`IntrDomain`]; constructing
/// a second dispatcher for the same domain panics, as the domain accepts
/// only one bottom-half handler.
pub struct SoftintDispatcher {
    domain: Arc<IntrDomain>,
    levels: [SpinLock<Vec<Arc<SoftintHandle>>>; NR_SOFT_LEVELS],
    // Per-CPU bitmask of soft levels with scheduled work, indexed by
    // `soft_idx`.
    cpu_pending: Box<[AtomicU8]>,
    // Per-CPU drain reentrancy latch: `splx` inside a running callback
    // re-enters the bottom half.
    draining: Box<[AtomicBool]>,
    counts: [PerCpuCounter; NR_SOFT_LEVELS],
}

impl SoftintDispatcher {
    /// Creates the dispatcher and hooks it into `domain`'s bottom half.
    pub fn new(domain: Arc<IntrDomain>) -> Arc<Self> {
        let num_cpus = domain.num_cpus();
        let dispatcher = Arc::new(Self {
            levels: core::array::from_fn(|_| SpinLock::new(Vec::new())),
            cpu_pending: (0..num_cpus)
                .map(|_| AtomicU8::new(0))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            draining: (0..num_cpus)
                .map(|_| AtomicBool::new(false))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            counts: core::array::from_fn(|_| PerCpuCounter::new(num_cpus)),
            domain: domain.clone(),
        });

        let hook = dispatcher.clone();
        domain.register_bottom_half_handler(move |cpu| hook.process_pending_on(cpu));
        dispatcher
    }

    /// Establishes `callback` as a soft interrupt at `level`.
    ///
    /// Fails with [`Error::InvalidArgs`] unless `level` is one of the
    /// four soft levels.
    pub fn establish(
        &self,
        level: Ipl,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<Arc<SoftintHandle>> {
        if !level.is_soft() {
            return Err(Error::InvalidArgs);
        }
        let handle = Arc::new(SoftintHandle {
            level,
            callback: Box::new(callback),
            pending: AtomicBool::new(false),
            runs: AtomicUsize::new(0),
        });
        self.levels[soft_idx(level)].lock().push(handle.clone());
        log::debug!("soft interrupt established at {:?}", level);
        Ok(handle)
    }

    /// Removes `handle` from its level.
    ///
    /// A schedule that already happened may still run the callback once;
    /// after that the handle is inert.
    pub fn disestablish(&self, handle: &Arc<SoftintHandle>) {
        self.levels[soft_idx(handle.level)]
            .lock()
            .retain(|h| !Arc::ptr_eq(h, handle));
        handle.pending.store(false, Ordering::Release);
    }

    /// Marks `handle` pending on the calling CPU.
    ///
    /// Idempotent while the callback has not run yet. If the calling
    /// CPU's level does not mask `handle`'s level the callback runs
    /// before this returns; otherwise it runs when the mask next drops
    /// below the level.
    pub fn schedule(&self, handle: &Arc<SoftintHandle>) {
        if handle.pending.swap(true, Ordering::AcqRel) {
            // Already marked; the upcoming run covers this schedule too.
            return;
        }
        let cpu = self.domain.current_cpu();
        self.cpu_pending[cpu.as_usize()]
            .fetch_or(1 << soft_idx(handle.level), Ordering::AcqRel);
        if self.domain.current_ipl() < handle.level {
            self.process_pending_on(cpu);
        }
    }

    /// Drains the soft interrupts of `cpu` that the current level leaves
    /// unmasked. The domain calls this on every lowering transition.
    pub fn process_pending_on(&self, cpu: CpuId) {
        if self.draining[cpu.as_usize()].swap(true, Ordering::AcqRel) {
            return;
        }
        for _ in 0..RUN_PASSES {
            let Some(level) = self.take_highest_above(cpu, self.domain.current_ipl()) else {
                break;
            };
            self.run_level(cpu, level);
        }
        self.draining[cpu.as_usize()].store(false, Ordering::Release);
    }

    /// Returns the dispatch count of `level`, summed over all CPUs.
    pub fn dispatch_count(&self, level: Ipl) -> usize {
        self.counts[soft_idx(level)].sum_all_cpus()
    }

    /// Returns the dispatch count of `level` on one CPU.
    pub fn dispatch_count_on_cpu(&self, level: Ipl, cpu: CpuId) -> usize {
        self.counts[soft_idx(level)].get_on_cpu(cpu)
    }

    /// Picks the highest scheduled soft level strictly above `floor` on
    /// `cpu` and clears its bit.
    fn take_highest_above(&self, cpu: CpuId, floor: Ipl) -> Option<Ipl> {
        let bits = &self.cpu_pending[cpu.as_usize()];
        for level in Ipl::SOFT.into_iter().rev() {
            if level <= floor {
                return None;
            }
            let bit = 1u8 << soft_idx(level);
            if bits.fetch_and(!bit, Ordering::AcqRel) & bit != 0 {
                return Some(level);
            }
        }
        None
    }

    fn run_level(&self, cpu: CpuId, level: Ipl) {
        let saved = self.domain.splraise(level);
        let snapshot = self.levels[soft_idx(level)].lock().clone();
        for handle in &snapshot {
            // Clear before running so a reschedule from inside the
            // callback is not lost.
            if handle.pending.swap(false, Ordering::AcqRel) {
                (handle.callback)();
                handle.runs.fetch_add(1, Ordering::Relaxed);
                self.counts[soft_idx(level)].add_on_cpu(cpu, 1);
            }
        }
        self.domain.splx(saved);
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use kspl::{cpu::CpuId, ipl::IplTable, xen::XenHal};

    use super::*;

    fn board() -> (Arc<IntrDomain>, Arc<SoftintDispatcher>) {
        let hal = XenHal::new(1);
        let domain = IntrDomain::new(hal, IplTable::linear());
        let dispatcher = SoftintDispatcher::new(domain.clone());
        (domain, dispatcher)
    }

    #[test]
    fn handle_debug_reports_level_and_pending() {
        let (domain, dispatcher) = board();
        let handle = dispatcher.establish(Ipl::SoftNet, || {}).unwrap();

        let saved = domain.splvm();
        dispatcher.schedule(&handle);
        let repr = std::format!("{:?}", handle);
        assert!(repr.contains("SoftNet"));
        assert!(repr.contains("pending: true"));
        domain.splx(saved);
    }

    #[test]
    fn establish_rejects_hard_levels() {
        let (_domain, dispatcher) = board();
        for level in [Ipl::None, Ipl::Vm, Ipl::Sched, Ipl::High] {
            assert_eq!(
                dispatcher.establish(level, || {}).unwrap_err(),
                Error::InvalidArgs
            );
        }
    }

    #[test]
    fn schedule_in_open_context_runs_immediately() {
        let (_domain, dispatcher) = board();
        let handle = dispatcher.establish(Ipl::SoftClock, || {}).unwrap();

        dispatcher.schedule(&handle);
        assert_eq!(handle.run_count(), 1);
    }

    #[test]
    fn coalesced_schedules_run_once() {
        let (domain, dispatcher) = board();
        let handle = dispatcher.establish(Ipl::SoftNet, || {}).unwrap();

        let saved = domain.splvm();
        dispatcher.schedule(&handle);
        dispatcher.schedule(&handle);
        dispatcher.schedule(&handle);
        assert_eq!(handle.run_count(), 0);

        domain.splx(saved);
        assert_eq!(handle.run_count(), 1);
    }

    #[test]
    fn drain_boundary_is_strictly_above_the_new_level() {
        let (domain, dispatcher) = board();
        let handle = dispatcher.establish(Ipl::SoftBio, || {}).unwrap();

        let saved = domain.splraise(Ipl::SoftBio);
        dispatcher.schedule(&handle);
        assert_eq!(handle.run_count(), 0);

        // Lowering *to* the handler's own level must not run it.
        domain.spllower(Ipl::SoftBio);
        assert_eq!(handle.run_count(), 0);

        domain.spllower(Ipl::SoftClock);
        assert_eq!(handle.run_count(), 1);
        assert_eq!(saved, Ipl::None);
        domain.spl0();
    }

    #[test]
    fn higher_soft_level_drains_first() {
        let (domain, dispatcher) = board();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        let clock = dispatcher
            .establish(Ipl::SoftClock, move || o.lock().unwrap().push("clock"))
            .unwrap();
        let o = order.clone();
        let serial = dispatcher
            .establish(Ipl::SoftSerial, move || o.lock().unwrap().push("serial"))
            .unwrap();

        let saved = domain.splvm();
        dispatcher.schedule(&clock);
        dispatcher.schedule(&serial);
        domain.splx(saved);

        assert_eq!(*order.lock().unwrap(), ["serial", "clock"]);
    }

    #[test]
    fn staged_lowering_delivers_at_the_right_step() {
        let (domain, dispatcher) = board();
        let handle = dispatcher.establish(Ipl::SoftNet, || {}).unwrap();

        let s0 = domain.splvm();
        let s1 = domain.splsched();
        dispatcher.schedule(&handle);

        domain.splx(s1);
        // Still masked at Vm: SoftNet <= Vm.
        assert_eq!(handle.run_count(), 0);

        domain.splx(s0);
        assert_eq!(handle.run_count(), 1);
        // One schedule, one run: the later lowering does not run it again.
        domain.splhigh();
        domain.spl0();
        assert_eq!(handle.run_count(), 1);
    }

    #[test]
    fn reschedule_from_the_callback_runs_in_the_same_drain() {
        let (domain, dispatcher) = board();
        let dispatcher2 = dispatcher.clone();
        let slot: Arc<Mutex<Option<Arc<SoftintHandle>>>> = Arc::new(Mutex::new(None));

        let slot2 = slot.clone();
        let reruns = Arc::new(AtomicUsize::new(1));
        let r = reruns.clone();
        let handle = dispatcher
            .establish(Ipl::SoftClock, move || {
                if r.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    let guard = slot2.lock().unwrap();
                    dispatcher2.schedule(guard.as_ref().unwrap());
                }
            })
            .unwrap();
        *slot.lock().unwrap() = Some(handle.clone());

        let saved = domain.splvm();
        dispatcher.schedule(&handle);
        domain.splx(saved);

        // The reschedule is honored within the same lowering transition.
        assert_eq!(handle.run_count(), 2);
    }

    #[test]
    fn disestablished_handle_stays_inert() {
        let (domain, dispatcher) = board();
        let handle = dispatcher.establish(Ipl::SoftBio, || {}).unwrap();

        let saved = domain.splvm();
        dispatcher.schedule(&handle);
        dispatcher.disestablish(&handle);
        domain.splx(saved);
        assert_eq!(handle.run_count(), 0);
    }

    #[test]
    fn per_level_counters_track_runs() {
        let (domain, dispatcher) = board();
        let bio = dispatcher.establish(Ipl::SoftBio, || {}).unwrap();
        let net = dispatcher.establish(Ipl::SoftNet, || {}).unwrap();

        for _ in 0..3 {
            let saved = domain.splvm();
            dispatcher.schedule(&bio);
            domain.splx(saved);
        }
        dispatcher.schedule(&net);

        assert_eq!(dispatcher.dispatch_count(Ipl::SoftBio), 3);
        assert_eq!(dispatcher.dispatch_count(Ipl::SoftNet), 1);
        assert_eq!(dispatcher.dispatch_count(Ipl::SoftClock), 0);
        assert_eq!(
            dispatcher.dispatch_count_on_cpu(Ipl::SoftBio, CpuId::bsp()),
            3
        );
    }
}
