// SPDX-License-Identifier: MPL-2.0

//! The interrupt source registry.
//!
//! Each hardware vector carries an ordered, fixed-capacity list of
//! handlers, each tagged with its level and sharing policy. The list is
//! mutated only at establish/disestablish time with the vector's own
//! dispatch excluded by `splhigh`; the dispatch path reads a cached level
//! and takes the slot lock only long enough to snapshot and pin the list,
//! never holding it across a callback.

use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering},
};

use smallvec::SmallVec;
use spin::Mutex as SpinLock;

use crate::{cpu::CpuId, domain::IntrDomain, ipl::Ipl, prelude::*, Error};

/// The number of hardware interrupt vectors a domain tracks.
pub const NR_VECTORS: usize = 128;

/// The fixed number of handler slots per vector.
pub const MAX_HANDLERS_PER_VECTOR: usize = 8;

/// Consecutive unclaimed deliveries after which a vector is treated as a
/// hardware fault and masked for good.
pub const SPURIOUS_LIMIT: u32 = 5;

const NO_LEVEL: u8 = u8::MAX;

/// Sharing policy of a hardware interrupt vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharePolicy {
    /// The line tolerates multiple handlers; every handler sees every
    /// delivery.
    Shared,
    /// The line admits exactly one handler.
    Exclusive,
}

/// A top-half interrupt handler.
///
/// Runs with the CPU raised to the vector's level and must not block.
/// Returns `true` iff the handler claimed the delivery as its own.
///
/// Any `Fn() -> bool + Send + Sync` closure implements this trait, so a
/// driver can register a capturing closure and have the lifetime and type
/// of its context checked at establish time.
pub trait IntrHandler: Send + Sync {
    /// Handles one delivery of the vector.
    fn handle(&self) -> bool;
}

impl<F> IntrHandler for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn handle(&self) -> bool {
        self()
    }
}

pub(crate) struct HandlerEntry {
    level: Ipl,
    handler: Box<dyn IntrHandler>,
    // In-flight invocation count; disestablish waits for zero.
    active: AtomicUsize,
}

struct VectorSlot {
    entries: SmallVec<[Arc<HandlerEntry>; 2]>,
    share: Option<SharePolicy>,
}

pub(crate) struct Vector {
    slot: SpinLock<VectorSlot>,
    // Cached maximum handler level, `NO_LEVEL` when the list is empty.
    // Read by the dispatch path without taking the slot lock.
    level: AtomicU8,
    dispatches: AtomicU64,
    spurious: AtomicU64,
    stray_streak: AtomicU32,
    fault_masked: AtomicBool,
}

impl Vector {
    pub(crate) fn new() -> Self {
        Self {
            slot: SpinLock::new(VectorSlot {
                entries: SmallVec::new(),
                share: None,
            }),
            level: AtomicU8::new(NO_LEVEL),
            dispatches: AtomicU64::new(0),
            spurious: AtomicU64::new(0),
            stray_streak: AtomicU32::new(0),
            fault_masked: AtomicBool::new(false),
        }
    }

    pub(crate) fn level(&self) -> Option<Ipl> {
        Ipl::from_raw(self.level.load(Ordering::Acquire))
    }
}

/// An established interrupt handler.
///
/// The registry owns the handler once establish succeeds; this handle is
/// the caller's only reference to it. Dropping the handle (or calling
/// [`disestablish`]) unlinks the handler and waits for any dispatch still
/// executing it on another CPU to finish, so the handler's captured
/// context is never freed under a running callback.
///
/// [`disestablish`]: Self::disestablish
#[must_use]
pub struct IntrHandle {
    domain: Arc<IntrDomain>,
    vector: u8,
    entry: Option<Arc<HandlerEntry>>,
}

impl IntrHandle {
    /// Returns the vector the handler is established on.
    pub fn vector(&self) -> u8 {
        self.vector
    }

    /// Returns the handler's level.
    pub fn level(&self) -> Ipl {
        self.entry.as_ref().unwrap().level
    }

    /// Removes the handler from its vector.
    ///
    /// Returns once no CPU is executing the handler. The quiescence the
    /// original ports asked callers to guarantee themselves is enforced
    /// structurally here.
    pub fn disestablish(mut self) {
        self.unlink();
    }

    fn unlink(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.domain.intr_disestablish(self.vector, entry);
        }
    }
}

impl Drop for IntrHandle {
    fn drop(&mut self) {
        self.unlink();
    }
}

impl fmt::Debug for IntrHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The boxed handler is opaque; print the registration facts.
        f.debug_struct("IntrHandle")
            .field("vector", &self.vector)
            .field("level", &self.entry.as_ref().map(|e| e.level))
            .finish_non_exhaustive()
    }
}

impl IntrDomain {
    /// Establishes `handler` on `vector` at `level`.
    ///
    /// Fails with [`Error::NoMoreVectors`] when the vector's fixed handler
    /// table is full, and with [`Error::IncompatibleSharing`] when the
    /// vector is already claimed exclusively, or claimed shared and an
    /// exclusive registration is attempted. The first handler on a vector
    /// enables the source at the HAL; removing the last disables it again.
    pub fn intr_establish(
        self: &Arc<Self>,
        vector: u8,
        level: Ipl,
        share: SharePolicy,
        handler: impl IntrHandler + 'static,
    ) -> Result<IntrHandle> {
        if vector as usize >= NR_VECTORS || level == Ipl::None {
            return Err(Error::InvalidArgs);
        }
        let entry = Arc::new(HandlerEntry {
            level,
            handler: Box::new(handler),
            active: AtomicUsize::new(0),
        });

        // Exclude the vector's own dispatch while the list changes.
        let saved = self.splhigh();
        let result = {
            let v = &self.vectors[vector as usize];
            let mut slot = v.slot.lock();
            let admissible = match slot.share {
                Some(SharePolicy::Exclusive) => Err(Error::IncompatibleSharing),
                Some(SharePolicy::Shared) if share == SharePolicy::Exclusive => {
                    Err(Error::IncompatibleSharing)
                }
                Some(SharePolicy::Shared) if slot.entries.len() == MAX_HANDLERS_PER_VECTOR => {
                    Err(Error::NoMoreVectors)
                }
                _ => Ok(()),
            };
            admissible.map(|()| {
                let first = slot.entries.is_empty();
                slot.entries.push(entry.clone());
                slot.share = Some(slot.share.unwrap_or(share));
                let max = slot.entries.iter().map(|e| e.level).max().unwrap();
                v.level.store(max.as_u8(), Ordering::Release);
                if first && !v.fault_masked.load(Ordering::Acquire) {
                    self.hal.enable_source(vector);
                }
            })
        };
        self.splx(saved);

        result.map(|()| {
            log::debug!("vector {}: handler established at {:?}", vector, level);
            IntrHandle {
                domain: self.clone(),
                vector,
                entry: Some(entry),
            }
        })
    }

    pub(crate) fn intr_disestablish(&self, vector: u8, entry: Arc<HandlerEntry>) {
        let saved = self.splhigh();
        {
            let v = &self.vectors[vector as usize];
            let mut slot = v.slot.lock();
            slot.entries.retain(|e| !Arc::ptr_eq(e, &entry));
            match slot.entries.iter().map(|e| e.level).max() {
                Some(max) => v.level.store(max.as_u8(), Ordering::Release),
                None => {
                    v.level.store(NO_LEVEL, Ordering::Release);
                    slot.share = None;
                    self.hal.disable_source(vector);
                }
            }
        }
        self.splx(saved);

        // Structural quiescence: wait out any dispatch still running the
        // entry on another CPU before the caller frees its context.
        while entry.active.load(Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }
    }

    /// The HAL trampoline entry: `vector` fired on the calling CPU.
    ///
    /// Raises to the vector's level, runs its handlers in registration
    /// order and restores through the lower-and-drain path. If the
    /// vector's level is masked, the delivery is pended instead and
    /// replayed by the next lowering transition that unmasks it.
    pub fn handle_irq(&self, vector: u8) {
        let cpu = self.current_cpu();
        self.handle_irq_on(cpu, vector);
    }

    pub(crate) fn handle_irq_on(&self, cpu: CpuId, vector: u8) {
        self.deliver(cpu, vector);
        self.run_pending(cpu);
    }

    /// Runs or pends `vector`, without draining afterwards.
    pub(crate) fn deliver(&self, cpu: CpuId, vector: u8) {
        if vector as usize >= NR_VECTORS {
            return;
        }
        let v = &self.vectors[vector as usize];
        if v.fault_masked.load(Ordering::Acquire) {
            return;
        }
        let Some(level) = v.level() else {
            self.note_spurious(vector);
            return;
        };
        if self.cpu_state(cpu).level() >= level {
            self.cpu_state(cpu).set_pending(vector);
            return;
        }
        self.dispatch_pending(cpu, vector);
    }

    /// Dispatches `vector` now: raise to its level, run the handlers,
    /// restore the previous level. The caller owns the drain contract.
    pub(crate) fn dispatch_pending(&self, cpu: CpuId, vector: u8) {
        let v = &self.vectors[vector as usize];
        if v.fault_masked.load(Ordering::Acquire) {
            return;
        }
        let Some(level) = v.level() else {
            self.note_spurious(vector);
            return;
        };
        let state = self.cpu_state(cpu);
        let saved = state.level();
        if level <= saved {
            state.set_pending(vector);
            return;
        }
        state.set_level(level);
        self.hal.set_mask(cpu, self.table.mask_of(level));
        self.invoke_handlers(cpu, vector, level);
        state.set_level(saved);
        self.hal.set_mask(cpu, self.table.mask_of(saved));
    }

    fn invoke_handlers(&self, cpu: CpuId, vector: u8, level: Ipl) {
        let v = &self.vectors[vector as usize];
        let (entries, shared) = {
            let slot = v.slot.lock();
            // Mark the snapshot in-flight while the lock is still held: a
            // concurrent disestablish either unlinks before the snapshot
            // is taken or observes the nonzero count and waits.
            for entry in &slot.entries {
                entry.active.fetch_add(1, Ordering::Acquire);
            }
            (slot.entries.clone(), slot.share == Some(SharePolicy::Shared))
        };

        v.dispatches.fetch_add(1, Ordering::Relaxed);
        self.ipl_counts[level.as_usize()].add_on_cpu(cpu, 1);

        let mut handled = false;
        for entry in &entries {
            let claimed = entry.handler.handle();
            handled |= claimed;
            // Shared lines run every handler; otherwise the first
            // claimant ends the walk.
            if claimed && !shared {
                break;
            }
        }
        for entry in &entries {
            entry.active.fetch_sub(1, Ordering::Release);
        }

        if handled {
            v.stray_streak.store(0, Ordering::Relaxed);
        } else {
            self.note_spurious(vector);
        }
    }

    /// Counts a stray delivery and applies the fault policy: enough
    /// consecutive strays mask the vector for good.
    pub(crate) fn note_spurious(&self, vector: u8) {
        let v = &self.vectors[vector as usize];
        v.spurious.fetch_add(1, Ordering::Relaxed);
        let streak = v.stray_streak.fetch_add(1, Ordering::Relaxed) + 1;
        if streak >= SPURIOUS_LIMIT && !v.fault_masked.swap(true, Ordering::AcqRel) {
            self.hal.disable_source(vector);
            log::error!(
                "vector {}: {} consecutive spurious interrupts, masking the source",
                vector,
                streak
            );
        }
    }

    /// Returns the dispatch count of `vector`.
    pub fn irq_count(&self, vector: u8) -> u64 {
        self.vectors[vector as usize].dispatches.load(Ordering::Relaxed)
    }

    /// Returns the spurious-delivery count of `vector`.
    pub fn spurious_count(&self, vector: u8) -> u64 {
        self.vectors[vector as usize].spurious.load(Ordering::Relaxed)
    }

    /// Iterates the dispatch counts of all vectors, in vector order.
    pub fn irq_counts(&self) -> impl Iterator<Item = u64> + '_ {
        self.vectors
            .iter()
            .map(|v| v.dispatches.load(Ordering::Relaxed))
    }

    /// Iterates the spurious-delivery counts of all vectors.
    pub fn spurious_counts(&self) -> impl Iterator<Item = u64> + '_ {
        self.vectors
            .iter()
            .map(|v| v.spurious.load(Ordering::Relaxed))
    }

    /// Returns whether the spurious-fault policy has masked `vector`.
    pub fn is_vector_fault_masked(&self, vector: u8) -> bool {
        self.vectors[vector as usize]
            .fault_masked
            .load(Ordering::Acquire)
    }
}
