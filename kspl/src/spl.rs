// SPDX-License-Identifier: MPL-2.0

//! The priority mask arbiter.
//!
//! `splraise` and `splx` bracket a critical region against interrupts at or
//! below a level; `spllower` is the end-of-interrupt path. Lowering the
//! mask is where all deferred work happens: pended hardware vectors are
//! replayed, the bottom-half handler drains soft interrupts, and on
//! upcall-mask ports the HAL's pending events are polled. Control never
//! returns past a lowering call while something the new level unmasks is
//! still pending.

use crate::{cpu::CpuId, domain::IntrDomain, ipl::Ipl};

impl IntrDomain {
    /// Raises the calling CPU's IPL to at least `level`.
    ///
    /// Returns the level previously in effect, which must later be passed
    /// to [`splx`] by the same logical thread of control (stack
    /// discipline). A no-op if `level` is not above the current level.
    /// Infallible and nestable; never schedules away.
    ///
    /// [`splx`]: Self::splx
    pub fn splraise(&self, level: Ipl) -> Ipl {
        let cpu = self.current_cpu();
        let state = self.cpu_state(cpu);
        let old = state.level();
        if level > old {
            state.set_level(level);
            self.hal.set_mask(cpu, self.table.mask_of(level));
        }
        old
    }

    /// Restores the calling CPU's IPL to exactly `saved`.
    ///
    /// `saved` must be the value returned by the matching [`splraise`];
    /// restoring above the current level violates the nesting discipline
    /// and is reported as a diagnostic, not corrected. If the restore
    /// lowers the mask, every pending hardware or software interrupt the
    /// new level unmasks is delivered before this call returns.
    ///
    /// [`splraise`]: Self::splraise
    pub fn splx(&self, saved: Ipl) {
        let cpu = self.current_cpu();
        let state = self.cpu_state(cpu);
        let cur = state.level();
        if saved > cur {
            // The nesting stack is already unrecoverable here; dump and
            // carry on with the caller's value.
            log::error!(
                "splx: restoring {:?} above current {:?} on {:?}; spl nesting broken",
                saved,
                cur,
                cpu
            );
        }
        state.set_level(saved);
        self.hal.set_mask(cpu, self.table.mask_of(saved));
        self.run_pending(cpu);
    }

    /// Lowers the calling CPU's IPL to `level` and drains.
    ///
    /// Like [`splx`] but only ever used to decrease the mask (asserted in
    /// debug builds); this is the end-of-interrupt drain path rather than
    /// the restore half of a save/restore pair.
    ///
    /// [`splx`]: Self::splx
    pub fn spllower(&self, level: Ipl) {
        debug_assert!(
            level <= self.current_ipl(),
            "spllower may only decrease the mask"
        );
        self.splx(level);
    }

    /// Lowers the IPL to [`Ipl::None`].
    pub fn spl0(&self) {
        self.spllower(Ipl::None);
    }

    /// Raises the IPL to [`Ipl::High`].
    pub fn splhigh(&self) -> Ipl {
        self.splraise(Ipl::High)
    }

    /// Raises the IPL to [`Ipl::Sched`].
    pub fn splsched(&self) -> Ipl {
        self.splraise(Ipl::Sched)
    }

    /// Raises the IPL to [`Ipl::Vm`].
    pub fn splvm(&self) -> Ipl {
        self.splraise(Ipl::Vm)
    }

    /// Raises the IPL to [`Ipl::SoftSerial`].
    pub fn splsoftserial(&self) -> Ipl {
        self.splraise(Ipl::SoftSerial)
    }

    /// Raises the IPL to [`Ipl::SoftNet`].
    pub fn splsoftnet(&self) -> Ipl {
        self.splraise(Ipl::SoftNet)
    }

    /// Raises the IPL to [`Ipl::SoftBio`].
    pub fn splsoftbio(&self) -> Ipl {
        self.splraise(Ipl::SoftBio)
    }

    /// Raises the IPL to [`Ipl::SoftClock`].
    pub fn splsoftclock(&self) -> Ipl {
        self.splraise(Ipl::SoftClock)
    }

    /// Delivers everything the current level leaves unmasked on `cpu`.
    ///
    /// Replays pended hardware vectors highest-level-first, polls the
    /// HAL's pending upcalls (the level-triggered obligation of mask-flag
    /// ports) and finally hands the CPU to the bottom-half handler.
    pub(crate) fn run_pending(&self, cpu: CpuId) {
        loop {
            let cur = self.cpu_state(cpu).level();
            if let Some(vector) = self.take_pending_above(cpu, cur) {
                self.dispatch_pending(cpu, vector);
                continue;
            }
            if let Some(vector) = self.hal.pop_pending(cpu) {
                self.deliver(cpu, vector);
                continue;
            }
            break;
        }
        if let Some(handler) = self.bottom_half.get() {
            handler(cpu);
        }
    }

    /// Takes the pended vector with the highest level strictly above
    /// `floor`, if any.
    fn take_pending_above(&self, cpu: CpuId, floor: Ipl) -> Option<u8> {
        let state = self.cpu_state(cpu);
        loop {
            let mut best: Option<(Ipl, u8)> = None;
            for vector in state.pending_vectors() {
                match self.vectors[vector as usize].level() {
                    Some(level) if level > floor => {
                        if best.map_or(true, |(b, _)| level > b) {
                            best = Some((level, vector));
                        }
                    }
                    Some(_) => {}
                    None => {
                        // All handlers went away while the vector was
                        // pended; account it as stray and forget it.
                        if state.clear_pending(vector) {
                            self.note_spurious(vector);
                        }
                    }
                }
            }
            let (_, vector) = best?;
            if state.clear_pending(vector) {
                return Some(vector);
            }
        }
    }
}
