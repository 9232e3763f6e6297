// SPDX-License-Identifier: MPL-2.0

//! The hardware abstraction layer that the arbiter composes over.
//!
//! Everything architecture-specific about interrupt masking is confined to
//! an implementation of [`IplHal`]: a mask-register write on bare hardware,
//! or a shared-flag write on a paravirtual port (see [`crate::xen`]). The
//! arbiter, registry and dispatcher are safe code over this trait.

use bit_field::BitField;

use crate::{cpu::CpuId, ipl::Ipl};

/// An opaque hardware interrupt-mask word.
///
/// Mask words are produced by the [`IplTable`] and consumed by
/// [`IplHal::set_mask`]; the rest of the framework compares symbolic
/// [`Ipl`]s and never interprets the bits.
///
/// [`IplTable`]: crate::ipl::IplTable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwMask(u16);

impl HwMask {
    /// The mask word that masks nothing.
    pub const NONE: HwMask = HwMask(0);

    /// Returns the word with every level at or below `ipl` masked.
    pub const fn up_to(ipl: Ipl) -> HwMask {
        HwMask(((1u32 << (ipl.as_u8() as u32 + 1)) - 1) as u16)
    }

    /// Creates a mask word from raw bits.
    pub const fn from_bits(bits: u16) -> HwMask {
        HwMask(bits)
    }

    /// Returns the raw bits of the word.
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Returns whether the word masks sources at `ipl`.
    pub fn covers(self, ipl: Ipl) -> bool {
        self.0.get_bit(ipl.as_usize())
    }
}

/// The architecture-specific primitive set the framework depends on.
///
/// An implementation is expected to be cheap and infallible: the arbiter
/// calls [`set_mask`] on every priority transition and never handles a
/// failure from it. Implementations that touch privileged registers keep
/// their `unsafe` confined to the implementing module; the trait surface
/// itself is safe.
///
/// [`set_mask`]: IplHal::set_mask
pub trait IplHal: Send + Sync + 'static {
    /// Returns the CPU the calling context executes on.
    fn current_cpu(&self) -> CpuId;

    /// Returns the number of CPUs driven by this HAL.
    fn num_cpus(&self) -> usize;

    /// Applies `mask` as the interrupt-acceptance threshold of `cpu`.
    ///
    /// This must take effect in one step and must not block or schedule;
    /// it is called with arbitrary interrupt state on the current CPU.
    fn set_mask(&self, cpu: CpuId, mask: HwMask);

    /// Rings the doorbell of `cpu`, the IPI delivery primitive.
    fn doorbell(&self, cpu: CpuId);

    /// Enables delivery of `vector` at the interrupt source.
    ///
    /// Called when the first handler is established on the vector. The
    /// default does nothing, for controllers that need no per-source gate.
    fn enable_source(&self, vector: u8) {
        let _ = vector;
    }

    /// Disables delivery of `vector` at the interrupt source.
    ///
    /// Called when the last handler on the vector is disestablished, and
    /// when the spurious-interrupt policy masks a faulting vector.
    fn disable_source(&self, vector: u8) {
        let _ = vector;
    }

    /// Pops one delivery the source pended for `cpu` while it was masked.
    ///
    /// Hardware ports return `None`: the interrupt controller re-delivers
    /// on its own once the mask register is lowered. Ports whose mask is a
    /// shared memory flag must report pended deliveries here, because the
    /// source will not re-fire for a mask it already observed clear. The
    /// arbiter polls this on every lowering transition.
    fn pop_pending(&self, cpu: CpuId) -> Option<u8> {
        let _ = cpu;
        None
    }
}
