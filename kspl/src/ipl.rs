// SPDX-License-Identifier: MPL-2.0

//! Interrupt priority levels and the level-to-mask table.

use crate::hal::HwMask;

/// The number of interrupt priority levels.
pub const NR_IPLS: usize = 8;

/// A symbolic interrupt priority level (IPL).
///
/// Levels form a fixed total order. A CPU whose mask is at level `L`
/// accepts only sources at levels strictly above `L`; [`Ipl::High`] masks
/// everything, including itself.
///
/// The numeric values are indices into the [`IplTable`], not hardware mask
/// bits. Two different hardware mask words may map to the same logical
/// level; the framework compares levels, never raw mask words.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Ipl {
    /// Nothing masked.
    None = 0,
    /// Soft clock processing (callout expiry).
    SoftClock = 1,
    /// Soft block-I/O completion processing.
    SoftBio = 2,
    /// Soft network protocol processing.
    SoftNet = 3,
    /// Soft serial processing.
    SoftSerial = 4,
    /// Memory management interrupts.
    Vm = 5,
    /// Scheduling and clock interrupts.
    Sched = 6,
    /// Everything masked.
    High = 7,
}

impl Ipl {
    /// All levels, in ascending order.
    pub const ALL: [Ipl; NR_IPLS] = [
        Ipl::None,
        Ipl::SoftClock,
        Ipl::SoftBio,
        Ipl::SoftNet,
        Ipl::SoftSerial,
        Ipl::Vm,
        Ipl::Sched,
        Ipl::High,
    ];

    /// The soft-interrupt levels, in ascending order.
    pub const SOFT: [Ipl; 4] = [Ipl::SoftClock, Ipl::SoftBio, Ipl::SoftNet, Ipl::SoftSerial];

    /// Returns the level with the given raw index, if it is in range.
    pub const fn from_raw(raw: u8) -> Option<Ipl> {
        match raw {
            0 => Some(Ipl::None),
            1 => Some(Ipl::SoftClock),
            2 => Some(Ipl::SoftBio),
            3 => Some(Ipl::SoftNet),
            4 => Some(Ipl::SoftSerial),
            5 => Some(Ipl::Vm),
            6 => Some(Ipl::Sched),
            7 => Some(Ipl::High),
            _ => None,
        }
    }

    /// Converts the level to its raw index.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Converts the level to a table index.
    pub const fn as_usize(self) -> usize {
        self as u8 as usize
    }

    /// Returns whether this is one of the soft-interrupt levels.
    pub const fn is_soft(self) -> bool {
        matches!(
            self,
            Ipl::SoftClock | Ipl::SoftBio | Ipl::SoftNet | Ipl::SoftSerial
        )
    }
}

/// The immutable table mapping each [`Ipl`] to a hardware mask word.
///
/// The table is built once, when the [`IntrDomain`] is constructed, and is
/// read-only afterwards. Ports with asymmetric interrupt routing supply
/// their own mapping function; the arbiter only ever reads the table.
///
/// [`IntrDomain`]: crate::IntrDomain
pub struct IplTable {
    masks: [HwMask; NR_IPLS],
}

impl IplTable {
    /// Builds the table from a per-level mapping function.
    pub fn new(f: impl Fn(Ipl) -> HwMask) -> Self {
        let mut masks = [HwMask::NONE; NR_IPLS];
        for ipl in Ipl::ALL {
            masks[ipl.as_usize()] = f(ipl);
        }
        Self { masks }
    }

    /// Builds the table in which each level masks exactly the levels at or
    /// below it.
    pub fn linear() -> Self {
        Self::new(HwMask::up_to)
    }

    /// Returns the mask word for `ipl`.
    pub fn mask_of(&self, ipl: Ipl) -> HwMask {
        self.masks[ipl.as_usize()]
    }
}
