// SPDX-License-Identifier: MPL-2.0

//! Portable interrupt-priority-level (IPL) arbitration and dispatch.
//!
//! Every architecture port of a monolithic kernel carries the same small
//! concurrency core: a per-CPU priority mask with `splraise`/`splx`/
//! `spllower`, a registry of interrupt handlers per hardware vector, a
//! deferred-work ("soft interrupt") drain that fires when the mask is
//! lowered, and, on multiprocessor ports, an inter-processor mailbox rung
//! through a doorbell. This crate implements that core once, as safe code
//! composed over a small [`hal::IplHal`] trait that each port implements.
//!
//! # Top vs bottom half
//!
//! Handling of an interrupt is divided in two parts. The **top half** runs
//! the callbacks registered on the vector via
//! [`IntrDomain::intr_establish`], with the CPU raised to the vector's
//! level. The **bottom half** runs once the mask is lowered again and is
//! specified by a callback registered via
//! [`IntrDomain::register_bottom_half_handler`]; the in-tree
//! `kspl-softint` component uses this hook to drain pending software
//! interrupts. The core itself does not hardcode any concrete bottom-half
//! mechanism.
//!
//! # Priority discipline
//!
//! Each CPU executes one logical stream of activity at a time; a running
//! handler can only be preempted by something at a strictly higher level.
//! `splraise`/`splx` pairs nest with stack discipline on each CPU, and
//! lowering the mask drains every deferred source that the new level
//! unmasks before control returns past the save/restore pair.

#![no_std]
#![deny(unsafe_code)]
#![warn(missing_docs)]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod cpu;
mod domain;
mod error;
pub mod hal;
pub mod ipl;
pub mod irq;
pub mod prelude;
pub mod smp;
mod spl;
pub mod xen;

#[cfg(test)]
pub(crate) mod test_util;

pub use self::{domain::IntrDomain, error::Error, prelude::Result};
