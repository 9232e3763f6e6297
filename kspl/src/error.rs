// SPDX-License-Identifier: MPL-2.0

/// The error type which is returned from the APIs of this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// Invalid arguments provided.
    InvalidArgs,
    /// The fixed-size handler table of the vector is exhausted.
    NoMoreVectors,
    /// The vector is already claimed with an incompatible sharing policy.
    IncompatibleSharing,
}
