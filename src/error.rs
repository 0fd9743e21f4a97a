//! Error kinds shared by every primitive.
//!
//! RMA operations are assumed reliable by the protocols in this crate --
//! retries are never performed here. Transport failures are surfaced
//! unmodified from the [`rma::Communicator`](crate::rma::Communicator) /
//! [`rma::Window`](crate::rma::Window) implementation in use.

use alloc::string::String;

/// Errors raised by the synchronization primitives in this crate.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Operation invoked on a primitive whose window has already been freed.
    #[error("operation invoked on an already-freed primitive")]
    AlreadyFreed,

    /// `Mutex::acquire` called while the local rank already holds the lock.
    #[error("cannot acquire an already-held mutex")]
    AlreadyHeld,

    /// `release`, `wait`, or `notify` called while the local rank does not
    /// hold the lock.
    #[error("cannot operate on an unheld lock")]
    NotHeld,

    /// A failure surfaced as-is from the underlying communication runtime.
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Convenience alias used throughout this crate's public API.
pub type Result<T> = core::result::Result<T, Error>;
