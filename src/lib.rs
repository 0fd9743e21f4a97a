//! Distributed synchronization primitives for a fixed group of peer
//! processes, built entirely on one-sided remote memory access (RMA): a
//! sequential section, a fetch-and-add counter, a FIFO mutex, a recursive
//! mutex, and a condition variable, all without any shared address space.
//!
//! The RMA runtime itself (the communicator and its windows) is an
//! abstract collaborator, defined by the traits in [`rma`]; this crate
//! ships one concrete implementation of it, [`local`], an in-process
//! thread-backed transport used by its own tests and suitable for trying
//! the primitives out without a real distributed runtime.
//!
//! # Example
//!
//! ```
//! use rma_sync::local::LocalCommunicator;
//! use rma_sync::counter::Counter;
//!
//! let comms = LocalCommunicator::group(4);
//! let handles: Vec<_> = comms
//!     .into_iter()
//!     .map(|comm| {
//!         std::thread::spawn(move || {
//!             let counter = Counter::new(comm, Default::default()).unwrap();
//!             counter.next(None).unwrap()
//!         })
//!     })
//!     .collect();
//! let mut values: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
//! values.sort_unstable();
//! assert_eq!(values, vec![0, 1, 2, 3]);
//! ```
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

pub mod backoff;
pub mod condition;
pub mod counter;
pub mod error;
pub mod mutex;
pub mod rma;
pub mod rmutex;
pub mod sequential;

#[cfg(feature = "std")]
pub mod local;

pub use condition::Condition;
pub use counter::Counter;
pub use error::{Error, Result};
pub use mutex::Mutex;
pub use rmutex::RMutex;
pub use sequential::Sequential;
