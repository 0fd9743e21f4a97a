//! Token-passing linearization of a section of code across ranks `0..size`.

use crate::error::Result;
use crate::rma::Communicator;

/// Forces ascending-rank execution of a section across the group: rank `r`'s
/// [`Sequential::begin`] returns only after every rank `< r` has called
/// `begin()` and none of them have yet called `end()`.
///
/// Holds no RMA state of its own -- ordering is carried entirely by a
/// zero-byte message handshake on `tag`. With a single-rank group, both
/// `begin` and `end` are no-ops.
pub struct Sequential<C> {
    comm: C,
    tag: i32,
}

impl<C: Communicator> Sequential<C> {
    /// Wrap a communicator for sequential-section use, communicating on `tag`.
    pub fn new(comm: C, tag: i32) -> Self {
        Sequential { comm, tag }
    }

    /// Block until every lower-ranked process has entered the section.
    pub fn begin(&self) -> Result<()> {
        let size = self.comm.size();
        if size == 1 {
            return Ok(());
        }
        let rank = self.comm.rank();
        if rank != 0 {
            self.comm.recv_empty(rank - 1, self.tag)?;
        }
        Ok(())
    }

    /// Let the next-ranked process, if any, proceed past its `begin`.
    pub fn end(&self) -> Result<()> {
        let size = self.comm.size();
        if size == 1 {
            return Ok(());
        }
        let rank = self.comm.rank();
        if rank != size - 1 {
            self.comm.send_empty(rank + 1, self.tag)?;
        }
        Ok(())
    }

    /// Run `f` inside the sequential section, calling `begin`/`end` around it.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        self.begin()?;
        let result = f();
        self.end()?;
        Ok(result)
    }
}

#[cfg(all(test, feature = "std"))]
mod test {
    use super::*;
    use crate::local::LocalCommunicator;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn single_rank_is_a_no_op() {
        let comm = LocalCommunicator::group(1).remove(0);
        let seq = Sequential::new(comm, 0);
        seq.begin().unwrap();
        seq.end().unwrap();
    }

    #[test]
    fn ascending_rank_order_across_five_ranks() {
        let comms = LocalCommunicator::group(5);
        let log = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let log = log.clone();
                thread::spawn(move || {
                    let rank = comm.rank();
                    let seq = Sequential::new(comm, 7);
                    seq.scope(|| log.lock().unwrap().push(rank)).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
