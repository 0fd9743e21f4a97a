//! A distributed FIFO mutex: an MCS-style queueing spinlock implemented
//! entirely over RMA, with no shared address space and no pointers -- the
//! MCS `next` chain is encoded as rank-indexed slots in a window.
//!
//! A single `TAIL` pointer, homed on rank 0, identifies the current queue
//! tail. Every rank's own window segment holds its `NEXT` successor and
//! `LOCK` flag. Acquiring swaps the caller onto the tail, links the
//! previous tail to the caller, then spins on the caller's own `LOCK` flag;
//! releasing either clears the tail (no successor) or writes the
//! successor's `LOCK = 1`.

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::rma::{Op, Rank, Window, WindowAllocator, WindowInfo, NULL_RANK};

const LOCK: usize = 0;
const NEXT: usize = 1;
const TAIL: usize = 2;
const TAIL_RANK: usize = 0;

/// A mutual-exclusion lock held by at most one rank in the group at a time.
///
/// Construction is collective: every rank in `comm`'s group must call
/// [`Mutex::new`]. `acquire`/`release` are not reentrant -- acquiring while
/// already holding fails with [`Error::AlreadyHeld`]; see [`crate::rmutex`]
/// for a recursive wrapper.
pub struct Mutex<C: WindowAllocator<Rank>> {
    window: Option<C::Window>,
}

impl<C: WindowAllocator<Rank>> Mutex<C> {
    /// Collectively create a mutex in an unlocked state.
    pub fn new(comm: C) -> Result<Self> {
        Self::with_info(comm, WindowInfo::new())
    }

    /// Collectively create a mutex in an unlocked state, passing `info`
    /// through to the window's runtime context creation.
    pub fn with_info(comm: C, info: WindowInfo) -> Result<Self> {
        let rank = comm.rank();
        let local_slots = if rank == TAIL_RANK { 3 } else { 2 };
        let init = [0, NULL_RANK, NULL_RANK];
        let window = comm.allocate_window(local_slots, &init[..local_slots], &info);
        Ok(Mutex { window: Some(window) })
    }

    fn window(&self) -> Result<&C::Window> {
        self.window.as_ref().ok_or(Error::AlreadyFreed)
    }

    /// Whether the local rank currently holds the lock.
    pub fn locked(&self) -> bool {
        match &self.window {
            Some(window) => window.local_view(LOCK) != 0,
            None => false,
        }
    }

    /// Acquire the lock. If `blocking` is `true`, blocks until held and
    /// always returns `Ok(true)`; otherwise attempts a single non-blocking
    /// enqueue and returns whether it succeeded.
    ///
    /// Fails with [`Error::AlreadyFreed`] if the window has been freed, or
    /// [`Error::AlreadyHeld`] if the local rank already holds the lock.
    pub fn acquire(&self, blocking: bool) -> Result<bool> {
        if self.window.is_none() {
            return Err(Error::AlreadyFreed);
        }
        if self.locked() {
            return Err(Error::AlreadyHeld);
        }
        let window = self.window()?;
        let self_rank = window.group_rank() as Rank;
        window.lock_all();

        window.accumulate(NULL_RANK, window.group_rank(), NEXT, Op::Replace);
        let prev = if blocking {
            window.fetch_and_op(self_rank, TAIL_RANK, TAIL, Op::Replace)
        } else {
            window.compare_and_swap(self_rank, NULL_RANK, TAIL_RANK, TAIL)
        };
        window.flush(TAIL_RANK);

        let mut locked = prev == NULL_RANK;
        if blocking && !locked {
            window.accumulate(self_rank, prev as usize, NEXT, Op::Replace);
            locked = self.spin_while_equal(window, LOCK, 0) != 0;
        }

        window.accumulate(locked as Rank, window.group_rank(), LOCK, Op::Replace);
        window.unlock_all();
        log::debug!("mutex: rank {} acquire(blocking={blocking}) -> {locked}", window.group_rank());
        Ok(locked)
    }

    /// Release the lock. The caller must currently hold it.
    ///
    /// Fails with [`Error::AlreadyFreed`] if the window has been freed, or
    /// [`Error::NotHeld`] if the local rank does not hold the lock.
    pub fn release(&self) -> Result<()> {
        if self.window.is_none() {
            return Err(Error::AlreadyFreed);
        }
        if !self.locked() {
            return Err(Error::NotHeld);
        }
        let window = self.window()?;
        let self_rank = window.group_rank() as Rank;
        window.lock_all();

        let prev = window.compare_and_swap(NULL_RANK, self_rank, TAIL_RANK, TAIL);
        window.flush(TAIL_RANK);
        if prev != self_rank {
            let successor = self.spin_while_equal(window, NEXT, NULL_RANK);
            window.accumulate(1, successor as usize, LOCK, Op::Replace);
        }

        window.accumulate(0, window.group_rank(), LOCK, Op::Replace);
        window.unlock_all();
        log::debug!("mutex: rank {} release", window.group_rank());
        Ok(())
    }

    /// Sync, then spin on `disp` in the local segment until it no longer
    /// equals `sentinel`, backing off between polls and flushing local RMA
    /// to force progress. Returns the first non-sentinel value seen.
    fn spin_while_equal(&self, window: &C::Window, disp: usize, sentinel: Rank) -> Rank {
        let mut backoff = Backoff::new();
        window.sync();
        loop {
            let value = window.local_view(disp);
            if value != sentinel {
                return value;
            }
            backoff.pulse();
            window.flush(window.group_rank());
            window.sync();
        }
    }

    /// Release the lock if held by this rank, then free the window.
    pub fn free(&mut self) -> Result<()> {
        if self.window.is_some() {
            if self.locked() {
                self.release()?;
            }
            if let Some(window) = self.window.take() {
                window.free();
            }
        }
        Ok(())
    }

    /// Block until the lock is held, returning a guard that releases it on
    /// drop -- scoped entry/exit, so a panic or early return out of the
    /// critical section can't leak the lock.
    pub fn lock(&self) -> Result<MutexGuard<'_, C>> {
        self.acquire(true)?;
        Ok(MutexGuard { mutex: self })
    }

    /// Run `f` while holding the lock, releasing it when `f` returns or
    /// unwinds.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        let _guard = self.lock()?;
        Ok(f())
    }
}

/// RAII guard returned by [`Mutex::lock`]: releases the mutex on drop.
pub struct MutexGuard<'a, C: WindowAllocator<Rank>> {
    mutex: &'a Mutex<C>,
}

impl<'a, C: WindowAllocator<Rank>> Drop for MutexGuard<'a, C> {
    fn drop(&mut self) {
        let _ = self.mutex.release();
    }
}

#[cfg(all(test, feature = "std"))]
mod test {
    use super::*;
    use crate::local::LocalCommunicator;
    use crate::rma::Communicator;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::thread;

    #[test]
    fn acquire_release_round_trip_leaves_no_trace() {
        let comm = LocalCommunicator::group(1).remove(0);
        let mutex = Mutex::new(comm).unwrap();
        assert!(mutex.acquire(true).unwrap());
        assert!(mutex.locked());
        mutex.release().unwrap();
        assert!(!mutex.locked());
    }

    #[test]
    fn acquire_while_held_fails() {
        let comm = LocalCommunicator::group(1).remove(0);
        let mutex = Mutex::new(comm).unwrap();
        mutex.acquire(true).unwrap();
        assert_eq!(mutex.acquire(true), Err(Error::AlreadyHeld));
    }

    #[test]
    fn release_while_unheld_fails() {
        let comm = LocalCommunicator::group(1).remove(0);
        let mutex = Mutex::new(comm).unwrap();
        assert_eq!(mutex.release(), Err(Error::NotHeld));
    }

    #[test]
    fn three_ranks_serialize_critical_section_fifo_friendly() {
        let comms = LocalCommunicator::group(3);
        let order = Arc::new(StdMutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let order = order.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    let rank = comm.rank();
                    let mutex = Mutex::new(comm).unwrap();
                    assert!(mutex.acquire(true).unwrap());
                    order.lock().unwrap().push(rank);
                    counter.fetch_add(1, Ordering::SeqCst);
                    mutex.release().unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let order = order.lock().unwrap();
        assert_eq!(order.len(), 3);
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2]);
    }

    #[test]
    fn non_blocking_acquire_under_contention() {
        let comms = LocalCommunicator::group(3);
        let (c0, c1, c2) = (comms[0].clone(), comms[1].clone(), comms[2].clone());
        // Build three mutex handles over the *same* collectively-created
        // window by constructing once per rank, collectively.
        let handles = vec![
            thread::spawn(move || Mutex::new(c0).unwrap()),
            thread::spawn(move || Mutex::new(c1).unwrap()),
            thread::spawn(move || Mutex::new(c2).unwrap()),
        ];
        let mutexes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(mutexes[0].acquire(true).unwrap());
        assert!(!mutexes[1].acquire(false).unwrap());
        assert!(!mutexes[2].acquire(false).unwrap());
        mutexes[0].release().unwrap();
        assert!(mutexes[1].acquire(false).unwrap());
        mutexes[1].release().unwrap();
    }
}
