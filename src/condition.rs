//! A condition variable: wait/notify over a second RMA window holding a
//! wake-flag per rank and a waiter queue distinct from any lock's own
//! queue, collaborating with a [`Mutex`] or [`RMutex`] for the associated
//! lock.

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::mutex::Mutex;
use crate::rma::{Op, Rank, Window, WindowAllocator, WindowInfo, NULL_RANK};
use crate::rmutex::RMutex;

use alloc::vec::Vec;

const FLAG: usize = 0;
const NEXT: usize = 1;
const TAIL: usize = 2;
const TAIL_RANK: usize = 0;

/// The lock a [`Condition`] is associated with, tagged so recursion depth
/// can be saved and restored across a `wait()` without runtime type
/// introspection (`spec.md` design note 9.4).
enum Lock<C: WindowAllocator<Rank>> {
    Plain(Mutex<C>),
    Recursive(RMutex<C>),
}

impl<C: WindowAllocator<Rank>> Lock<C> {
    fn locked(&self) -> bool {
        match self {
            Lock::Plain(m) => m.locked(),
            Lock::Recursive(r) => r.locked(),
        }
    }

    fn acquire(&self, blocking: bool) -> Result<bool> {
        match self {
            Lock::Plain(m) => m.acquire(blocking),
            Lock::Recursive(r) => r.acquire(blocking),
        }
    }

    fn release(&self) -> Result<()> {
        match self {
            Lock::Plain(m) => m.release(),
            Lock::Recursive(r) => r.release(),
        }
    }

    /// Release the lock ahead of a sleep, returning whatever state
    /// `acquire_restore` needs to put recursion depth back afterwards.
    fn release_save(&self) -> Result<Option<u32>> {
        match self {
            Lock::Plain(m) => {
                m.release()?;
                Ok(None)
            }
            Lock::Recursive(r) => Ok(Some(r.release_save()?)),
        }
    }

    fn acquire_restore(&self, state: Option<u32>) -> Result<()> {
        match (self, state) {
            (Lock::Plain(m), None) => m.acquire(true).map(|_| ()),
            (Lock::Recursive(r), Some(state)) => r.acquire_restore(state),
            _ => unreachable!("release_save/acquire_restore state must match the lock variant"),
        }
    }

    fn free(&mut self) -> Result<()> {
        match self {
            Lock::Plain(m) => m.free(),
            Lock::Recursive(r) => r.free(),
        }
    }

    /// Force this rank's hold on the lock to zero, regardless of recursion
    /// depth. For [`Lock::Recursive`], a plain `release()` only drops one
    /// level and can leave the underlying mutex held; this drops all levels
    /// at once, the way `free()` must when tearing down a [`Condition`]
    /// over an externally-owned lock it isn't allowed to call `free` on.
    fn reset_if_locked(&self) -> Result<()> {
        match self {
            Lock::Plain(m) => {
                if m.locked() {
                    m.release()?;
                }
                Ok(())
            }
            Lock::Recursive(r) => {
                if r.locked() {
                    r.reset()?;
                }
                Ok(())
            }
        }
    }
}

/// A condition variable associated with a [`Mutex`] or [`RMutex`].
///
/// Waiters are kept in a FIFO queue distinct from the associated lock's own
/// wait queue, on a dedicated window. `notify(n)` wakes the first `n`
/// waiters in enqueue order.
pub struct Condition<C: WindowAllocator<Rank>> {
    window: Option<C::Window>,
    lock: Lock<C>,
    owns_lock: bool,
}

impl<C: WindowAllocator<Rank>> Condition<C> {
    /// Collectively create a condition variable, allocating and owning a
    /// fresh [`RMutex`] as its associated lock.
    pub fn new(comm: C) -> Result<Self> {
        Self::with_info(comm, WindowInfo::new())
    }

    /// Collectively create a condition variable, allocating and owning a
    /// fresh [`RMutex`] as its associated lock, passing `info` through to
    /// both the lock's and the condition's own window creation.
    pub fn with_info(comm: C, info: WindowInfo) -> Result<Self> {
        let lock = Lock::Recursive(RMutex::with_info(comm.clone(), info.clone())?);
        Self::with_lock_inner(comm, lock, true, info)
    }

    /// Collectively create a condition variable associated with a
    /// caller-supplied [`Mutex`]. The condition does not free it; the
    /// caller remains responsible for that.
    pub fn with_mutex(comm: C, mutex: Mutex<C>) -> Result<Self> {
        Self::with_mutex_info(comm, mutex, WindowInfo::new())
    }

    /// Like [`Condition::with_mutex`], passing `info` through to the
    /// condition's own window creation.
    pub fn with_mutex_info(comm: C, mutex: Mutex<C>, info: WindowInfo) -> Result<Self> {
        Self::with_lock_inner(comm, Lock::Plain(mutex), false, info)
    }

    /// Collectively create a condition variable associated with a
    /// caller-supplied [`RMutex`]. The condition does not free it; the
    /// caller remains responsible for that.
    pub fn with_rmutex(comm: C, rmutex: RMutex<C>) -> Result<Self> {
        Self::with_rmutex_info(comm, rmutex, WindowInfo::new())
    }

    /// Like [`Condition::with_rmutex`], passing `info` through to the
    /// condition's own window creation.
    pub fn with_rmutex_info(comm: C, rmutex: RMutex<C>, info: WindowInfo) -> Result<Self> {
        Self::with_lock_inner(comm, Lock::Recursive(rmutex), false, info)
    }

    fn with_lock_inner(comm: C, lock: Lock<C>, owns_lock: bool, info: WindowInfo) -> Result<Self> {
        let rank = comm.rank();
        let local_slots = if rank == TAIL_RANK { 3 } else { 2 };
        let init = [0, NULL_RANK, NULL_RANK];
        let window = comm.allocate_window(local_slots, &init[..local_slots], &info);
        Ok(Condition { window: Some(window), lock, owns_lock })
    }

    fn window(&self) -> Result<&C::Window> {
        self.window.as_ref().ok_or(Error::AlreadyFreed)
    }

    /// Acquire the associated lock.
    pub fn acquire(&self, blocking: bool) -> Result<bool> {
        self.window()?;
        self.lock.acquire(blocking)
    }

    /// Release the associated lock.
    pub fn release(&self) -> Result<()> {
        self.window()?;
        self.lock.release()
    }

    /// Whether the associated lock is held by this rank.
    pub fn locked(&self) -> bool {
        self.lock.locked()
    }

    fn enqueue(&self, window: &C::Window, process: Rank) {
        window.lock_all();
        let prev = window.fetch_and_op(process, TAIL_RANK, TAIL, Op::Replace);
        window.flush(TAIL_RANK);
        // `next` defaults to `process` itself: when there is no
        // predecessor this marks `process` as the sole queue member (its
        // own successor-sentinel), which `dequeue` relies on to detect
        // list exhaustion.
        let mut next = process;
        if prev != NULL_RANK {
            next = window.fetch_and_op(process, prev as usize, NEXT, Op::Replace);
            window.flush(prev as usize);
        }
        window.accumulate(next, process as usize, NEXT, Op::Replace);
        window.unlock_all();
    }

    fn dequeue(&self, window: &C::Window, max_procs: usize) -> Vec<Rank> {
        let max_procs = max_procs.min(window.group_size());
        let mut processes = Vec::new();

        window.lock_all();
        let prev = window.fetch_and_op(NULL_RANK, TAIL_RANK, TAIL, Op::NoOp);
        window.flush(TAIL_RANK);
        if prev != NULL_RANK {
            let mut next = window.fetch_and_op(NULL_RANK, prev as usize, NEXT, Op::NoOp);
            window.flush(prev as usize);
            let mut empty = false;
            while processes.len() < max_procs && !empty {
                let rank = next;
                processes.push(rank);
                next = window.fetch_and_op(NULL_RANK, rank as usize, NEXT, Op::NoOp);
                window.flush(rank as usize);
                empty = processes[0] == next;
            }
            if !empty {
                window.accumulate(next, prev as usize, NEXT, Op::Replace);
            } else {
                window.accumulate(NULL_RANK, TAIL_RANK, TAIL, Op::Replace);
            }
        }
        window.unlock_all();
        processes
    }

    fn sleep(&self, window: &C::Window) {
        let self_rank = window.group_rank();
        let mut backoff = Backoff::new();
        window.lock_all();
        window.sync();
        while window.local_view(FLAG) == 0 {
            backoff.pulse();
            window.flush(self_rank);
            window.sync();
        }
        window.accumulate(0, self_rank, FLAG, Op::Replace);
        window.unlock_all();
    }

    fn wakeup(&self, window: &C::Window, processes: &[Rank]) {
        window.lock_all();
        for &rank in processes {
            window.accumulate(1, rank as usize, FLAG, Op::Replace);
        }
        window.unlock_all();
    }

    /// Wait to be notified. The caller must hold the associated lock. On
    /// return the lock is held again (recursion depth restored, if using
    /// an [`RMutex`]).
    pub fn wait(&self) -> Result<bool> {
        let window = self.window()?;
        if !self.locked() {
            return Err(Error::NotHeld);
        }
        let self_rank = window.group_rank() as Rank;
        self.enqueue(window, self_rank);
        let state = self.lock.release_save()?;
        self.sleep(window);
        self.lock.acquire_restore(state)?;
        log::debug!("condition: rank {self_rank} woke from wait()");
        Ok(true)
    }

    /// Wait until `predicate` returns `true`, re-checking it after every
    /// wakeup (spurious wakeups are not generated by this design, but the
    /// re-check keeps callers robust regardless).
    pub fn wait_for(&self, mut predicate: impl FnMut() -> bool) -> Result<bool> {
        while !predicate() {
            self.wait()?;
        }
        Ok(true)
    }

    /// Wake up to `n` waiters, in FIFO enqueue order. The caller must hold
    /// the associated lock. Returns the number actually woken.
    pub fn notify(&self, n: u32) -> Result<u32> {
        let window = self.window()?;
        if !self.locked() {
            return Err(Error::NotHeld);
        }
        let processes = self.dequeue(window, n as usize);
        let woken = processes.len() as u32;
        self.wakeup(window, &processes);
        log::debug!("condition: notify({n}) woke {woken}");
        Ok(woken)
    }

    /// Wake every waiting rank. Returns the number actually woken.
    pub fn notify_all(&self) -> Result<u32> {
        self.notify((1u32 << 31) - 1)
    }

    /// Release the associated lock if locally held, free it if this
    /// condition allocated it, and free the window.
    pub fn free(&mut self) -> Result<()> {
        if self.window.is_some() {
            self.lock.reset_if_locked()?;
            if self.owns_lock {
                self.lock.free()?;
            }
            if let Some(window) = self.window.take() {
                window.free();
            }
        }
        Ok(())
    }

    /// Block until the associated lock is held, returning a guard that
    /// releases it on drop -- scoped entry/exit, so a panic or early return
    /// out of the critical section can't leak the lock.
    pub fn lock(&self) -> Result<ConditionGuard<'_, C>> {
        self.acquire(true)?;
        Ok(ConditionGuard { cond: self })
    }

    /// Run `f` while holding the associated lock, releasing it when `f`
    /// returns or unwinds.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        let _guard = self.lock()?;
        Ok(f())
    }
}

/// RAII guard returned by [`Condition::lock`]: releases the associated lock
/// on drop.
pub struct ConditionGuard<'a, C: WindowAllocator<Rank>> {
    cond: &'a Condition<C>,
}

impl<'a, C: WindowAllocator<Rank>> Drop for ConditionGuard<'a, C> {
    fn drop(&mut self) {
        let _ = self.cond.release();
    }
}

#[cfg(all(test, feature = "std"))]
mod test {
    use super::*;
    use crate::local::LocalCommunicator;
    use crate::rma::Communicator;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn dequeue_zero_returns_empty_without_mutating() {
        let comms = LocalCommunicator::group(2);
        let (c0, c1) = (comms[0].clone(), comms[1].clone());
        let handles =
            vec![thread::spawn(move || Condition::new(c0).unwrap()), thread::spawn(move || Condition::new(c1).unwrap())];
        let mut conditions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let cond = conditions.remove(0);
        cond.acquire(true).unwrap();
        let window = cond.window().unwrap();
        assert!(cond.dequeue(window, 0).is_empty());
        cond.release().unwrap();
    }

    #[test]
    fn producer_consumer_four_ranks() {
        let comms = LocalCommunicator::group(4);
        let notified = Arc::new(AtomicU32::new(0));
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let notified = notified.clone();
                thread::spawn(move || {
                    let rank = comm.rank();
                    let cond = Condition::new(comm).unwrap();
                    if rank == 0 {
                        // Wait until exactly two ranks have enqueued before
                        // calling notify(2), so the result is deterministic.
                        loop {
                            cond.acquire(true).unwrap();
                            let len = queue_len(&cond);
                            if len >= 2 {
                                let n = cond.notify(2).unwrap();
                                assert_eq!(n, 2);
                                cond.release().unwrap();
                                break;
                            }
                            cond.release().unwrap();
                        }
                        // Then wait for the third waiter and wake it too.
                        loop {
                            cond.acquire(true).unwrap();
                            if queue_len(&cond) >= 1 {
                                let n = cond.notify_all().unwrap();
                                cond.release().unwrap();
                                break n;
                            }
                            cond.release().unwrap();
                        }
                    } else {
                        cond.acquire(true).unwrap();
                        cond.wait().unwrap();
                        cond.release().unwrap();
                        notified.fetch_add(1, Ordering::SeqCst);
                        1
                    }
                })
            })
            .collect();
        let results: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // rank 0's two notify calls plus the three waiters sum to 3 wakeups.
        assert_eq!(results[0] + results[1] + results[2] + results[3], 4);
        assert_eq!(notified.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn free_force_resets_an_externally_owned_recursive_lock() {
        let comm = LocalCommunicator::group(1).remove(0);
        let rmutex = RMutex::new(comm.clone()).unwrap();
        rmutex.acquire(true).unwrap();
        rmutex.acquire(true).unwrap();
        rmutex.acquire(true).unwrap();
        assert_eq!(rmutex.count(), 3);

        let mut cond = Condition::with_rmutex(comm, rmutex).unwrap();
        assert!(cond.locked());
        cond.free().unwrap();
        // A single `release()` would only have dropped the count to 2,
        // leaving the lock held; `free()` must force it all the way to 0.
        assert!(!cond.locked());
    }

    /// Non-destructive queue-length peek: identical to [`Condition::dequeue`]'s
    /// read-only walk, without the trailing accumulate that actually
    /// dequeues. Test-only; not part of the public API.
    fn queue_len<C: WindowAllocator<Rank>>(cond: &Condition<C>) -> usize {
        let window = cond.window().unwrap();
        window.lock_all();
        let prev = window.fetch_and_op(NULL_RANK, TAIL_RANK, TAIL, Op::NoOp);
        window.flush(TAIL_RANK);
        let mut count = 0;
        if prev != NULL_RANK {
            let mut next = window.fetch_and_op(NULL_RANK, prev as usize, NEXT, Op::NoOp);
            window.flush(prev as usize);
            let first = next;
            loop {
                count += 1;
                next = window.fetch_and_op(NULL_RANK, next as usize, NEXT, Op::NoOp);
                window.flush(next as usize);
                if next == first {
                    break;
                }
            }
        }
        window.unlock_all();
        count
    }
}
