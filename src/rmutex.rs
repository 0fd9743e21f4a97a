//! A recursive wrapper over [`Mutex`]: the same rank may acquire it more
//! than once, as long as it releases the same number of times.

use crate::error::{Error, Result};
use crate::mutex::Mutex;
use crate::rma::{Rank, WindowAllocator, WindowInfo};

/// A recursive mutex: `count() > 0` if and only if the local rank holds
/// the underlying [`Mutex`]. `count()` never goes negative.
pub struct RMutex<C: WindowAllocator<Rank>> {
    inner: Mutex<C>,
    count: core::cell::Cell<u32>,
}

impl<C: WindowAllocator<Rank>> RMutex<C> {
    /// Collectively create a recursive mutex in an unlocked state.
    pub fn new(comm: C) -> Result<Self> {
        Self::with_info(comm, WindowInfo::new())
    }

    /// Collectively create a recursive mutex in an unlocked state, passing
    /// `info` through to the underlying window's runtime context creation.
    pub fn with_info(comm: C, info: WindowInfo) -> Result<Self> {
        Ok(RMutex { inner: Mutex::with_info(comm, info)?, count: core::cell::Cell::new(0) })
    }

    /// Wrap an already-constructed [`Mutex`] instead of allocating a new
    /// window. Used by [`crate::condition::Condition::with_lock`] when the
    /// caller wants a recursive lock built from a mutex it already owns.
    pub fn from_mutex(inner: Mutex<C>) -> Self {
        RMutex { inner, count: core::cell::Cell::new(0) }
    }

    /// Acquire the lock, blocking or non-blocking. If already held by this
    /// rank, just increments the recursion count and returns `Ok(true)`.
    pub fn acquire(&self, blocking: bool) -> Result<bool> {
        if self.inner.locked() {
            self.count.set(self.count.get() + 1);
            return Ok(true);
        }
        let locked = self.acquire_underlying(blocking)?;
        if locked {
            self.count.set(1);
        }
        Ok(locked)
    }

    fn acquire_underlying(&self, blocking: bool) -> Result<bool> {
        // The underlying `Mutex::acquire` raises `AlreadyHeld` when the
        // local rank already holds it, but we have just proven above that
        // it does not, so that branch of its error surface cannot fire
        // here.
        self.inner.acquire(blocking)
    }

    /// Release one level of recursion. Fails with [`Error::NotHeld`] if
    /// not currently held by this rank. Releases the underlying mutex only
    /// once the recursion count reaches zero.
    pub fn release(&self) -> Result<()> {
        if !self.inner.locked() {
            return Err(Error::NotHeld);
        }
        let count = self.count.get() - 1;
        self.count.set(count);
        if count == 0 {
            self.inner.release()?;
        }
        Ok(())
    }

    /// Whether the underlying mutex is held by this rank.
    pub fn locked(&self) -> bool {
        self.inner.locked()
    }

    /// Current recursion depth; `0` when not held by this rank.
    pub fn count(&self) -> u32 {
        self.count.get()
    }

    /// Free the underlying mutex and reset the recursion count.
    pub fn free(&mut self) -> Result<()> {
        self.inner.free()?;
        self.count.set(0);
        Ok(())
    }

    /// Save and zero the recursion depth, then release the underlying
    /// mutex. Used by [`crate::condition::Condition::wait`] to preserve
    /// recursion semantics across a sleep.
    pub(crate) fn release_save(&self) -> Result<u32> {
        let state = self.count.get();
        self.count.set(0);
        self.inner.release()?;
        Ok(state)
    }

    /// Re-acquire the underlying mutex and restore a previously saved
    /// recursion depth.
    pub(crate) fn acquire_restore(&self, state: u32) -> Result<()> {
        self.inner.acquire(true)?;
        self.count.set(state);
        Ok(())
    }

    /// Force this rank's hold on the lock to zero, regardless of recursion
    /// depth: zero the count, then release the underlying mutex once if
    /// still held. Used by [`crate::condition::Condition::free`] to forcibly
    /// drop this rank's hold on a lock at teardown, matching
    /// `_lock_reset` behavior: a single underlying `release` clears the
    /// window-level lock outright, since nested `acquire`s never touch the
    /// underlying mutex past the first.
    pub(crate) fn reset(&self) -> Result<()> {
        self.count.set(0);
        if self.inner.locked() {
            self.inner.release()?;
        }
        Ok(())
    }

    /// Block until the lock is held, returning a guard that releases one
    /// level of recursion on drop -- scoped entry/exit, so a panic or early
    /// return out of the critical section can't leak the lock.
    pub fn lock(&self) -> Result<RMutexGuard<'_, C>> {
        self.acquire(true)?;
        Ok(RMutexGuard { rmutex: self })
    }

    /// Run `f` while holding the lock, releasing one level of recursion
    /// when `f` returns or unwinds.
    pub fn scope<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        let _guard = self.lock()?;
        Ok(f())
    }
}

/// RAII guard returned by [`RMutex::lock`]: releases one level of
/// recursion on drop.
pub struct RMutexGuard<'a, C: WindowAllocator<Rank>> {
    rmutex: &'a RMutex<C>,
}

impl<'a, C: WindowAllocator<Rank>> Drop for RMutexGuard<'a, C> {
    fn drop(&mut self) {
        let _ = self.rmutex.release();
    }
}

#[cfg(all(test, feature = "std"))]
mod test {
    use super::*;
    use crate::local::LocalCommunicator;

    #[test]
    fn nested_acquire_release_tracks_count() {
        let comm = LocalCommunicator::group(1).remove(0);
        let rmutex = RMutex::new(comm).unwrap();

        assert!(rmutex.acquire(true).unwrap());
        assert!(rmutex.acquire(true).unwrap());
        assert!(rmutex.acquire(true).unwrap());
        assert_eq!(rmutex.count(), 3);
        assert!(rmutex.locked());

        rmutex.release().unwrap();
        rmutex.release().unwrap();
        assert_eq!(rmutex.count(), 1);
        assert!(rmutex.locked());

        rmutex.release().unwrap();
        assert_eq!(rmutex.count(), 0);
        assert!(!rmutex.locked());

        assert_eq!(rmutex.release(), Err(Error::NotHeld));
    }
}
