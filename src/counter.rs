//! Distributed fetch-and-add counter homed at a chosen root rank.

use crate::error::{Error, Result};
use crate::rma::{Element, Op, Window, WindowAllocator, WindowInfo};

/// Construction options for a [`Counter`].
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CounterConfig<T> {
    /// Initial value, observed by the first `next()` call across the group.
    pub start: T,
    /// Default increment used when `next(None)` is called.
    pub step: T,
    /// Rank whose window segment homes the counter's single slot.
    pub root: usize,
    /// Passed through to the window's runtime context creation.
    pub info: WindowInfo,
}

impl<T: Element> Default for CounterConfig<T> {
    fn default() -> Self {
        CounterConfig { start: T::zero(), step: T::one(), root: 0, info: WindowInfo::new() }
    }
}

/// A counter whose value is shared across the group: every call to
/// [`Counter::next`] atomically fetches the current value and adds an
/// increment, returning the pre-increment value. Observed values across
/// all ranks are totally ordered by the runtime's atomic accumulate
/// ordering, with no duplicates.
pub struct Counter<C: WindowAllocator<T>, T: Element> {
    window: Option<C::Window>,
    step: T,
    location: (usize, usize),
}

impl<C: WindowAllocator<T>, T: Element> Counter<C, T> {
    /// Collectively create a counter: every rank in `comm`'s group must
    /// call this, in the same order relative to any other primitive they
    /// jointly create.
    pub fn new(comm: C, config: CounterConfig<T>) -> Result<Self> {
        let rank = comm.rank();
        let local_slots = if rank == config.root { 1 } else { 0 };
        let init = if local_slots == 1 { [config.start] } else { [T::zero()] };
        let window = comm.allocate_window(local_slots, &init[..local_slots], &config.info);
        Ok(Counter { window: Some(window), step: config.step, location: (config.root, 0) })
    }

    /// Return the current value and atomically add `incr` (or the
    /// configured default step, if `incr` is `None`).
    pub fn next(&self, incr: Option<T>) -> Result<T> {
        let window = self.window.as_ref().ok_or(Error::AlreadyFreed)?;
        let (root, disp) = self.location;
        let incr = incr.unwrap_or(self.step);

        window.lock_shared(root);
        let prev = window.fetch_and_op(incr, root, disp, Op::Sum);
        window.unlock(root);
        log::trace!("counter: fetch_and_op(SUM, {incr:?}) at root {root} -> prev={prev:?}");
        Ok(prev)
    }

    /// Free the counter's window. Subsequent operations raise
    /// [`Error::AlreadyFreed`].
    pub fn free(&mut self) -> Result<()> {
        if let Some(window) = self.window.take() {
            window.free();
        }
        Ok(())
    }
}

impl<C: WindowAllocator<T>, T: Element> Iterator for Counter<C, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        Counter::next(self, None).ok()
    }
}
