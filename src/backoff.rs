//! Exponential-backoff delay sequence used by every RMA spin loop.

use core::time::Duration;

/// Maximum delay between spin-loop polls.
pub const DELAY_MAX: Duration = Duration::from_nanos(1_000_000_000 / 1024);
/// Minimum delay once backoff has kicked in.
pub const DELAY_MIN: Duration = Duration::from_nanos(DELAY_MAX.as_nanos() as u64 / 1024);
/// Delay before the first pulse.
pub const DELAY_INIT: Duration = Duration::from_nanos(0);
/// Growth factor applied to the delay after every pulse.
pub const RATIO: u32 = 2;

/// An unbounded, lazily-growing sequence of sleep pulses.
///
/// A fresh `Backoff` is created per spin-loop instance (it is restartable
/// across spin loops but never shared between two concurrent ones -- each
/// loop needs its own independent delay state). Calling [`Backoff::pulse`]
/// sleeps for the current delay, then grows it by [`RATIO`], clamped to
/// `[DELAY_MIN, DELAY_MAX]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
}

impl Backoff {
    /// Create a new backoff generator, starting at [`DELAY_INIT`].
    pub const fn new() -> Self {
        Backoff { delay: DELAY_INIT }
    }

    /// Sleep for the current delay, then advance it. Without the `std`
    /// feature there is no portable sleep primitive to call, so this
    /// degrades to a CPU spin-loop hint, matching how the teacher crate's
    /// own `pause()` falls back to `core::hint::spin_loop` under `no_std`.
    pub fn pulse(&mut self) {
        #[cfg(feature = "std")]
        {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
        }
        #[cfg(not(feature = "std"))]
        {
            core::hint::spin_loop();
        }
        self.advance();
    }

    /// Advance the delay without sleeping; exposed so `no_std` callers can
    /// drive their own sleep primitive from [`Backoff::delay`].
    pub fn advance(&mut self) {
        let grown = self.delay * RATIO;
        self.delay = grown.clamp(DELAY_MIN, DELAY_MAX);
    }

    /// The delay that the next [`Backoff::pulse`] would sleep for.
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
