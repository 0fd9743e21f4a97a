//! The runtime boundary this crate consumes but does not implement for real
//! transports: a communicator over a fixed group of peer ranks, and
//! one-sided RMA windows over it.
//!
//! Everything in this module is an abstract collaborator. The only concrete
//! implementation shipped here is [`crate::local`], an in-process
//! thread-backed transport used for testing and demonstration; a production
//! deployment would bind these traits to a real one-sided-RMA runtime
//! without changing any of the primitives in this crate.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Debug;

/// A rank identifier, as stored in an RMA slot.
///
/// Slots are fixed-width integers (`spec.md` calls them "same-sized integer
/// slots"); `i64` comfortably holds any realistic group size while leaving
/// room for the [`NULL_RANK`] sentinel.
pub type Rank = i64;

/// Sentinel rank, distinct from any valid rank (valid ranks are `>= 0`).
pub const NULL_RANK: Rank = -1;

/// The atomic reduction applied by an `Accumulate`/`Fetch_and_op`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    /// Overwrite the target slot with the operand.
    Replace,
    /// Add the operand to the target slot.
    Sum,
    /// Read without modifying.
    NoOp,
}

/// A fixed-width integer type that can live in an RMA slot.
///
/// Implemented for the signed and unsigned machine integer types so that
/// [`crate::counter::Counter`] can be instantiated with whichever typecode
/// a caller's value domain needs.
pub trait Element: Copy + PartialEq + Send + Sync + Debug + 'static {
    /// The additive identity.
    fn zero() -> Self;
    /// The multiplicative unit, used only to build a default increment of
    /// `1` for [`crate::counter::CounterConfig`].
    fn one() -> Self;
    /// Wrapping addition, matching the semantics of a `SUM` accumulate.
    fn wrapping_add(self, rhs: Self) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Element for $ty {
                #[inline]
                fn zero() -> Self {
                    0
                }

                #[inline]
                fn one() -> Self {
                    1
                }

                #[inline]
                fn wrapping_add(self, rhs: Self) -> Self {
                    <$ty>::wrapping_add(self, rhs)
                }
            }
        )*
    };
}

impl_element!(i32, i64, isize, u32, u64, usize);

/// Runtime window-creation hints, passed through to [`WindowAllocator`]
/// unchanged: a flat set of key/value hints the underlying RMA runtime may
/// use or ignore when creating a window's context (e.g. "no locks other
/// than this process will ever touch the window", allocation placement,
/// or transport-specific knobs). Mirrors an MPI `Info` object; an empty
/// `WindowInfo` (the default) is equivalent to `MPI_INFO_NULL` and every
/// runtime must accept it. [`crate::local`]'s in-process transport has no
/// real RMA context to configure, so it accepts any `WindowInfo` and
/// ignores its contents.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct WindowInfo {
    hints: Vec<(String, String)>,
}

impl WindowInfo {
    /// An empty hint set, equivalent to `MPI_INFO_NULL`.
    pub fn new() -> Self {
        WindowInfo::default()
    }

    /// Add a key/value hint, builder-style.
    pub fn with_hint(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.hints.push((key.into(), value.into()));
        self
    }

    /// The hints set so far, in insertion order.
    pub fn hints(&self) -> &[(String, String)] {
        &self.hints
    }
}

/// A fixed group of peer processes and the point-to-point primitives the
/// sequential section needs.
///
/// Window allocation is a separate capability, expressed by
/// [`WindowAllocator`], because a single communicator backs windows over
/// more than one [`Element`] type (`Rank`-typed windows for the mutex and
/// condition queues, a caller-chosen type for the counter).
pub trait Communicator: Clone + Send + Sync + 'static {
    /// Number of ranks in the group.
    fn size(&self) -> usize;
    /// This process's rank within the group, in `0..size()`.
    fn rank(&self) -> usize;
    /// Block until every rank in the group has called `barrier`.
    fn barrier(&self);
    /// Send a zero-byte message to `dest` tagged `tag`.
    fn send_empty(&self, dest: usize, tag: i32) -> crate::error::Result<()>;
    /// Block until a zero-byte message tagged `tag` arrives from `source`.
    fn recv_empty(&self, source: usize, tag: i32) -> crate::error::Result<()>;
}

/// A one-sided RMA window: a per-rank array of `T`-typed slots, addressable
/// from any rank via atomic `Accumulate`/`Fetch_and_op`/`Compare_and_swap`.
///
/// Every operation that mutates or observes a remote rank's slots must be
/// issued between [`Window::lock_all`] and [`Window::unlock_all`] (or the
/// single-rank [`Window::lock_shared`]/[`Window::unlock`] pair used only
/// during collective initialization). [`Window::flush`] forces completion
/// of outstanding RMA against a given rank; [`Window::sync`] makes
/// RMA-updated local memory visible to subsequent ordinary loads via
/// [`Window::local_view`].
pub trait Window<T: Element>: Send + Sync {
    /// This process's rank, as seen by the window (equals the owning
    /// communicator's rank).
    fn group_rank(&self) -> usize;
    /// Group size, as seen by the window.
    fn group_size(&self) -> usize;

    /// Open a single-rank passive-target epoch against `rank`.
    fn lock_shared(&self, rank: usize);
    /// Close the epoch opened by `lock_shared`.
    fn unlock(&self, rank: usize);
    /// Open a passive-target epoch against every rank in the group.
    fn lock_all(&self);
    /// Close the epoch opened by `lock_all`.
    fn unlock_all(&self);
    /// Force completion of outstanding RMA operations against `rank`.
    fn flush(&self, rank: usize);
    /// Make remote RMA updates to the local segment visible to
    /// [`Window::local_view`].
    fn sync(&self);

    /// Atomically apply `op` with operand `value` to the slot at
    /// `(rank, disp)`, discarding the prior value.
    fn accumulate(&self, value: T, rank: usize, disp: usize, op: Op);
    /// Atomically apply `op` with operand `value` to the slot at
    /// `(rank, disp)`, returning the prior value.
    fn fetch_and_op(&self, value: T, rank: usize, disp: usize, op: Op) -> T;
    /// Atomically replace the slot at `(rank, disp)` with `new` iff its
    /// current value equals `expected`; returns the prior value either way.
    fn compare_and_swap(&self, new: T, expected: T, rank: usize, disp: usize) -> T;
    /// Read the local segment's slot at `disp` directly (no RMA). Valid
    /// only inside a `lock_all`/`unlock_all` epoch, after a `sync` call.
    fn local_view(&self, disp: usize) -> T;

    /// Collectively free the window. Callers must ensure no rank is
    /// mid-operation on it.
    fn free(self);
}

/// Capability to allocate a [`Window<T>`] collectively over a communicator.
///
/// Split out from [`Communicator`] itself (rather than a single associated
/// type) because one communicator backs windows over several distinct
/// [`Element`] types within the same process group.
pub trait WindowAllocator<T: Element>: Communicator {
    /// The window type this allocator produces.
    type Window: Window<T>;

    /// Collectively allocate a window with `local_slots` slots on this rank
    /// (may be zero, e.g. non-root ranks of a [`crate::counter::Counter`]).
    /// `init` is written into this rank's own slots before the allocator
    /// returns, via the same initialization protocol `spec.md` specifies:
    /// `Lock(rank, SHARED)`, `Accumulate(REPLACE)`, `Unlock(rank)`, then a
    /// collective `barrier`. `info` is passed through to the runtime's
    /// window-context creation, as-is and uninterpreted by this crate.
    fn allocate_window(&self, local_slots: usize, init: &[T], info: &WindowInfo) -> Self::Window;
}
