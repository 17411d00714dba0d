//! Cancellation handles and the lock-free slot that owns them.
//!
//! A [`Handle`] is the capability to release whatever a subscription holds.
//! Every coordinator keeps its handles in [`HandleSlot`]s. A slot moves
//! through `EMPTY -> ARMING -> ARMED -> TERMINATED` (or jumps straight to
//! `TERMINATED`); `TERMINATED` is absorbing. Once terminated, the slot
//! reports the process-wide [`terminated()`] sentinel and any handle that
//! arrives later is cancelled on the spot.
//!
//! # Invariants
//!
//! - A handle stored in a slot is cancelled at most once by the slot.
//! - A handle offered to a terminated slot is cancelled before `set_once`
//!   returns, so no handle is ever observable as live after termination.
//! - Exactly one caller of [`HandleSlot::terminate`] observes `true`.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::Error;
use crate::plugins;
use crate::tracing_compat::trace;

/// A resource-release capability.
pub trait Cancellable: Send + Sync {
    /// Releases the underlying resource. Idempotent.
    fn cancel(&self);

    /// Returns true once [`cancel`](Self::cancel) has run.
    fn is_cancelled(&self) -> bool;

    /// Signals demand for `n` more values.
    ///
    /// Only demand-driven sources act on this; everything else ignores it.
    fn request(&self, n: u64) {
        let _ = n;
    }
}

/// Shared, type-erased cancellation handle.
pub type Handle = Arc<dyn Cancellable>;

/// The "permanently cancelled" handle.
struct TerminatedHandle;

impl Cancellable for TerminatedHandle {
    fn cancel(&self) {}

    fn is_cancelled(&self) -> bool {
        true
    }
}

fn sentinel() -> &'static Handle {
    static TERMINATED: OnceLock<Handle> = OnceLock::new();
    TERMINATED.get_or_init(|| Arc::new(TerminatedHandle))
}

/// Returns the process-wide terminated sentinel.
///
/// Cancelling it is a no-op. Compare with [`is_terminated`], never
/// structurally.
#[must_use]
pub fn terminated() -> Handle {
    Arc::clone(sentinel())
}

/// Returns true if `handle` is the terminated sentinel (identity check).
#[must_use]
pub fn is_terminated(handle: &Handle) -> bool {
    same_handle(handle, sentinel())
}

/// Address identity, ignoring trait-object metadata.
#[must_use]
pub fn same_handle(a: &Handle, b: &Handle) -> bool {
    Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>()
}

/// A handle that runs a release action exactly once.
pub struct ActionHandle {
    cancelled: AtomicBool,
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ActionHandle {
    /// Wraps `action` so that it runs on the first `cancel()`.
    #[must_use]
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    /// Same as [`new`](Self::new), already erased into a [`Handle`].
    #[must_use]
    pub fn handle(action: impl FnOnce() + Send + 'static) -> Handle {
        Arc::new(Self::new(action))
    }
}

impl Cancellable for ActionHandle {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let action = self.action.lock().take();
        if let Some(action) = action {
            action();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ActionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A handle with nothing to release; it only remembers being cancelled.
#[derive(Debug, Default)]
pub struct FlagHandle {
    cancelled: AtomicBool,
}

impl FlagHandle {
    /// Creates an uncancelled flag.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
        }
    }
}

impl Cancellable for FlagHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

const EMPTY: u8 = 0;
const ARMING: u8 = 1;
const ARMED: u8 = 2;
const TERMINATED: u8 = 3;

/// Write-once cell for a [`Handle`] with an absorbing terminated state.
///
/// The state word is the only thing raced on. The handle cell is written by
/// the thread that won `EMPTY -> ARMING` and emptied by whichever thread
/// moves the slot to `TERMINATED`, so a terminated slot keeps nothing alive.
pub struct HandleSlot {
    state: AtomicU8,
    handle: Mutex<Option<Handle>>,
}

impl HandleSlot {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            handle: Mutex::new(None),
        }
    }

    /// Stores `handle` if the slot is empty.
    ///
    /// Returns `true` if the handle is now live in the slot. Otherwise the
    /// handle has already been cancelled. A slot that already held a live
    /// handle means the caller was subscribed twice; that is reported to the
    /// error sink as a protocol violation naming `owner`.
    pub fn set_once(&self, handle: Handle, owner: &str) -> bool {
        match self
            .state
            .compare_exchange(EMPTY, ARMING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                *self.handle.lock() = Some(handle);
                if self
                    .state
                    .compare_exchange(ARMING, ARMED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    trace!(owner, "handle armed");
                    return true;
                }
                // Terminated while arming; the terminating thread left the
                // cancel to us.
                if let Some(handle) = self.take() {
                    handle.cancel();
                }
                trace!(owner, "handle arrived during termination, cancelled");
                false
            }
            Err(TERMINATED) => {
                handle.cancel();
                trace!(owner, "handle arrived after termination, cancelled");
                false
            }
            Err(_) => {
                handle.cancel();
                plugins::report(Error::subscribed_twice(owner));
                false
            }
        }
    }

    /// Installs the sentinel and cancels the handle it replaced.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn terminate(&self) -> bool {
        match self.state.swap(TERMINATED, Ordering::AcqRel) {
            TERMINATED => false,
            ARMED => {
                if let Some(handle) = self.take() {
                    handle.cancel();
                }
                true
            }
            // EMPTY has nothing to cancel; ARMING is finished by the arming
            // thread once its ARMING -> ARMED exchange fails.
            _ => true,
        }
    }

    /// Installs the sentinel without cancelling the current handle.
    ///
    /// Used when the resource behind the handle has already terminated on
    /// its own. The handle is still released. Returns `true` only for the
    /// call that performed the transition.
    pub fn mark_terminated(&self) -> bool {
        match self.state.swap(TERMINATED, Ordering::AcqRel) {
            TERMINATED => false,
            ARMED => {
                drop(self.take());
                true
            }
            _ => true,
        }
    }

    /// Returns true once the slot holds the sentinel.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state.load(Ordering::Acquire) == TERMINATED
    }

    /// Returns true if a live handle is armed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.state.load(Ordering::Acquire) == ARMED
    }

    /// Current contents: `None` while empty (or mid-arming), the live handle
    /// once armed, the sentinel once terminated.
    #[must_use]
    pub fn current(&self) -> Option<Handle> {
        match self.state.load(Ordering::Acquire) {
            // An armed slot with an empty cell was terminated in between.
            ARMED => Some(self.handle.lock().clone().unwrap_or_else(terminated)),
            TERMINATED => Some(terminated()),
            _ => None,
        }
    }

    fn take(&self) -> Option<Handle> {
        self.handle.lock().take()
    }
}

impl Default for HandleSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HandleSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Acquire) {
            EMPTY => "empty",
            ARMING => "arming",
            ARMED => "armed",
            _ => "terminated",
        };
        f.debug_struct("HandleSlot").field("state", &state).finish()
    }
}
