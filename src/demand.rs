//! Demand bookkeeping for the demand-driven arity.
//!
//! A consumer may request values before the upstream handle exists, for
//! example from inside its own `on_subscribe`. [`BackpressureAccumulator`]
//! holds that demand and flushes it, in one request, once the handle is
//! armed. Amounts saturate at [`UNBOUNDED`]; they never wrap.
//!
//! [`DemandPolicy`] is the seam between the arities: only
//! [`Backpressure`] does anything, every other arity uses [`NoDemand`].

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Error;
use crate::handle::{Handle, HandleSlot};
use crate::plugins;
use crate::tracing_compat::trace;

/// Demand value meaning "no limit".
pub const UNBOUNDED: u64 = u64::MAX;

/// Pending demand not yet forwarded to a handle.
#[derive(Debug, Default)]
pub struct BackpressureAccumulator {
    pending: AtomicU64,
}

impl BackpressureAccumulator {
    /// Creates an accumulator with no pending demand.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: AtomicU64::new(0),
        }
    }

    /// Adds `amount` to the pending demand, saturating at [`UNBOUNDED`].
    ///
    /// A zero amount is a protocol violation: it is reported and ignored.
    pub fn add(&self, amount: u64) {
        if amount == 0 {
            plugins::report(Error::protocol_violation(
                "demand must be positive, got request(0)",
            ));
            return;
        }
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return;
            }
            let next = current.saturating_add(amount);
            match self.pending.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Zeroes the pending demand and forwards it to `handle` if non-zero.
    ///
    /// Returns the amount forwarded.
    pub fn drain_and_request(&self, handle: &Handle) -> u64 {
        let amount = self.pending.swap(0, Ordering::AcqRel);
        if amount != 0 {
            trace!(amount, "flushing accumulated demand");
            handle.request(amount);
        }
        amount
    }

    /// Currently pending demand.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }
}

/// How an arity treats `request(n)` from its consumer.
pub trait DemandPolicy: Default + Send + Sync + 'static {
    /// Handles a consumer request against the upstream slot.
    fn request(&self, upstream: &HandleSlot, amount: u64);

    /// Called right after the upstream handle is armed.
    fn on_armed(&self, handle: &Handle);
}

/// Demand is meaningless for this arity; requests are ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDemand;

impl DemandPolicy for NoDemand {
    fn request(&self, _upstream: &HandleSlot, _amount: u64) {}

    fn on_armed(&self, _handle: &Handle) {}
}

/// Accumulate until armed, then pass requests straight through.
#[derive(Debug, Default)]
pub struct Backpressure {
    accumulator: BackpressureAccumulator,
}

impl Backpressure {
    /// Demand accumulated before the handle was armed.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.accumulator.pending()
    }
}

impl DemandPolicy for Backpressure {
    fn request(&self, upstream: &HandleSlot, amount: u64) {
        if amount == 0 {
            plugins::report(Error::protocol_violation(
                "demand must be positive, got request(0)",
            ));
            return;
        }
        // Armed or terminated: forward directly (the sentinel ignores it).
        if let Some(handle) = upstream.current() {
            handle.request(amount);
            return;
        }
        self.accumulator.add(amount);
        // The handle may have been armed after the check above, in which
        // case its flush could have run before our add.
        if let Some(handle) = upstream.current() {
            self.accumulator.drain_and_request(&handle);
        }
    }

    fn on_armed(&self, handle: &Handle) {
        self.accumulator.drain_and_request(handle);
    }
}
