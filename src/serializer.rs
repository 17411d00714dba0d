//! Half-serialized delivery to a downstream observer.
//!
//! Upstream sources are expected to call `on_next` serially, but terminal
//! events may arrive from anywhere: the source, the scope, or a racing
//! thread. [`DeliverySerializer`] makes those calls safe:
//!
//! - at most one thread is inside a delivery call at a time;
//! - a terminal racing with a value is parked and delivered by the thread
//!   holding the turn, after the value it is delivering;
//! - after a terminal has been delivered, everything else is dropped.
//!
//! The turn is a work-in-progress counter: `0` means idle, and every
//! terminal attempt bumps it so the current holder notices on release.
//!
//! Terminal callbacks run under `catch_unwind`. A panic while handling an
//! error is combined with that error into an `AggregateDelivery` error; a
//! panic while handling completion is wrapped on its own. Both go to the
//! error sink, never back to the consumer.

use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Error;
use crate::observer::Observer;
use crate::plugins;
use crate::tracing_compat::trace;

#[derive(Debug)]
enum Terminal {
    Error(Error),
    Complete,
}

#[derive(Debug)]
enum TerminalCell {
    /// No terminal seen yet.
    Open,
    /// The first terminal, parked until the turn is free.
    Pending(Terminal),
    /// The terminal was taken for delivery.
    Closed,
}

/// Serializes deliveries to one downstream observer.
#[derive(Debug)]
pub struct DeliverySerializer {
    wip: AtomicUsize,
    terminal: Mutex<TerminalCell>,
}

impl DeliverySerializer {
    /// Creates an idle serializer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            wip: AtomicUsize::new(0),
            terminal: Mutex::new(TerminalCell::Open),
        }
    }

    /// Delivers `value` if no other delivery is in progress.
    ///
    /// Returns `true` if a terminal event parked during the delivery was
    /// drained by this call, i.e. the observer is now terminated.
    pub fn deliver_value<T>(&self, observer: &dyn Observer<T>, value: T) -> bool {
        if self.wip.load(Ordering::Acquire) != 0
            || self
                .wip
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return false;
        }
        observer.on_next(value);
        if self.wip.fetch_sub(1, Ordering::AcqRel) != 1 {
            self.drain_terminal(observer);
            return true;
        }
        false
    }

    /// Delivers (or parks) an error terminal.
    ///
    /// Returns `true` if this call delivered the terminal itself. An error
    /// that loses to an earlier terminal goes to the error sink.
    pub fn deliver_error<T>(&self, observer: &dyn Observer<T>, error: Error) -> bool {
        if let Err(Terminal::Error(error)) = self.park(Terminal::Error(error)) {
            trace!(error = %error, "terminal already pending, reporting error");
            plugins::report(error);
            return false;
        }
        if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
            self.drain_terminal(observer);
            return true;
        }
        false
    }

    /// Delivers (or parks) a completion terminal.
    ///
    /// Returns `true` if this call delivered the terminal itself. A
    /// completion that loses to an earlier terminal is dropped.
    pub fn deliver_complete<T>(&self, observer: &dyn Observer<T>) -> bool {
        if self.park(Terminal::Complete).is_err() {
            trace!("terminal already pending, completion dropped");
            return false;
        }
        if self.wip.fetch_add(1, Ordering::AcqRel) == 0 {
            self.drain_terminal(observer);
            return true;
        }
        false
    }

    /// Claims the terminal cell. Hands `terminal` back if another one got
    /// there first.
    fn park(&self, terminal: Terminal) -> Result<(), Terminal> {
        let mut cell = self.terminal.lock();
        if matches!(*cell, TerminalCell::Open) {
            *cell = TerminalCell::Pending(terminal);
            Ok(())
        } else {
            Err(terminal)
        }
    }

    /// Returns true once a terminal has been handed to the observer.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        matches!(*self.terminal.lock(), TerminalCell::Closed)
    }

    fn drain_terminal<T>(&self, observer: &dyn Observer<T>) {
        let taken = {
            let mut cell = self.terminal.lock();
            match std::mem::replace(&mut *cell, TerminalCell::Closed) {
                TerminalCell::Pending(terminal) => Some(terminal),
                other => {
                    *cell = other;
                    None
                }
            }
        };
        match taken {
            None => {}
            Some(Terminal::Error(error)) => {
                let delivered = error.clone();
                if let Err(payload) =
                    panic::catch_unwind(AssertUnwindSafe(|| observer.on_error(delivered)))
                {
                    plugins::report(Error::aggregate(vec![error, panic_error(&*payload)]));
                }
            }
            Some(Terminal::Complete) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| observer.on_complete()))
                {
                    plugins::report(Error::aggregate(vec![panic_error(&*payload)]));
                }
            }
        }
    }
}

impl Default for DeliverySerializer {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts a panic payload into an [`Error`].
pub(crate) fn panic_error(payload: &(dyn Any + Send)) -> Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    Error::upstream(format!("consumer panicked: {message}"))
}
