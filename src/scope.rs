//! Scopes: one-shot termination signals.
//!
//! A [`Scope`] delivers at most one [`ScopeSignal`] to each observer:
//!
//! - [`ScopeSignal::Ended`]: the scope is over; bound subscriptions are
//!   cancelled silently.
//! - [`ScopeSignal::Failed`]: the scope could not be honoured; bound
//!   subscriptions are cancelled and the error is delivered downstream.
//! - [`ScopeSignal::Unbound`]: whatever backed the scope finished without
//!   ever ending it; bound subscriptions stop watching and run on.
//!
//! [`Unbound`] is the scope that never signals. [`ScopeSubject`] is a scope
//! ended by hand, and [`Signalled`] a scope that already happened.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::Error;
use crate::handle::{ActionHandle, FlagHandle, Handle};

/// The terminal event of a scope.
#[derive(Debug, Clone)]
pub enum ScopeSignal {
    /// The scope ended normally.
    Ended,
    /// The scope's source completed without reaching its end.
    Unbound,
    /// The scope failed.
    Failed(Error),
}

impl ScopeSignal {
    /// Returns true for [`ScopeSignal::Ended`].
    #[must_use]
    pub const fn is_ended(&self) -> bool {
        matches!(self, Self::Ended)
    }

    /// Returns true for [`ScopeSignal::Unbound`].
    #[must_use]
    pub const fn is_unbound(&self) -> bool {
        matches!(self, Self::Unbound)
    }

    /// The failure, for [`ScopeSignal::Failed`].
    #[must_use]
    pub const fn error(&self) -> Option<&Error> {
        match self {
            Self::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Receives a scope's signal.
pub trait ScopeObserver: Send + Sync {
    /// Called once, first, with the handle that stops watching the scope.
    fn on_subscribe(&self, handle: Handle);

    /// The scope's only signal.
    fn on_signal(&self, signal: ScopeSignal);
}

/// A one-shot termination signal.
pub trait Scope: Send + Sync {
    /// Starts watching. The scope calls `observer.on_subscribe` first and
    /// then at most one `on_signal`, possibly synchronously.
    fn subscribe(&self, observer: Arc<dyn ScopeObserver>);
}

impl<S> Scope for Arc<S>
where
    S: Scope + ?Sized,
{
    fn subscribe(&self, observer: Arc<dyn ScopeObserver>) {
        (**self).subscribe(observer);
    }
}

/// The scope that never signals.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unbound;

impl Scope for Unbound {
    fn subscribe(&self, observer: Arc<dyn ScopeObserver>) {
        observer.on_subscribe(Arc::new(FlagHandle::new()));
    }
}

/// A scope that has already produced its signal; every observer receives
/// it immediately.
#[derive(Debug, Clone)]
pub struct Signalled(pub ScopeSignal);

impl Scope for Signalled {
    fn subscribe(&self, observer: Arc<dyn ScopeObserver>) {
        observer.on_subscribe(Arc::new(FlagHandle::new()));
        observer.on_signal(self.0.clone());
    }
}

/// A scope that has already ended.
#[must_use]
pub fn ended() -> Signalled {
    Signalled(ScopeSignal::Ended)
}

/// A scope that has already failed with `error`.
#[must_use]
pub fn failed(error: Error) -> Signalled {
    Signalled(ScopeSignal::Failed(error))
}

struct SubjectState {
    observers: Vec<(u64, Arc<dyn ScopeObserver>)>,
    signal: Option<ScopeSignal>,
}

struct SubjectInner {
    next_id: AtomicU64,
    state: Mutex<SubjectState>,
}

impl SubjectInner {
    fn remove(&self, id: u64) {
        self.state.lock().observers.retain(|(oid, _)| *oid != id);
    }
}

/// A scope signalled by hand. Late observers receive the stored signal.
#[derive(Clone)]
pub struct ScopeSubject {
    inner: Arc<SubjectInner>,
}

impl ScopeSubject {
    /// Creates a scope that has not signalled yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SubjectInner {
                next_id: AtomicU64::new(0),
                state: Mutex::new(SubjectState {
                    observers: Vec::new(),
                    signal: None,
                }),
            }),
        }
    }

    /// Ends the scope.
    pub fn end(&self) {
        self.signal(ScopeSignal::Ended);
    }

    /// Fails the scope with `error`.
    pub fn fail(&self, error: Error) {
        self.signal(ScopeSignal::Failed(error));
    }

    /// Completes the scope without ending it.
    pub fn unbind(&self) {
        self.signal(ScopeSignal::Unbound);
    }

    /// Delivers `signal` to every current observer. Only the first signal
    /// counts; later calls are ignored.
    pub fn signal(&self, signal: ScopeSignal) {
        let observers = {
            let mut state = self.inner.state.lock();
            if state.signal.is_some() {
                return;
            }
            state.signal = Some(signal.clone());
            std::mem::take(&mut state.observers)
        };
        for (_, observer) in observers {
            observer.on_signal(signal.clone());
        }
    }

    /// Returns true while at least one observer is watching.
    #[must_use]
    pub fn has_observers(&self) -> bool {
        !self.inner.state.lock().observers.is_empty()
    }

    /// Returns true once a signal was delivered.
    #[must_use]
    pub fn is_signalled(&self) -> bool {
        self.inner.state.lock().signal.is_some()
    }
}

impl Default for ScopeSubject {
    fn default() -> Self {
        Self::new()
    }
}

impl Scope for ScopeSubject {
    fn subscribe(&self, observer: Arc<dyn ScopeObserver>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<SubjectInner> = Arc::downgrade(&self.inner);
        let handle = ActionHandle::handle(move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove(id);
            }
        });
        observer.on_subscribe(Arc::clone(&handle));

        let replay = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if let Some(signal) = &state.signal {
                Some(signal.clone())
            } else {
                if !handle.is_cancelled() {
                    state.observers.push((id, Arc::clone(&observer)));
                }
                None
            }
        };
        if let Some(signal) = replay {
            observer.on_signal(signal);
        }
    }
}

impl fmt::Debug for ScopeSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ScopeSubject")
            .field("observers", &state.observers.len())
            .field("signal", &state.signal)
            .finish()
    }
}
