//! Hot multicast sources.
//!
//! [`PublishSubject`] forwards events to whoever is subscribed at the time.
//! [`BehaviorSubject`] additionally remembers the latest value and replays
//! it to each new subscriber, which is what lifecycle event streams need.
//!
//! Both drop observers whose handle is cancelled and forget all observers on
//! a terminal event; late subscribers receive the stored terminal. Emission
//! is not serialized: emit from one thread at a time.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::Error;
use crate::handle::{ActionHandle, Handle};
use crate::observer::{Observer, Source};

#[derive(Clone)]
enum Terminal {
    Error(Error),
    Complete,
}

struct State<T> {
    observers: Vec<(u64, Arc<dyn Observer<T>>)>,
    latest: Option<T>,
    terminal: Option<Terminal>,
}

struct Core<T> {
    next_id: AtomicU64,
    state: Mutex<State<T>>,
}

impl<T: Clone + Send + 'static> Core<T> {
    fn new(latest: Option<T>) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            state: Mutex::new(State {
                observers: Vec::new(),
                latest,
                terminal: None,
            }),
        })
    }

    fn subscribe(self: &Arc<Self>, observer: Arc<dyn Observer<T>>, replay_latest: bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle: Handle = ActionHandle::handle(move || {
            if let Some(core) = weak.upgrade() {
                core.state.lock().observers.retain(|(oid, _)| *oid != id);
            }
        });
        observer.on_subscribe(Arc::clone(&handle));

        let (terminal, replay) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(terminal) = &state.terminal {
                (Some(terminal.clone()), None)
            } else if handle.is_cancelled() {
                (None, None)
            } else {
                state.observers.push((id, Arc::clone(&observer)));
                let replay = if replay_latest {
                    state.latest.clone()
                } else {
                    None
                };
                (None, replay)
            }
        };
        if let Some(value) = replay {
            observer.on_next(value);
        }
        match terminal {
            Some(Terminal::Error(e)) => observer.on_error(e),
            Some(Terminal::Complete) => observer.on_complete(),
            None => {}
        }
    }

    fn next(&self, value: T) {
        let observers: Vec<_> = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.latest = Some(value.clone());
            state.observers.iter().map(|(_, o)| Arc::clone(o)).collect()
        };
        for observer in observers {
            observer.on_next(value.clone());
        }
    }

    fn terminate(&self, terminal: Terminal) {
        let observers = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(terminal.clone());
            std::mem::take(&mut state.observers)
        };
        for (_, observer) in observers {
            match &terminal {
                Terminal::Error(e) => observer.on_error(e.clone()),
                Terminal::Complete => observer.on_complete(),
            }
        }
    }

    fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }

    fn is_terminated(&self) -> bool {
        self.state.lock().terminal.is_some()
    }
}

/// Multicasts events to current subscribers.
pub struct PublishSubject<T> {
    core: Arc<Core<T>>,
}

impl<T: Clone + Send + 'static> PublishSubject<T> {
    /// Creates a subject with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Core::new(None),
        }
    }

    /// Emits `value` to every current subscriber.
    pub fn next(&self, value: T) {
        self.core.next(value);
    }

    /// Terminates every subscriber with `error`.
    pub fn error(&self, error: Error) {
        self.core.terminate(Terminal::Error(error));
    }

    /// Completes every subscriber.
    pub fn complete(&self) {
        self.core.terminate(Terminal::Complete);
    }

    /// Returns true while anyone is subscribed.
    #[must_use]
    pub fn has_observers(&self) -> bool {
        self.core.observer_count() > 0
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.core.observer_count()
    }

    /// Returns true after `error` or `complete`.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.core.is_terminated()
    }
}

impl<T: Clone + Send + 'static> Default for PublishSubject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for PublishSubject<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Clone + Send + 'static> Source<T> for PublishSubject<T> {
    fn subscribe(&self, observer: Arc<dyn Observer<T>>) {
        self.core.subscribe(observer, false);
    }
}

impl<T> fmt::Debug for PublishSubject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishSubject")
            .field("observers", &self.core.state.lock().observers.len())
            .finish()
    }
}

/// Multicasts events and replays the latest value to new subscribers.
pub struct BehaviorSubject<T> {
    core: Arc<Core<T>>,
}

impl<T: Clone + Send + 'static> BehaviorSubject<T> {
    /// Creates a subject that has not seen any value.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Core::new(None),
        }
    }

    /// Creates a subject whose latest value is `initial`.
    #[must_use]
    pub fn with_value(initial: T) -> Self {
        Self {
            core: Core::new(Some(initial)),
        }
    }

    /// The latest value, if any.
    #[must_use]
    pub fn value(&self) -> Option<T> {
        self.core.state.lock().latest.clone()
    }

    /// Stores `value` and emits it to every current subscriber.
    pub fn next(&self, value: T) {
        self.core.next(value);
    }

    /// Terminates every subscriber with `error`.
    pub fn error(&self, error: Error) {
        self.core.terminate(Terminal::Error(error));
    }

    /// Completes every subscriber.
    pub fn complete(&self) {
        self.core.terminate(Terminal::Complete);
    }

    /// Returns true while anyone is subscribed.
    #[must_use]
    pub fn has_observers(&self) -> bool {
        self.core.observer_count() > 0
    }

    /// Returns true after `error` or `complete`.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.core.is_terminated()
    }
}

impl<T: Clone + Send + 'static> Default for BehaviorSubject<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BehaviorSubject<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Clone + Send + 'static> Source<T> for BehaviorSubject<T> {
    fn subscribe(&self, observer: Arc<dyn Observer<T>>) {
        self.core.subscribe(observer, true);
    }
}

impl<T: fmt::Debug> fmt::Debug for BehaviorSubject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("BehaviorSubject")
            .field("latest", &state.latest)
            .field("observers", &state.observers.len())
            .finish()
    }
}
