//! Lifecycles and the scopes resolved from them.
//!
//! A lifecycle is a stream of states (created, started, stopped, ...) where
//! every state that can be bound to has a corresponding end state. Binding a
//! subscription "for the rest of this state" means resolving a [`Scope`]
//! that ends when the lifecycle reaches the end corresponding to its current
//! state.
//!
//! [`LifecycleProvider`] is what the resolver needs from a lifecycle;
//! [`LifecycleSubject`] is a ready-made provider driven by hand.
//!
//! [`Scope`]: crate::scope::Scope

pub mod resolver;

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, OutsideScopeError};
use crate::observer::Source;
use crate::subject::BehaviorSubject;

pub use resolver::{
    deferred_scope, resolve_scope, resolve_scope_from_lifecycle, DeferredScope, FailedScope,
    LifecycleScope, ScopeResolver,
};

/// Bounds every lifecycle state type satisfies.
pub trait LifecycleEvent: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

impl<E> LifecycleEvent for E where E: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {}

/// Maps a state to the end state that closes it.
pub type CorrespondingEnd<E> = Arc<dyn Fn(&E) -> Result<E, OutsideScopeError> + Send + Sync>;

/// How an observed state is compared against the end target.
pub enum EndMatcher<E> {
    /// The target itself must be observed.
    Equal,
    /// Any state ordered at or past the target matches. For monotonic
    /// lifecycles that may skip over the exact target.
    Comparator(Arc<dyn Fn(&E, &E) -> Ordering + Send + Sync>),
}

impl<E> EndMatcher<E> {
    /// Comparator built from `cmp(event, target)`.
    pub fn comparator(cmp: impl Fn(&E, &E) -> Ordering + Send + Sync + 'static) -> Self {
        Self::Comparator(Arc::new(cmp))
    }
}

impl<E: Ord + 'static> EndMatcher<E> {
    /// Comparator using the state type's own ordering.
    #[must_use]
    pub fn ordered() -> Self {
        Self::Comparator(Arc::new(E::cmp))
    }
}

impl<E: PartialEq> EndMatcher<E> {
    /// Returns true if `event` closes a scope whose end is `target`.
    pub fn matches(&self, event: &E, target: &E) -> bool {
        match self {
            Self::Equal => event == target,
            Self::Comparator(cmp) => cmp(event, target) != Ordering::Less,
        }
    }
}

impl<E> Default for EndMatcher<E> {
    fn default() -> Self {
        Self::Equal
    }
}

impl<E> Clone for EndMatcher<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Equal => Self::Equal,
            Self::Comparator(cmp) => Self::Comparator(Arc::clone(cmp)),
        }
    }
}

impl<E> fmt::Debug for EndMatcher<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equal => f.write_str("Equal"),
            Self::Comparator(_) => f.write_str("Comparator(..)"),
        }
    }
}

/// Something with a lifecycle that scopes can be resolved against.
pub trait LifecycleProvider<E: LifecycleEvent>: Send + Sync {
    /// The latest state, or `None` before the lifecycle started.
    fn current_state(&self) -> Option<E>;

    /// All states. Subscribers receive the current state first, if any.
    fn events(&self) -> Arc<dyn Source<E>>;

    /// The end state for `state`, or [`OutsideScopeError::Ended`] if
    /// `state` is already past the last bindable point.
    fn corresponding_end(&self, state: &E) -> Result<E, OutsideScopeError>;

    /// How states are compared against the end target.
    fn end_matcher(&self) -> EndMatcher<E> {
        EndMatcher::Equal
    }
}

impl<E, P> LifecycleProvider<E> for Arc<P>
where
    E: LifecycleEvent,
    P: LifecycleProvider<E> + ?Sized,
{
    fn current_state(&self) -> Option<E> {
        (**self).current_state()
    }

    fn events(&self) -> Arc<dyn Source<E>> {
        (**self).events()
    }

    fn corresponding_end(&self, state: &E) -> Result<E, OutsideScopeError> {
        (**self).corresponding_end(state)
    }

    fn end_matcher(&self) -> EndMatcher<E> {
        (**self).end_matcher()
    }
}

/// A lifecycle driven by hand, backed by a [`BehaviorSubject`].
pub struct LifecycleSubject<E> {
    states: BehaviorSubject<E>,
    corresponding: CorrespondingEnd<E>,
    matcher: EndMatcher<E>,
}

impl<E: LifecycleEvent> LifecycleSubject<E> {
    /// Creates a lifecycle that has not started, with the given end mapping.
    pub fn new(
        corresponding: impl Fn(&E) -> Result<E, OutsideScopeError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            states: BehaviorSubject::new(),
            corresponding: Arc::new(corresponding),
            matcher: EndMatcher::Equal,
        }
    }

    /// Uses `matcher` for scopes resolved from this lifecycle.
    #[must_use]
    pub fn with_matcher(mut self, matcher: EndMatcher<E>) -> Self {
        self.matcher = matcher;
        self
    }

    /// Moves the lifecycle to `state`.
    pub fn emit(&self, state: E) {
        self.states.next(state);
    }

    /// Ends the state stream without an error.
    pub fn complete(&self) {
        self.states.complete();
    }

    /// Ends the state stream with `error`.
    pub fn fail(&self, error: Error) {
        self.states.error(error);
    }

    /// Returns true while any scope is watching this lifecycle.
    #[must_use]
    pub fn has_observers(&self) -> bool {
        self.states.has_observers()
    }
}

impl<E: LifecycleEvent> LifecycleProvider<E> for LifecycleSubject<E> {
    fn current_state(&self) -> Option<E> {
        self.states.value()
    }

    fn events(&self) -> Arc<dyn Source<E>> {
        Arc::new(self.states.clone())
    }

    fn corresponding_end(&self, state: &E) -> Result<E, OutsideScopeError> {
        (self.corresponding)(state)
    }

    fn end_matcher(&self) -> EndMatcher<E> {
        self.matcher.clone()
    }
}

impl<E: fmt::Debug> fmt::Debug for LifecycleSubject<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleSubject")
            .field("states", &self.states)
            .field("matcher", &self.matcher)
            .finish_non_exhaustive()
    }
}
