//! Resolving a scope from a lifecycle.
//!
//! [`ScopeResolver::resolve`] reads the current state, computes its end
//! target and returns a [`LifecycleScope`] that ends once the target is
//! observed. Boundary errors (no state yet, or already past the last
//! bindable state) are handled according to [`ResolveOptions`]:
//!
//! - checked boundaries fail resolution itself, unless an out-of-scope
//!   handler is installed, in which case the handler decides;
//! - unchecked boundaries yield a [`FailedScope`] that routes the error
//!   through the handler when it is subscribed.
//!
//! [`DeferredScope`] postpones the whole resolution to subscription time.

use parking_lot::Mutex;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{EndMatcher, LifecycleEvent, LifecycleProvider};
use crate::config::ResolveOptions;
use crate::error::{Error, OutsideScopeError, Result};
use crate::handle::{Cancellable, FlagHandle, Handle, HandleSlot};
use crate::observer::{Observer, Source};
use crate::plugins::Plugins;
use crate::scope::{self, Scope, ScopeObserver, ScopeSignal};
use crate::tracing_compat::{debug, trace};

/// Resolves scopes with a fixed set of options and a plugin registry.
#[derive(Clone)]
pub struct ScopeResolver {
    options: ResolveOptions,
    plugins: Arc<Plugins>,
}

impl ScopeResolver {
    /// A resolver consulting the global plugin registry.
    #[must_use]
    pub fn new(options: ResolveOptions) -> Self {
        Self {
            options,
            plugins: Arc::clone(Plugins::global()),
        }
    }

    /// Uses `plugins` instead of the global registry.
    #[must_use]
    pub fn with_plugins(mut self, plugins: Arc<Plugins>) -> Self {
        self.plugins = plugins;
        self
    }

    /// The options in effect.
    #[must_use]
    pub const fn options(&self) -> ResolveOptions {
        self.options
    }

    /// Resolves a scope from its parts.
    ///
    /// `events` must replay `current` to new subscribers; the replayed value
    /// is skipped.
    pub fn resolve<E, F>(
        &self,
        current: Option<E>,
        events: Arc<dyn Source<E>>,
        corresponding_end: F,
        matcher: EndMatcher<E>,
    ) -> Result<Arc<dyn Scope>>
    where
        E: LifecycleEvent,
        F: FnOnce(&E) -> std::result::Result<E, OutsideScopeError>,
    {
        let Some(current) = current else {
            return self.boundary(
                OutsideScopeError::NotStarted,
                self.options.check_start_boundary,
            );
        };
        match corresponding_end(&current) {
            Ok(target) => {
                debug!(current = ?current, target = ?target, "scope resolved");
                Ok(Arc::new(LifecycleScope::new(events, target, matcher)))
            }
            Err(err) => self.boundary(err, self.options.check_end_boundary),
        }
    }

    /// Resolves a scope from a [`LifecycleProvider`].
    pub fn resolve_lifecycle<E, P>(&self, provider: &P) -> Result<Arc<dyn Scope>>
    where
        E: LifecycleEvent,
        P: LifecycleProvider<E> + ?Sized,
    {
        self.resolve(
            provider.current_state(),
            provider.events(),
            |state| provider.corresponding_end(state),
            provider.end_matcher(),
        )
    }

    /// A scope that resolves against `provider` each time it is subscribed.
    pub fn deferred<E, P>(&self, provider: P) -> DeferredScope<E, P>
    where
        E: LifecycleEvent,
        P: LifecycleProvider<E>,
    {
        DeferredScope {
            provider,
            resolver: self.clone(),
            _event: PhantomData,
        }
    }

    fn boundary(&self, err: OutsideScopeError, eager: bool) -> Result<Arc<dyn Scope>> {
        if !eager {
            debug!(error = %err, "boundary error deferred to subscription");
            return Ok(Arc::new(FailedScope {
                error: err,
                plugins: Arc::clone(&self.plugins),
            }));
        }
        match self.plugins.intercept_outside_scope(err) {
            Ok(()) => {
                debug!(error = %err, "boundary error swallowed, scope already ended");
                Ok(Arc::new(scope::ended()))
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for ScopeResolver {
    fn default() -> Self {
        Self::new(ResolveOptions::default())
    }
}

impl fmt::Debug for ScopeResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeResolver")
            .field("options", &self.options)
            .field("plugins", &self.plugins)
            .finish()
    }
}

/// Resolves a scope with the global plugin registry.
pub fn resolve_scope<E, F>(
    current: Option<E>,
    events: Arc<dyn Source<E>>,
    corresponding_end: F,
    matcher: EndMatcher<E>,
    options: ResolveOptions,
) -> Result<Arc<dyn Scope>>
where
    E: LifecycleEvent,
    F: FnOnce(&E) -> std::result::Result<E, OutsideScopeError>,
{
    ScopeResolver::new(options).resolve(current, events, corresponding_end, matcher)
}

/// Resolves a scope from `provider` with the global plugin registry.
pub fn resolve_scope_from_lifecycle<E, P>(
    provider: &P,
    options: ResolveOptions,
) -> Result<Arc<dyn Scope>>
where
    E: LifecycleEvent,
    P: LifecycleProvider<E> + ?Sized,
{
    ScopeResolver::new(options).resolve_lifecycle(provider)
}

/// A scope resolved against `provider` at subscription time, with default
/// options and the global plugin registry.
pub fn deferred_scope<E, P>(provider: P) -> DeferredScope<E, P>
where
    E: LifecycleEvent,
    P: LifecycleProvider<E>,
{
    ScopeResolver::default().deferred(provider)
}

/// Ends when a lifecycle reaches a target state.
///
/// Signals [`ScopeSignal::Ended`] on the first matching state after the
/// replayed one, [`ScopeSignal::Failed`] if the lifecycle errors, and
/// [`ScopeSignal::Unbound`] if it completes without reaching the target.
pub struct LifecycleScope<E> {
    events: Arc<dyn Source<E>>,
    target: E,
    matcher: EndMatcher<E>,
}

impl<E: LifecycleEvent> LifecycleScope<E> {
    /// Watches `events` for `target`.
    pub fn new(events: Arc<dyn Source<E>>, target: E, matcher: EndMatcher<E>) -> Self {
        Self {
            events,
            target,
            matcher,
        }
    }

    /// The state that ends this scope.
    pub fn target(&self) -> &E {
        &self.target
    }
}

impl<E: LifecycleEvent> Scope for LifecycleScope<E> {
    fn subscribe(&self, observer: Arc<dyn ScopeObserver>) {
        let watcher = Arc::new(EndWatcher {
            observer: Mutex::new(Some(Arc::clone(&observer))),
            target: self.target.clone(),
            matcher: self.matcher.clone(),
            replay_pending: AtomicBool::new(true),
            done: AtomicBool::new(false),
            upstream: HandleSlot::new(),
        });
        observer.on_subscribe(Arc::clone(&watcher) as Handle);
        self.events.subscribe(watcher as Arc<dyn Observer<E>>);
    }
}

impl<E: fmt::Debug> fmt::Debug for LifecycleScope<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleScope")
            .field("target", &self.target)
            .field("matcher", &self.matcher)
            .finish_non_exhaustive()
    }
}

/// Lifecycle subscriber behind a [`LifecycleScope`]; also the handle its
/// scope observer cancels. The observer is dropped once it is done with, so
/// the two never keep each other alive.
struct EndWatcher<E> {
    observer: Mutex<Option<Arc<dyn ScopeObserver>>>,
    target: E,
    matcher: EndMatcher<E>,
    replay_pending: AtomicBool,
    done: AtomicBool,
    upstream: HandleSlot,
}

impl<E: LifecycleEvent> EndWatcher<E> {
    fn finish(&self, signal: ScopeSignal, cancel_upstream: bool) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if cancel_upstream {
            self.upstream.terminate();
        } else {
            self.upstream.mark_terminated();
        }
        let observer = self.observer.lock().take();
        if let Some(observer) = observer {
            observer.on_signal(signal);
        }
    }
}

impl<E: LifecycleEvent> Observer<E> for EndWatcher<E> {
    fn on_subscribe(&self, handle: Handle) {
        self.upstream.set_once(handle, "LifecycleScope");
    }

    fn on_next(&self, state: E) {
        if self.replay_pending.swap(false, Ordering::AcqRel) {
            trace!(state = ?state, "skipping replayed lifecycle state");
            return;
        }
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if self.matcher.matches(&state, &self.target) {
            debug!(state = ?state, target = ?self.target, "lifecycle reached end");
            self.finish(ScopeSignal::Ended, true);
        }
    }

    fn on_error(&self, error: Error) {
        self.finish(ScopeSignal::Failed(error), false);
    }

    fn on_complete(&self) {
        debug!(target = ?self.target, "lifecycle completed before its end");
        self.finish(ScopeSignal::Unbound, false);
    }
}

impl<E: LifecycleEvent> Cancellable for EndWatcher<E> {
    fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        self.upstream.terminate();
        self.observer.lock().take();
    }

    fn is_cancelled(&self) -> bool {
        self.upstream.is_terminated()
    }
}

/// A boundary error waiting for a subscriber.
///
/// On subscription the error goes through the out-of-scope handler: no
/// handler fails the scope with the boundary error, a swallowing handler
/// ends it, and a handler error fails it with that error.
pub struct FailedScope {
    error: OutsideScopeError,
    plugins: Arc<Plugins>,
}

impl FailedScope {
    /// A deferred `error`, routed through the global plugin registry.
    #[must_use]
    pub fn new(error: OutsideScopeError) -> Self {
        Self {
            error,
            plugins: Arc::clone(Plugins::global()),
        }
    }

    /// Routes through `plugins` instead of the global registry.
    #[must_use]
    pub fn with_plugins(mut self, plugins: Arc<Plugins>) -> Self {
        self.plugins = plugins;
        self
    }

    /// The boundary error.
    #[must_use]
    pub const fn error(&self) -> OutsideScopeError {
        self.error
    }
}

impl Scope for FailedScope {
    fn subscribe(&self, observer: Arc<dyn ScopeObserver>) {
        observer.on_subscribe(Arc::new(FlagHandle::new()));
        let signal = match self.plugins.intercept_outside_scope(self.error) {
            Ok(()) => ScopeSignal::Ended,
            Err(e) => ScopeSignal::Failed(e),
        };
        observer.on_signal(signal);
    }
}

impl fmt::Debug for FailedScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailedScope")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// A scope resolved from a lifecycle each time it is subscribed.
///
/// Resolution failures become the scope's failure, so they reach the
/// consumer as an error terminal instead of the caller.
pub struct DeferredScope<E, P> {
    provider: P,
    resolver: ScopeResolver,
    _event: PhantomData<fn() -> E>,
}

impl<E, P> DeferredScope<E, P> {
    /// The lifecycle this scope resolves against.
    pub fn provider(&self) -> &P {
        &self.provider
    }
}

impl<E, P> Scope for DeferredScope<E, P>
where
    E: LifecycleEvent,
    P: LifecycleProvider<E>,
{
    fn subscribe(&self, observer: Arc<dyn ScopeObserver>) {
        match self.resolver.resolve_lifecycle(&self.provider) {
            Ok(scope) => scope.subscribe(observer),
            Err(error) => scope::failed(error).subscribe(observer),
        }
    }
}

impl<E, P: fmt::Debug> fmt::Debug for DeferredScope<E, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredScope")
            .field("provider", &self.provider)
            .field("resolver", &self.resolver)
            .finish()
    }
}
