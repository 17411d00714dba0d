//! The dual-handle coordinator: binds one subscription to one scope.
//!
//! A [`Coordinator`] sits between a [`Source`] and its consumer and owns two
//! [`HandleSlot`]s: the *main* slot for the upstream subscription and the
//! *scope* slot for the subscription to the [`Scope`]. Whichever terminal
//! arrives first (upstream terminal, scope signal, or consumer cancel) wins
//! the slot transition and performs the teardown; everything else becomes a
//! no-op.
//!
//! # Attachment order
//!
//! When the source hands over its handle the coordinator:
//!
//! 1. arms the scope slot with a fresh [`ScopeWatcher`];
//! 2. hands the consumer a handle that cancels the coordinator;
//! 3. subscribes the watcher to the scope, which may signal synchronously;
//! 4. arms the main slot with the upstream handle.
//!
//! A scope that ends during step 3 terminates the still-empty main slot, so
//! step 4 cancels the upstream handle instead of leaking it. The coordinator
//! counts as active only once step 4 armed the main slot.
//!
//! # Ownership
//!
//! While subscribed, the source keeps the coordinator alive. The consumer's
//! handle and the scope watcher only point back at it weakly, and a
//! terminated slot drops what it held, so nothing outlives teardown.
//!
//! # Arities
//!
//! One implementation serves every shape of source; an [`Arity`] marker
//! picks how values are treated and whether demand is tracked:
//!
//! | Arity | Values | Demand |
//! |-------|--------|--------|
//! | [`StreamArity`] | many | none |
//! | [`SingleArity`] | one, terminal | none |
//! | [`CompletionArity`] | none | none |
//! | [`FlowArity`] | many | accumulated until armed |

use parking_lot::Mutex;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::demand::{Backpressure, DemandPolicy, NoDemand};
use crate::error::Error;
use crate::handle::{Cancellable, Handle, HandleSlot};
use crate::observer::{Observer, Source};
use crate::plugins;
use crate::scope::{Scope, ScopeObserver, ScopeSignal};
use crate::serializer::DeliverySerializer;
use crate::tracing_compat::{debug, trace, warn};

/// How an arity treats values from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRule {
    /// Any number of values before the terminal.
    Many,
    /// At most one value, which is itself the terminal.
    Terminal,
    /// No values at all; only a terminal.
    Forbidden,
}

/// The shape of a scoped subscription.
pub trait Arity: Send + Sync + 'static {
    /// Name used in logs and protocol-violation reports.
    const NAME: &'static str;
    /// How upstream values are treated.
    const VALUES: ValueRule;
    /// Demand handling for `request(n)`.
    type Demand: DemandPolicy;
}

/// Zero or more values, then a terminal.
#[derive(Debug, Clone, Copy)]
pub struct StreamArity;

impl Arity for StreamArity {
    const NAME: &'static str = "StreamCoordinator";
    const VALUES: ValueRule = ValueRule::Many;
    type Demand = NoDemand;
}

/// One value or one terminal. The consumer sees the value followed by
/// completion.
#[derive(Debug, Clone, Copy)]
pub struct SingleArity;

impl Arity for SingleArity {
    const NAME: &'static str = "SingleCoordinator";
    const VALUES: ValueRule = ValueRule::Terminal;
    type Demand = NoDemand;
}

/// Completion or error, nothing else.
#[derive(Debug, Clone, Copy)]
pub struct CompletionArity;

impl Arity for CompletionArity {
    const NAME: &'static str = "CompletionCoordinator";
    const VALUES: ValueRule = ValueRule::Forbidden;
    type Demand = NoDemand;
}

/// A demand-driven stream.
#[derive(Debug, Clone, Copy)]
pub struct FlowArity;

impl Arity for FlowArity {
    const NAME: &'static str = "FlowCoordinator";
    const VALUES: ValueRule = ValueRule::Many;
    type Demand = Backpressure;
}

/// Observable lifecycle of a coordinator. `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorState {
    /// Created, upstream not yet subscribed.
    Init,
    /// Upstream subscribed and not yet terminated.
    Active,
    /// Upstream terminated, scope ended or failed, or cancelled.
    Terminated,
}

// Upstream protocol states.
const OPEN: u8 = 0;
const SETTLED: u8 = 1;
const CLOSED: u8 = 2;

/// Binds one upstream subscription to one scope.
pub struct Coordinator<T, A: Arity = StreamArity> {
    main: HandleSlot,
    scope_slot: HandleSlot,
    serializer: DeliverySerializer,
    consumer: Arc<dyn Observer<T>>,
    scope: Mutex<Option<Arc<dyn Scope>>>,
    demand: A::Demand,
    subscribed: AtomicBool,
    active: AtomicBool,
    upstream: AtomicU8,
    this: Weak<Self>,
    _arity: PhantomData<fn() -> A>,
}

/// Coordinator for value streams.
pub type StreamCoordinator<T> = Coordinator<T, StreamArity>;
/// Coordinator for single-value sources.
pub type SingleCoordinator<T> = Coordinator<T, SingleArity>;
/// Coordinator for value-less completion sources.
pub type CompletionCoordinator = Coordinator<(), CompletionArity>;
/// Coordinator for demand-driven streams.
pub type FlowCoordinator<T> = Coordinator<T, FlowArity>;

impl<T, A> Coordinator<T, A>
where
    T: Send + 'static,
    A: Arity,
{
    /// Subscribes `consumer` to `source`, auto-disposing when `scope` ends.
    ///
    /// Cancelling the returned coordinator, or the handle the consumer
    /// receives in `on_subscribe`, disposes the subscription.
    pub fn attach<S>(
        source: &S,
        scope: impl Scope + 'static,
        consumer: Arc<dyn Observer<T>>,
    ) -> Arc<Self>
    where
        S: Source<T> + ?Sized,
    {
        let coordinator = Self::new(Arc::new(scope), consumer);
        trace!(arity = A::NAME, "attaching to source");
        source.subscribe(Arc::clone(&coordinator) as Arc<dyn Observer<T>>);
        coordinator
    }

    fn new(scope: Arc<dyn Scope>, consumer: Arc<dyn Observer<T>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            main: HandleSlot::new(),
            scope_slot: HandleSlot::new(),
            serializer: DeliverySerializer::new(),
            consumer,
            scope: Mutex::new(Some(scope)),
            demand: A::Demand::default(),
            subscribed: AtomicBool::new(false),
            active: AtomicBool::new(false),
            upstream: AtomicU8::new(OPEN),
            this: this.clone(),
            _arity: PhantomData,
        })
    }

    /// The consumer this coordinator delivers to.
    #[must_use]
    pub fn delegate_consumer(&self) -> &Arc<dyn Observer<T>> {
        &self.consumer
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        if self.main.is_terminated() {
            CoordinatorState::Terminated
        } else if self.active.load(Ordering::Acquire) {
            CoordinatorState::Active
        } else {
            CoordinatorState::Init
        }
    }

    /// Returns true while the scope is still being watched.
    #[must_use]
    pub fn is_scope_bound(&self) -> bool {
        !self.scope_slot.is_terminated()
    }

    fn on_scope_signal(&self, signal: ScopeSignal) {
        match signal {
            ScopeSignal::Ended => {
                self.scope_slot.mark_terminated();
                if self.main.terminate() {
                    debug!(arity = A::NAME, "scope ended, upstream disposed");
                }
            }
            ScopeSignal::Failed(error) => {
                self.scope_slot.mark_terminated();
                if self.main.terminate() {
                    debug!(arity = A::NAME, error = %error, "scope failed, upstream disposed");
                    self.serializer.deliver_error(&*self.consumer, error);
                }
            }
            ScopeSignal::Unbound => {
                if self.scope_slot.mark_terminated() {
                    debug!(arity = A::NAME, "scope completed without ending, upstream unbound");
                }
            }
        }
    }

    /// Closes the upstream side after its own terminal. Returns true if the
    /// consumer should hear about it.
    fn finish_upstream(&self) -> bool {
        if !self.main.mark_terminated() {
            trace!(arity = A::NAME, "upstream terminal after disposal, dropped");
            return false;
        }
        self.scope_slot.terminate();
        true
    }

    fn report_late(&self, event: &str) {
        let error = Error::protocol_violation(format!(
            "{} received {event} after its upstream terminated",
            A::NAME
        ));
        warn!(error = %error, "misbehaving upstream");
        plugins::report(error);
    }
}

impl<T, A> Observer<T> for Coordinator<T, A>
where
    T: Send + 'static,
    A: Arity,
{
    fn on_subscribe(&self, handle: Handle) {
        if self.subscribed.swap(true, Ordering::AcqRel) {
            handle.cancel();
            let error = Error::subscribed_twice(A::NAME);
            warn!(error = %error, "misbehaving upstream");
            plugins::report(error);
            return;
        }
        let watcher = Arc::new(ScopeWatcher {
            coordinator: Weak::clone(&self.this),
            upstream: HandleSlot::new(),
        });
        if !self
            .scope_slot
            .set_once(Arc::clone(&watcher) as Handle, A::NAME)
        {
            handle.cancel();
            return;
        }

        self.consumer.on_subscribe(Arc::new(ConsumerHandle {
            coordinator: Weak::clone(&self.this),
        }));

        let scope = self.scope.lock().take();
        if let Some(scope) = scope {
            scope.subscribe(watcher);
        }

        if self.main.set_once(Arc::clone(&handle), A::NAME) {
            self.active.store(true, Ordering::Release);
            self.demand.on_armed(&handle);
        }
    }

    fn on_next(&self, value: T) {
        match A::VALUES {
            ValueRule::Many => {
                if self.upstream.load(Ordering::Acquire) != OPEN {
                    self.report_late("a value");
                    return;
                }
                if !self.main.is_terminated() {
                    self.serializer.deliver_value(&*self.consumer, value);
                }
            }
            ValueRule::Terminal => {
                if self
                    .upstream
                    .compare_exchange(OPEN, SETTLED, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    self.report_late("a value");
                    return;
                }
                if self.finish_upstream() {
                    self.serializer.deliver_value(&*self.consumer, value);
                    self.serializer.deliver_complete(&*self.consumer);
                }
            }
            ValueRule::Forbidden => {
                let error =
                    Error::protocol_violation(format!("{} received a value", A::NAME));
                warn!(error = %error, "misbehaving upstream");
                plugins::report(error);
            }
        }
    }

    fn on_error(&self, error: Error) {
        if self.upstream.swap(CLOSED, Ordering::AcqRel) != OPEN {
            self.report_late("an error");
            return;
        }
        if self.finish_upstream() {
            self.serializer.deliver_error(&*self.consumer, error);
        }
    }

    fn on_complete(&self) {
        match self.upstream.swap(CLOSED, Ordering::AcqRel) {
            OPEN => {
                if self.finish_upstream() {
                    self.serializer.deliver_complete(&*self.consumer);
                }
            }
            // The single value already completed the consumer.
            SETTLED if A::VALUES == ValueRule::Terminal => {}
            _ => self.report_late("a completion"),
        }
    }
}

impl<T, A> Cancellable for Coordinator<T, A>
where
    T: Send + 'static,
    A: Arity,
{
    fn cancel(&self) {
        self.scope_slot.terminate();
        if self.main.terminate() {
            trace!(arity = A::NAME, "cancelled by consumer");
        }
    }

    fn is_cancelled(&self) -> bool {
        self.main.is_terminated()
    }

    fn request(&self, n: u64) {
        self.demand.request(&self.main, n);
    }
}

impl<T, A: Arity> fmt::Debug for Coordinator<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(A::NAME)
            .field("main", &self.main)
            .field("scope", &self.scope_slot)
            .field("delivered_terminal", &self.serializer.is_terminated())
            .finish_non_exhaustive()
    }
}

/// The cancellation handle a consumer receives. A coordinator that no
/// longer exists counts as cancelled.
struct ConsumerHandle<T, A: Arity> {
    coordinator: Weak<Coordinator<T, A>>,
}

impl<T, A> Cancellable for ConsumerHandle<T, A>
where
    T: Send + 'static,
    A: Arity,
{
    fn cancel(&self) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.cancel();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.coordinator
            .upgrade()
            .map_or(true, |coordinator| coordinator.is_cancelled())
    }

    fn request(&self, n: u64) {
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.request(n);
        }
    }
}

/// Watches the scope on behalf of a coordinator.
///
/// The coordinator's scope slot holds the watcher itself; the watcher's own
/// slot holds the handle the scope gave it. Cancelling the watcher releases
/// the scope subscription even if the scope has not handed one over yet.
struct ScopeWatcher<T, A: Arity> {
    coordinator: Weak<Coordinator<T, A>>,
    upstream: HandleSlot,
}

impl<T, A> ScopeObserver for ScopeWatcher<T, A>
where
    T: Send + 'static,
    A: Arity,
{
    fn on_subscribe(&self, handle: Handle) {
        self.upstream.set_once(handle, "ScopeWatcher");
    }

    fn on_signal(&self, signal: ScopeSignal) {
        // Already cancelled: the coordinator stopped listening.
        if !self.upstream.mark_terminated() {
            return;
        }
        if let Some(coordinator) = self.coordinator.upgrade() {
            coordinator.on_scope_signal(signal);
        }
    }
}

impl<T, A> Cancellable for ScopeWatcher<T, A>
where
    T: Send + 'static,
    A: Arity,
{
    fn cancel(&self) {
        self.upstream.terminate();
    }

    fn is_cancelled(&self) -> bool {
        self.upstream.is_terminated()
    }
}

/// A source whose every subscription is bound to a scope.
pub struct Scoped<S, A = StreamArity> {
    source: S,
    scope: Arc<dyn Scope>,
    _arity: PhantomData<fn() -> A>,
}

impl<S, A> Scoped<S, A> {
    /// Binds `source` to `scope`.
    pub fn new(source: S, scope: impl Scope + 'static) -> Self {
        Self {
            source,
            scope: Arc::new(scope),
            _arity: PhantomData,
        }
    }

    /// The unscoped source.
    pub fn inner(&self) -> &S {
        &self.source
    }
}

impl<T, S, A> Source<T> for Scoped<S, A>
where
    T: Send + 'static,
    S: Source<T>,
    A: Arity,
{
    fn subscribe(&self, observer: Arc<dyn Observer<T>>) {
        Coordinator::<T, A>::attach(&self.source, Arc::clone(&self.scope), observer);
    }
}

impl<S: fmt::Debug, A: Arity> fmt::Debug for Scoped<S, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scoped")
            .field("source", &self.source)
            .field("arity", &A::NAME)
            .finish_non_exhaustive()
    }
}

/// `source.scoped(scope)` for every [`Source`].
pub trait SourceExt<T>: Source<T> + Sized {
    /// Binds every subscription of this stream to `scope`.
    fn scoped(self, scope: impl Scope + 'static) -> Scoped<Self> {
        Scoped::new(self, scope)
    }

    /// Like [`scoped`](Self::scoped) for a chosen arity.
    fn scoped_as<A: Arity>(self, scope: impl Scope + 'static) -> Scoped<Self, A> {
        Scoped::new(self, scope)
    }
}

impl<T, S: Source<T>> SourceExt<T> for S {}
