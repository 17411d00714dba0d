//! Autodispose: subscriptions that cancel themselves when their scope ends.
//!
//! # Overview
//!
//! A subscription bound to a scope (a screen, a request, a component's
//! "started" state) must be released when that scope ends, no matter which
//! thread notices first. This crate provides the primitive that makes that
//! binding race-free:
//!
//! - a [`Coordinator`] sits between a [`Source`] and its consumer and owns
//!   two cancellation slots, one for the upstream and one for the scope;
//! - whichever terminal arrives first (upstream terminal, scope signal,
//!   consumer cancel) wins and performs the teardown exactly once;
//! - a handle that arrives after teardown is cancelled on arrival.
//!
//! Scopes come either ready-made ([`scope::ScopeSubject`], [`scope::ended`])
//! or resolved from a lifecycle ([`lifecycle::ScopeResolver`]).
//!
//! # Core Guarantees
//!
//! - **At most one terminal**: the consumer observes at most one error or
//!   completion, and never an overlapping delivery
//! - **No leaked handles**: every handle that reaches a terminated slot is
//!   cancelled before it can be observed as live
//! - **Out-of-band errors**: protocol violations and failures while
//!   delivering a terminal go to the error sink in [`plugins`], never to the
//!   consumer
//!
//! # Module Structure
//!
//! - [`handle`]: cancellation handles, the terminated sentinel, `HandleSlot`
//! - [`serializer`]: non-overlapping, at-most-once-terminal delivery
//! - [`demand`]: demand accumulation for the flow arity
//! - [`coordinator`]: the dual-handle coordinator and its arities
//! - [`scope`]: scope signals and basic scopes
//! - [`lifecycle`]: lifecycle providers and the scope resolver
//! - [`subject`]: hot multicast sources
//! - [`plugins`]: out-of-scope handler and error sink registry
//! - [`config`]: resolution options and registry startup settings
//! - [`error`]: error types

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod config;
pub mod coordinator;
pub mod demand;
pub mod error;
pub mod handle;
pub mod lifecycle;
pub mod observer;
pub mod plugins;
pub mod scope;
pub mod serializer;
pub mod subject;
pub mod tracing_compat;

#[cfg(test)]
pub(crate) mod test_utils;

// Re-exports for convenient access to core types
pub use config::{PluginsConfig, ResolveOptions};
pub use coordinator::{
    Arity, CompletionArity, CompletionCoordinator, Coordinator, CoordinatorState, FlowArity,
    FlowCoordinator, SingleArity, SingleCoordinator, Scoped, SourceExt, StreamArity,
    StreamCoordinator, ValueRule,
};
pub use demand::{BackpressureAccumulator, UNBOUNDED};
pub use error::{Error, ErrorKind, OutsideScopeError, Result};
pub use handle::{ActionHandle, Cancellable, FlagHandle, Handle, HandleSlot};
pub use lifecycle::{
    deferred_scope, resolve_scope, resolve_scope_from_lifecycle, DeferredScope, EndMatcher,
    LifecycleEvent, LifecycleProvider, LifecycleSubject, ScopeResolver,
};
pub use observer::{Observer, Source};
pub use plugins::Plugins;
pub use scope::{Scope, ScopeObserver, ScopeSignal, ScopeSubject};
pub use serializer::DeliverySerializer;
pub use subject::{BehaviorSubject, PublishSubject};
