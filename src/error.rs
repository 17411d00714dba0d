//! Error types and error handling strategy for autodispose.
//!
//! Errors travel two different routes:
//!
//! - **Terminal errors** flow downstream to a consumer as its `on_error`
//!   event. Upstream failures, scope failures and lifecycle boundary errors
//!   take this route.
//! - **Out-of-band errors** describe a misbehaving participant. They are
//!   never delivered to a consumer (it may already be torn down) and go to
//!   the process-wide error sink in [`crate::plugins`] instead.
//!
//! # Error Kinds
//!
//! - `LifecycleNotStarted` / `LifecycleEnded`: scope resolution was attempted
//!   outside the lifecycle's valid window ([`OutsideScopeError`])
//! - `ProtocolViolation`: a source or scope attached twice, or demand was
//!   requested with a zero amount
//! - `AggregateDelivery`: a consumer callback panicked while handling a
//!   terminal event
//! - `Upstream`: any failure raised by a source or scope
//! - `PluginsLocked`: the plugin registry rejected a change after lockdown

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Lifecycle boundaries ===
    /// Scope resolution happened before the lifecycle emitted any state.
    LifecycleNotStarted,
    /// Scope resolution happened after the lifecycle reached its end.
    LifecycleEnded,

    // === Out-of-band ===
    /// A participant broke the subscription protocol.
    ProtocolViolation,
    /// A consumer callback failed while a terminal event was in flight.
    AggregateDelivery,

    // === Plugins ===
    /// The plugin registry is locked down.
    PluginsLocked,

    // === Streams ===
    /// Failure raised by a source or scope.
    Upstream,
}

impl ErrorKind {
    /// Returns true for the lifecycle boundary kinds.
    #[must_use]
    pub const fn is_outside_scope(&self) -> bool {
        matches!(self, Self::LifecycleNotStarted | Self::LifecycleEnded)
    }

    /// Returns true for kinds that are reported to the error sink rather
    /// than delivered to a consumer.
    #[must_use]
    pub const fn is_out_of_band(&self) -> bool {
        matches!(self, Self::ProtocolViolation | Self::AggregateDelivery)
    }
}

/// Scope resolution was requested outside the lifecycle's valid window.
///
/// Returned by [`crate::lifecycle::LifecycleProvider::corresponding_end`] and
/// by the scope resolver; handed to the out-of-scope handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum OutsideScopeError {
    /// No lifecycle state has been observed yet.
    #[error("lifecycle has not started")]
    NotStarted,
    /// The lifecycle is already past its terminal state.
    #[error("lifecycle has ended")]
    Ended,
}

impl OutsideScopeError {
    /// Returns the matching [`ErrorKind`].
    #[must_use]
    pub const fn kind(self) -> ErrorKind {
        match self {
            Self::NotStarted => ErrorKind::LifecycleNotStarted,
            Self::Ended => ErrorKind::LifecycleEnded,
        }
    }
}

impl From<OutsideScopeError> for Error {
    fn from(err: OutsideScopeError) -> Self {
        Self::new(err.kind()).with_message(err.to_string())
    }
}

/// The main error type for autodispose operations.
///
/// Cheap to clone: sources and causes are shared behind `Arc`, so one error
/// can be handed to a consumer and to the error sink at the same time.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    causes: Vec<Error>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
            causes: Vec::new(),
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Errors combined into this one. Only populated for
    /// [`ErrorKind::AggregateDelivery`].
    #[must_use]
    pub fn causes(&self) -> &[Error] {
        &self.causes
    }

    /// Returns true if this is a lifecycle boundary error.
    #[must_use]
    pub const fn is_outside_scope(&self) -> bool {
        self.kind.is_outside_scope()
    }

    /// Returns the boundary error this represents, if any.
    #[must_use]
    pub const fn as_outside_scope(&self) -> Option<OutsideScopeError> {
        match self.kind {
            ErrorKind::LifecycleNotStarted => Some(OutsideScopeError::NotStarted),
            ErrorKind::LifecycleEnded => Some(OutsideScopeError::Ended),
            _ => None,
        }
    }

    /// Creates an upstream failure with a message.
    #[must_use]
    pub fn upstream(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream).with_message(detail)
    }

    /// Creates a protocol violation naming the offending participant.
    #[must_use]
    pub fn protocol_violation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolViolation).with_message(detail)
    }

    /// Reports that `owner` was handed a second handle.
    #[must_use]
    pub fn subscribed_twice(owner: &str) -> Self {
        Self::protocol_violation(format!(
            "{owner} received a second subscription; it may only be subscribed once"
        ))
    }

    /// Combines errors raised while a terminal event was being delivered.
    ///
    /// `causes` is ordered: the error that was in flight first, then the
    /// failure raised by the consumer while handling it.
    #[must_use]
    pub fn aggregate(causes: Vec<Self>) -> Self {
        let message = causes
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            kind: ErrorKind::AggregateDelivery,
            message: Some(format!("{} error(s) during delivery: {message}", causes.len())),
            source: None,
            causes,
        }
    }

    /// Returns an error describing a rejected plugin change.
    #[must_use]
    pub fn plugins_locked(what: &str) -> Self {
        Self::new(ErrorKind::PluginsLocked)
            .with_message(format!("cannot change {what}: plugins are locked down"))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Some(source) = &self.source {
            return Some(source.as_ref() as _);
        }
        self.causes.first().map(|e| e as _)
    }
}

/// A specialized Result type for autodispose operations.
pub type Result<T> = core::result::Result<T, Error>;
