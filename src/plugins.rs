//! Process-wide plugin registry.
//!
//! Two hooks live here:
//!
//! - the **out-of-scope handler**, consulted whenever a deferred scope hits a
//!   lifecycle boundary error. Returning `Ok(())` swallows the error (the
//!   attachment becomes a silent no-op); returning `Err(e)` makes `e` the
//!   consumer's error terminal. Without a handler the boundary error itself
//!   is delivered.
//! - the **error sink**, which receives out-of-band errors (protocol
//!   violations, aggregate delivery failures, undeliverable errors). Without
//!   a sink they are logged at `error` level.
//!
//! The registry can be locked down; after that every change is rejected with
//! [`ErrorKind::PluginsLocked`](crate::error::ErrorKind::PluginsLocked).
//! Reads stay concurrent.

use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::config::PluginsConfig;
use crate::error::{Error, OutsideScopeError, Result};
use crate::tracing_compat::{debug, error};

/// Decides what happens to a lifecycle boundary error.
pub type OutsideScopeHandler = Arc<dyn Fn(OutsideScopeError) -> Result<()> + Send + Sync>;

/// Receives errors that cannot be delivered to a consumer.
pub type ErrorSink = Arc<dyn Fn(&Error) + Send + Sync>;

/// A plugin registry. The crate consults [`Plugins::global`]; separate
/// instances exist for embedding and testing.
pub struct Plugins {
    locked: AtomicBool,
    outside_scope: RwLock<Option<OutsideScopeHandler>>,
    error_sink: RwLock<Option<ErrorSink>>,
}

impl Plugins {
    /// Creates an unlocked registry with no hooks installed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            outside_scope: RwLock::new(None),
            error_sink: RwLock::new(None),
        }
    }

    /// The process-wide registry, configured from [`PluginsConfig::from_env`]
    /// on first access.
    pub fn global() -> &'static Arc<Self> {
        static GLOBAL: OnceLock<Arc<Plugins>> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let plugins = Self::new();
            if PluginsConfig::from_env().lockdown {
                plugins.lockdown();
            }
            Arc::new(plugins)
        })
    }

    /// Prevents any further change to this registry.
    pub fn lockdown(&self) {
        self.locked.store(true, Ordering::SeqCst);
        debug!("plugins locked down");
    }

    /// Returns true once [`lockdown`](Self::lockdown) ran.
    #[must_use]
    pub fn is_locked_down(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Installs the out-of-scope handler, replacing any previous one.
    pub fn set_outside_scope_handler<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(OutsideScopeError) -> Result<()> + Send + Sync + 'static,
    {
        self.replace(&self.outside_scope, Some(Arc::new(handler)), "outside-scope handler")
    }

    /// Removes the out-of-scope handler.
    pub fn clear_outside_scope_handler(&self) -> Result<()> {
        self.replace(&self.outside_scope, None, "outside-scope handler")
    }

    /// Returns the installed out-of-scope handler, if any.
    #[must_use]
    pub fn outside_scope_handler(&self) -> Option<OutsideScopeHandler> {
        self.outside_scope.read().clone()
    }

    /// Routes a boundary error through the handler.
    ///
    /// `Ok(())` means the error was swallowed. `Err(e)` is the error the
    /// consumer should see: the boundary error itself when no handler is
    /// installed, otherwise whatever the handler returned.
    pub fn intercept_outside_scope(&self, err: OutsideScopeError) -> Result<()> {
        match self.outside_scope_handler() {
            Some(handler) => {
                let outcome = handler(err);
                debug!(error = %err, swallowed = outcome.is_ok(), "outside-scope handler consulted");
                outcome
            }
            None => Err(err.into()),
        }
    }

    /// Installs the error sink, replacing any previous one.
    pub fn set_error_sink<F>(&self, sink: F) -> Result<()>
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.replace(&self.error_sink, Some(Arc::new(sink)), "error sink")
    }

    /// Removes the error sink.
    pub fn clear_error_sink(&self) -> Result<()> {
        self.replace(&self.error_sink, None, "error sink")
    }

    /// Hands an out-of-band error to the sink, or logs it.
    pub fn report(&self, err: Error) {
        let sink = self.error_sink.read().clone();
        match sink {
            Some(sink) => sink(&err),
            None => error!(kind = ?err.kind(), error = %err, "undeliverable error"),
        }
    }

    fn replace<H>(&self, cell: &RwLock<Option<H>>, value: Option<H>, what: &str) -> Result<()> {
        let mut guard = cell.write();
        if self.is_locked_down() {
            return Err(Error::plugins_locked(what));
        }
        *guard = value;
        Ok(())
    }
}

impl Default for Plugins {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Plugins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugins")
            .field("locked", &self.is_locked_down())
            .field("outside_scope_handler", &self.outside_scope.read().is_some())
            .field("error_sink", &self.error_sink.read().is_some())
            .finish()
    }
}

/// Installs the global out-of-scope handler.
pub fn set_outside_scope_handler<F>(handler: F) -> Result<()>
where
    F: Fn(OutsideScopeError) -> Result<()> + Send + Sync + 'static,
{
    Plugins::global().set_outside_scope_handler(handler)
}

/// Removes the global out-of-scope handler.
pub fn clear_outside_scope_handler() -> Result<()> {
    Plugins::global().clear_outside_scope_handler()
}

/// Returns the global out-of-scope handler, if any.
#[must_use]
pub fn outside_scope_handler() -> Option<OutsideScopeHandler> {
    Plugins::global().outside_scope_handler()
}

/// Installs the global error sink.
pub fn set_error_sink<F>(sink: F) -> Result<()>
where
    F: Fn(&Error) + Send + Sync + 'static,
{
    Plugins::global().set_error_sink(sink)
}

/// Removes the global error sink.
pub fn clear_error_sink() -> Result<()> {
    Plugins::global().clear_error_sink()
}

/// Locks the global registry.
pub fn lockdown() {
    Plugins::global().lockdown();
}

/// Returns true if the global registry is locked.
#[must_use]
pub fn is_locked_down() -> bool {
    Plugins::global().is_locked_down()
}

/// Reports an out-of-band error to the global sink.
pub fn report(err: Error) {
    Plugins::global().report(err);
}
