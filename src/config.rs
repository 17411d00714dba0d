//! Configuration for scope resolution and the plugin registry.
//!
//! [`ResolveOptions`] controls which lifecycle boundaries the scope resolver
//! enforces. [`PluginsConfig`] is read from the environment once, when the
//! global plugin registry is first touched.

use std::env;

/// Environment variable that locks the global plugin registry at startup.
pub const LOCKDOWN_ENV: &str = "AUTODISPOSE_LOCKDOWN";

/// Boundary checks applied when a scope is resolved from a lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolveOptions {
    /// Fail with `LifecycleNotStarted` when no state was observed yet.
    pub check_start_boundary: bool,
    /// Fail with `LifecycleEnded` at resolution time when the current state
    /// has no corresponding end. When `false`, the failure is deferred to
    /// subscription time and routed through the out-of-scope handler.
    pub check_end_boundary: bool,
}

impl ResolveOptions {
    /// Both boundaries checked.
    pub const STRICT: Self = Self {
        check_start_boundary: true,
        check_end_boundary: true,
    };

    /// Neither boundary checked eagerly.
    pub const LENIENT: Self = Self {
        check_start_boundary: false,
        check_end_boundary: false,
    };

    /// Creates the default (strict) options.
    #[must_use]
    pub const fn new() -> Self {
        Self::STRICT
    }

    /// Sets the start-boundary check.
    #[must_use]
    pub const fn check_start_boundary(mut self, check: bool) -> Self {
        self.check_start_boundary = check;
        self
    }

    /// Sets the end-boundary check.
    #[must_use]
    pub const fn check_end_boundary(mut self, check: bool) -> Self {
        self.check_end_boundary = check;
        self
    }
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self::STRICT
    }
}

/// Startup settings for the global plugin registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginsConfig {
    /// Lock the registry as soon as it is created.
    pub lockdown: bool,
}

impl PluginsConfig {
    /// Reads [`LOCKDOWN_ENV`]. `1`, `true`, `yes` and `on` (any case) enable
    /// lockdown; anything else, or an unset variable, leaves it off.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            lockdown: env::var(LOCKDOWN_ENV)
                .ok()
                .is_some_and(|value| parse_flag(&value)),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
