//! Logging facade used by the coordinator, resolver and plugins.
//!
//! With the `tracing-integration` feature (on by default) the macros below
//! are the `tracing` macros. Without it they expand to nothing, so the hot
//! delivery paths carry no logging cost at all.
//!
//! ```rust,ignore
//! use crate::tracing_compat::{debug, trace};
//!
//! trace!(slot = "main", "handle armed");
//! debug!(signal = ?signal, "scope signalled");
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    /// No-op trace-level logging macro.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op debug-level logging macro.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op warn-level logging macro.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }

    /// No-op error-level logging macro.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    pub use crate::{debug, error, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::*;
