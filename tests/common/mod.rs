#![allow(dead_code)]
#![allow(unused_imports)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use autodispose::{Cancellable, Error, ErrorKind, Handle, Observer, Source};
use parking_lot::Mutex;
use proptest::prelude::ProptestConfig;
use proptest::test_runner::RngSeed;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once, OnceLock};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Default seed for property tests when running under CI.
pub const DEFAULT_PROPTEST_SEED: u64 = 0x5EED_5EED;

const PROPTEST_SEED_ENV: &str = "AUTODISPOSE_PROPTEST_SEED";
const PROPTEST_MAX_SHRINK_ITERS_ENV: &str = "AUTODISPOSE_PROPTEST_MAX_SHRINK_ITERS";

/// Configuration for property tests with optional deterministic seed support.
#[derive(Debug, Clone)]
pub struct PropertyTestConfig {
    /// Fixed seed for reproducibility (overrides CI default when set).
    pub seed: Option<u64>,
    /// Number of successful cases required.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl PropertyTestConfig {
    /// Build a config with defaults for property tests.
    #[must_use]
    pub fn new(cases: u32) -> Self {
        Self {
            seed: read_proptest_seed(),
            cases,
            max_shrink_iters: read_max_shrink_iters()
                .unwrap_or(ProptestConfig::default().max_shrink_iters),
        }
    }

    /// Convert into a ProptestConfig, applying deterministic seed rules.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        let mut config = ProptestConfig::with_cases(self.cases);

        // Honor existing PROPTEST_RNG_SEED, otherwise apply our own.
        if matches!(config.rng_seed, RngSeed::Random) {
            if let Some(seed) = self.seed {
                config.rng_seed = RngSeed::Fixed(seed);
            }
        }

        config.max_shrink_iters = self.max_shrink_iters;
        config
    }
}

/// Build a ProptestConfig with deterministic seed support for CI.
#[must_use]
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    PropertyTestConfig::new(cases).to_proptest_config()
}

fn read_proptest_seed() -> Option<u64> {
    if let Ok(value) = std::env::var(PROPTEST_SEED_ENV) {
        return value.parse::<u64>().ok();
    }

    // If CI is set and no explicit seed is provided, use a fixed seed.
    if std::env::var("CI").is_ok() {
        return Some(DEFAULT_PROPTEST_SEED);
    }

    None
}

fn read_max_shrink_iters() -> Option<u32> {
    std::env::var(PROPTEST_MAX_SHRINK_ITERS_ENV)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
}

/// Initialize test logging with trace-level output.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion with summary.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
    ($name:expr, $($key:ident = $value:expr),* $(,)?) => {
        tracing::info!(
            test = %$name,
            $($key = %$value,)*
            "test completed successfully: {}",
            $name
        );
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

/// One observed consumer event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen<T> {
    /// A value.
    Next(T),
    /// An error terminal, by kind.
    Error(ErrorKind),
    /// A completion terminal.
    Complete,
}

/// Consumer that records every event.
pub struct Recorder<T> {
    seen: Mutex<Vec<Seen<T>>>,
    errors: Mutex<Vec<Error>>,
    handle: Mutex<Option<Handle>>,
}

impl<T> Recorder<T> {
    /// Creates a recorder behind an `Arc`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            handle: Mutex::new(None),
        })
    }

    /// The handle received in `on_subscribe`.
    #[must_use]
    pub fn handle(&self) -> Option<Handle> {
        self.handle.lock().clone()
    }

    /// Errors received.
    #[must_use]
    pub fn errors(&self) -> Vec<Error> {
        self.errors.lock().clone()
    }

    /// Number of terminal events received.
    #[must_use]
    pub fn terminals(&self) -> usize {
        self.seen
            .lock()
            .iter()
            .filter(|s| !matches!(s, Seen::Next(_)))
            .count()
    }
}

impl<T: Clone> Recorder<T> {
    /// Everything received, in order.
    #[must_use]
    pub fn seen(&self) -> Vec<Seen<T>> {
        self.seen.lock().clone()
    }

    /// Values received, in order.
    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.seen
            .lock()
            .iter()
            .filter_map(|s| match s {
                Seen::Next(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }
}

impl<T: Send> Observer<T> for Recorder<T> {
    fn on_subscribe(&self, handle: Handle) {
        *self.handle.lock() = Some(handle);
    }

    fn on_next(&self, value: T) {
        self.seen.lock().push(Seen::Next(value));
    }

    fn on_error(&self, error: Error) {
        self.seen.lock().push(Seen::Error(error.kind()));
        self.errors.lock().push(error);
    }

    fn on_complete(&self) {
        self.seen.lock().push(Seen::Complete);
    }
}

/// Upstream whose handle is delivered when the test says so.
pub struct DelayedSource<T> {
    observer: Mutex<Option<Arc<dyn Observer<T>>>>,
}

impl<T> DelayedSource<T> {
    /// Creates a source with nothing attached.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            observer: Mutex::new(None),
        })
    }

    /// The attached observer.
    ///
    /// # Panics
    ///
    /// Panics if nothing subscribed.
    #[must_use]
    pub fn observer(&self) -> Arc<dyn Observer<T>> {
        self.observer.lock().clone().expect("nothing subscribed")
    }

    /// Returns true once something subscribed.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.observer.lock().is_some()
    }
}

impl<T> Source<T> for DelayedSource<T> {
    fn subscribe(&self, observer: Arc<dyn Observer<T>>) {
        *self.observer.lock() = Some(observer);
    }
}

/// Handle counting how often its resource was released and how much demand
/// reached it.
#[derive(Default)]
pub struct CountingHandle {
    releases: AtomicUsize,
    requests: Mutex<Vec<u64>>,
}

impl CountingHandle {
    /// Creates a handle behind an `Arc`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of `cancel` calls.
    #[must_use]
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Demand requests, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<u64> {
        self.requests.lock().clone()
    }
}

impl Cancellable for CountingHandle {
    fn cancel(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.releases() > 0
    }

    fn request(&self, n: u64) {
        self.requests.lock().push(n);
    }
}

/// Every error this test binary reported to the global error sink.
#[derive(Clone)]
pub struct Reports {
    log: Arc<Mutex<Vec<Error>>>,
}

impl Reports {
    /// Reports whose rendering contains `needle`.
    #[must_use]
    pub fn matching(&self, needle: &str) -> Vec<Error> {
        self.log
            .lock()
            .iter()
            .filter(|e| e.to_string().contains(needle))
            .cloned()
            .collect()
    }

    /// Reports of `kind`.
    #[must_use]
    pub fn of_kind(&self, kind: ErrorKind) -> Vec<Error> {
        self.log
            .lock()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }
}

/// Installs (once per binary) a recording global error sink.
pub fn capture_reports() -> Reports {
    static LOG: OnceLock<Arc<Mutex<Vec<Error>>>> = OnceLock::new();
    let log = LOG.get_or_init(|| {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        autodispose::plugins::set_error_sink(move |e| sink.lock().push(e.clone()))
            .expect("plugins unlocked at startup");
        log
    });
    Reports {
        log: Arc::clone(log),
    }
}
