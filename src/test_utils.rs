//! Test utilities for autodispose unit tests.
//!
//! - tracing-based logging initialization
//! - phase/section macros for readable test output
//! - a recording observer and a recording scope observer
//! - a shared error-sink capture for out-of-band reports

use parking_lot::Mutex;
use std::sync::{Arc, Once, OnceLock};
use tracing_subscriber::fmt::format::FmtSpan;

use crate::error::{Error, ErrorKind};
use crate::handle::{Cancellable, Handle};
use crate::observer::{Observer, Source};
use crate::plugins;
use crate::scope::{ScopeObserver, ScopeSignal};

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
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

/// One recorded observer event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<T> {
    /// A value.
    Next(T),
    /// An error terminal, by kind.
    Error(ErrorKind),
    /// A completion terminal.
    Complete,
}

/// Observer that records everything it receives.
pub struct RecordingObserver<T> {
    events: Mutex<Vec<Event<T>>>,
    errors: Mutex<Vec<Error>>,
    handle: Mutex<Option<Handle>>,
    subscriptions: Mutex<usize>,
}

impl<T> RecordingObserver<T> {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            handle: Mutex::new(None),
            subscriptions: Mutex::new(0),
        }
    }

    /// Creates an empty recorder behind an `Arc`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// The handle passed to `on_subscribe`, if any.
    #[must_use]
    pub fn handle(&self) -> Option<Handle> {
        self.handle.lock().clone()
    }

    /// Number of `on_subscribe` calls.
    #[must_use]
    pub fn subscriptions(&self) -> usize {
        *self.subscriptions.lock()
    }

    /// Errors received, in order.
    #[must_use]
    pub fn errors(&self) -> Vec<Error> {
        self.errors.lock().clone()
    }

    /// Number of completions received.
    #[must_use]
    pub fn completions(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::Complete))
            .count()
    }

    /// Number of terminal events received.
    #[must_use]
    pub fn terminals(&self) -> usize {
        self.completions() + self.errors.lock().len()
    }
}

impl<T: Clone> RecordingObserver<T> {
    /// Everything received, in order.
    #[must_use]
    pub fn events(&self) -> Vec<Event<T>> {
        self.events.lock().clone()
    }

    /// Values received, in order.
    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Next(v) => Some(v.clone()),
                _ => None,
            })
            .collect()
    }
}

impl<T> Default for RecordingObserver<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Observer<T> for RecordingObserver<T> {
    fn on_subscribe(&self, handle: Handle) {
        *self.subscriptions.lock() += 1;
        *self.handle.lock() = Some(handle);
    }

    fn on_next(&self, value: T) {
        self.events.lock().push(Event::Next(value));
    }

    fn on_error(&self, error: Error) {
        self.events.lock().push(Event::Error(error.kind()));
        self.errors.lock().push(error);
    }

    fn on_complete(&self) {
        self.events.lock().push(Event::Complete);
    }
}

/// Scope observer that records its handle and signals.
#[derive(Default)]
pub struct RecordingScopeObserver {
    handle: Mutex<Option<Handle>>,
    signals: Mutex<Vec<ScopeSignal>>,
}

impl RecordingScopeObserver {
    /// Creates an empty recorder behind an `Arc`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Signals received, in order.
    #[must_use]
    pub fn signals(&self) -> Vec<ScopeSignal> {
        self.signals.lock().clone()
    }

    /// The handle passed to `on_subscribe`, if any.
    #[must_use]
    pub fn handle(&self) -> Option<Handle> {
        self.handle.lock().clone()
    }
}

impl ScopeObserver for RecordingScopeObserver {
    fn on_subscribe(&self, handle: Handle) {
        *self.handle.lock() = Some(handle);
    }

    fn on_signal(&self, signal: ScopeSignal) {
        self.signals.lock().push(signal);
    }
}

/// View over every error reported to the global error sink by this test
/// binary.
///
/// Tests run in parallel and share the sink, so assertions filter by a
/// marker string unique to the test.
#[derive(Clone)]
pub struct ReportLog {
    log: Arc<Mutex<Vec<Error>>>,
}

impl ReportLog {
    /// Reports whose rendering (including aggregated causes) contains
    /// `needle`.
    #[must_use]
    pub fn matching(&self, needle: &str) -> Vec<Error> {
        self.log
            .lock()
            .iter()
            .filter(|e| e.to_string().contains(needle))
            .cloned()
            .collect()
    }
}

/// Installs (once) a recording global error sink and returns a view of it.
pub fn capture_reports() -> ReportLog {
    static LOG: OnceLock<Arc<Mutex<Vec<Error>>>> = OnceLock::new();
    let log = LOG.get_or_init(|| {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        plugins::set_error_sink(move |e| sink.lock().push(e.clone()))
            .expect("global plugins must not be locked in unit tests");
        log
    });
    ReportLog {
        log: Arc::clone(log),
    }
}

/// Source that records observers without subscribing them; tests drive
/// `on_subscribe` and events by hand.
pub struct ManualSource<T> {
    observers: Mutex<Vec<Arc<dyn Observer<T>>>>,
}

impl<T> ManualSource<T> {
    /// Creates a source with no observers, behind an `Arc`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            observers: Mutex::new(Vec::new()),
        })
    }

    /// The `index`-th observer that subscribed.
    #[must_use]
    pub fn observer(&self, index: usize) -> Option<Arc<dyn Observer<T>>> {
        self.observers.lock().get(index).cloned()
    }
}

impl<T> Source<T> for ManualSource<T> {
    fn subscribe(&self, observer: Arc<dyn Observer<T>>) {
        self.observers.lock().push(observer);
    }
}

/// Handle that records cancellation and demand.
#[derive(Default)]
pub struct TrackingHandle {
    cancels: Mutex<usize>,
    requests: Mutex<Vec<u64>>,
}

impl TrackingHandle {
    /// Creates a handle behind an `Arc`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of `cancel` calls.
    #[must_use]
    pub fn cancels(&self) -> usize {
        *self.cancels.lock()
    }

    /// Demand requests, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<u64> {
        self.requests.lock().clone()
    }
}

impl Cancellable for TrackingHandle {
    fn cancel(&self) {
        *self.cancels.lock() += 1;
    }

    fn is_cancelled(&self) -> bool {
        *self.cancels.lock() > 0
    }

    fn request(&self, n: u64) {
        self.requests.lock().push(n);
    }
}
