//! Timing guards and standard performance events.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tracing::Level;

static PERF_ENABLED: AtomicBool = AtomicBool::new(true);
/// `u64::MAX` means no threshold.
static PERF_THRESHOLD_US: AtomicU64 = AtomicU64::new(u64::MAX);

// Serialises tests that change the process-wide settings.
#[cfg(test)]
pub(crate) static SETTINGS_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Set the process-wide switch and threshold used by [`crate::perf_span!`],
/// [`crate::timed_block!`] and the `record_*` helpers.
pub fn configure_performance(enabled: bool, threshold_us: Option<u64>) {
    PERF_ENABLED.store(enabled, Ordering::Relaxed);
    PERF_THRESHOLD_US.store(threshold_us.unwrap_or(u64::MAX), Ordering::Relaxed);
}

pub fn performance_enabled() -> bool {
    PERF_ENABLED.load(Ordering::Relaxed)
}

/// Threshold applied to spans opened with [`crate::perf_span!`].
pub fn performance_threshold_us() -> Option<u64> {
    match PERF_THRESHOLD_US.load(Ordering::Relaxed) {
        u64::MAX => None,
        threshold => Some(threshold),
    }
}

/// RAII timer that logs `performance_span_complete` when dropped.
///
/// When a threshold is set, spans that finish faster are not logged. Nothing
/// is logged when performance tracing was switched off at creation time.
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    enabled: bool,
    start: Instant,
    span: tracing::Span,
    _fields: Option<tracing::span::EnteredSpan>,
}

impl PerformanceSpan {
    /// Start timing `name` at debug level.
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, name, threshold_us)
    }

    /// Start timing `name` with the span created at `level`.
    pub fn with_level(level: Level, name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let span = match level {
            Level::TRACE => tracing::trace_span!("perf", name = %name),
            Level::DEBUG => tracing::debug_span!("perf", name = %name),
            Level::INFO => tracing::info_span!("perf", name = %name),
            Level::WARN => tracing::warn_span!("perf", name = %name),
            Level::ERROR => tracing::error_span!("perf", name = %name),
        };
        Self {
            name,
            threshold_us,
            enabled: performance_enabled(),
            start: Instant::now(),
            span,
            _fields: None,
        }
    }

    /// Keep `fields` entered for the lifetime of this guard.
    pub fn with_fields(mut self, fields: tracing::Span) -> Self {
        self._fields = Some(fields.entered());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threshold_us(&self) -> Option<u64> {
        self.threshold_us
    }

    /// Microseconds since the guard was created.
    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();
        if self.enabled && self.threshold_us.is_none_or(|t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(duration_us = elapsed_us, "performance_span_complete");
        }
    }
}

/// Log a host/device transfer with its bandwidth.
///
/// `direction` is `"H2D"` or `"D2H"`.
pub fn record_transfer(bytes: usize, direction: &str, duration_us: u64) {
    if !performance_enabled() {
        return;
    }
    let bandwidth_mbps = if duration_us > 0 {
        (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
    } else {
        0.0
    };
    tracing::debug!(
        event = "transfer",
        bytes = bytes,
        direction = direction,
        duration_us = duration_us,
        bandwidth_mbps = bandwidth_mbps,
        "data_transfer"
    );
}

/// Log how many indices a schedule call processed and how fast.
pub fn record_throughput(operation: &str, elements: u64, duration_us: u64) {
    if !performance_enabled() {
        return;
    }
    let elements_per_sec = if duration_us > 0 {
        (elements as f64 / duration_us as f64) * 1_000_000.0
    } else {
        0.0
    };
    tracing::debug!(
        event = "throughput",
        operation = operation,
        elements = elements,
        duration_us = duration_us,
        elements_per_sec = elements_per_sec,
        "operation_throughput"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
    use tracing_subscriber::Registry;

    struct CountEvents(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for CountEvents {
        fn on_event(&self, _event: &Event<'_>, _ctx: Context<'_, S>) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn events_during(f: impl FnOnce()) -> usize {
        let count = Arc::new(AtomicUsize::new(0));
        let subscriber = Registry::default().with(CountEvents(Arc::clone(&count)));
        tracing::subscriber::with_default(subscriber, f);
        count.load(Ordering::Relaxed)
    }

    #[test]
    fn configured_threshold_gates_perf_spans() {
        let _guard = SETTINGS_LOCK.lock().unwrap();
        configure_performance(true, None);
        assert_eq!(events_during(|| drop(crate::perf_span!("fast", n = 1_u64))), 1);

        configure_performance(true, Some(60_000_000));
        let span = crate::perf_span!("fast");
        assert_eq!(span.threshold_us(), Some(60_000_000));
        assert_eq!(events_during(move || drop(span)), 0);

        configure_performance(true, None);
    }

    #[test]
    fn disabled_performance_tracing_is_silent() {
        let _guard = SETTINGS_LOCK.lock().unwrap();
        configure_performance(false, Some(5));
        assert!(!performance_enabled());
        let events = events_during(|| {
            let _span = crate::perf_span!("off");
            let (value, us) = crate::timed_block!("off", { 2_u64 + 2 });
            record_throughput("off", value, us);
            record_transfer(64, "H2D", us);
        });
        configure_performance(true, None);
        assert_eq!(events, 0);
        assert_eq!(performance_threshold_us(), None);
    }

    #[test]
    fn span_keeps_name_and_threshold() {
        let span = PerformanceSpan::new("scan", Some(10));
        assert_eq!(span.name(), "scan");
        assert_eq!(span.threshold_us(), Some(10));
    }

    #[test]
    fn span_elapsed_grows() {
        let span = PerformanceSpan::with_level(Level::INFO, "sleepy", None);
        thread::sleep(Duration::from_millis(2));
        assert!(span.elapsed_us() >= 2_000);
    }

    #[test]
    fn record_helpers_tolerate_zero_duration() {
        record_transfer(4096, "H2D", 0);
        record_throughput("schedule", 1024, 0);
    }
}
