//! Instrumentation macros used by the device adapters.

/// Open a [`crate::performance::PerformanceSpan`] that logs its duration on drop.
///
/// The span uses the threshold set by [`crate::performance::configure_performance`].
///
/// ```text
/// let _span = perf_span!("schedule_1d", device = "serial", n = 1024);
/// ```
///
/// Extra fields are attached to an entered `debug_span!` named `perf`.
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, $crate::performance::performance_threshold_us())
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        $crate::performance::PerformanceSpan::new($name, $crate::performance::performance_threshold_us())
            .with_fields(::tracing::debug_span!("perf", name = $name, $($field = $value),+))
    }};
}

/// Emit a debug event tagged with `event = name`.
///
/// ```text
/// perf_event!("dispatch", offset = 0, blocks = 512);
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        ::tracing::debug!(event = $name, $($field = $value),+)
    };
}

/// Time a block, returning `(result, duration_us)`.
///
/// ```text
/// let (sum, us) = timed_block!("reduce", { values.iter().sum::<i64>() });
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = ::std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        if $crate::performance::performance_enabled() {
            ::tracing::debug!(operation = $name, duration_us = duration_us, "timed_block_complete");
        }
        (result, duration_us)
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn perf_span_variants_build() {
        let plain = perf_span!("plain");
        let fielded = perf_span!("fielded", n = 16_u64, device = "serial");
        assert_eq!(plain.name(), "plain");
        assert_eq!(fielded.name(), "fielded");
    }

    #[test]
    fn perf_event_accepts_mixed_fields() {
        perf_event!("dispatch", offset = 0_i64, blocks = 12_u64, device = "accelerator");
    }

    #[test]
    fn timed_block_returns_value() {
        let (value, _us) = timed_block!("sum", { (1..=10).sum::<i32>() });
        assert_eq!(value, 55);
    }

    #[test]
    fn timed_block_measures_sleep() {
        let ((), us) = timed_block!("sleep", {
            std::thread::sleep(std::time::Duration::from_millis(5));
        });
        assert!(us >= 5_000);
    }
}
