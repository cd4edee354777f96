//! Timing guards and standard performance events.
//!
//! ```rust
//! use manifold_tracing::performance::{record_transfer, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("vector_assign", Some(100));
//! // ... enqueue work ...
//! drop(span); // logged only if it took at least 100us
//!
//! record_transfer(4096, "H2D", 250);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::Level;

static ENABLED: AtomicBool = AtomicBool::new(true);
static GLOBAL_THRESHOLD_US: AtomicU64 = AtomicU64::new(0);

/// Toggle performance spans process-wide. Called by
/// [`crate::init_global_tracing`].
pub fn set_enabled(enabled: bool, threshold_us: Option<u64>) {
    ENABLED.store(enabled, Ordering::Relaxed);
    GLOBAL_THRESHOLD_US.store(threshold_us.unwrap_or(0), Ordering::Relaxed);
}

/// Whether performance spans currently report anything.
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// RAII guard that reports its lifetime when dropped.
///
/// Nothing is reported when performance tracing is disabled or when the
/// span is shorter than both its own threshold and the global one.
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        Self::with_level(Level::DEBUG, name, threshold_us)
    }

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
            start: Instant::now(),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if !is_enabled() {
            return;
        }

        let elapsed_us = self.elapsed_us();
        let threshold = self
            .threshold_us
            .unwrap_or(0)
            .max(GLOBAL_THRESHOLD_US.load(Ordering::Relaxed));

        if elapsed_us >= threshold {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

fn per_second(amount: f64, duration_us: u64) -> f64 {
    if duration_us == 0 {
        0.0
    } else {
        amount / duration_us as f64 * 1_000_000.0
    }
}

/// Host/device transfer. `direction` is `H2D`, `D2H` or `D2D`.
pub fn record_transfer(bytes: usize, direction: &str, duration_us: u64) {
    let bandwidth_mbps = per_second(bytes as f64, duration_us) / (1024.0 * 1024.0);

    tracing::debug!(
        event = "transfer",
        bytes = bytes,
        direction = direction,
        duration_us = duration_us,
        bandwidth_mbps = bandwidth_mbps,
        "data_transfer"
    );
}

/// Kernel source generation plus runtime build for one device context.
pub fn record_compilation(kernel: &str, source_bytes: usize, work_group_size: usize, duration_us: u64) {
    tracing::debug!(
        event = "compilation",
        kernel = kernel,
        source_bytes = source_bytes,
        work_group_size = work_group_size,
        duration_us = duration_us,
        "kernel_compiled"
    );
}

/// Elementwise throughput of an enqueued operation.
pub fn record_throughput(operation: &str, elements: usize, duration_us: u64) {
    let elements_per_sec = per_second(elements as f64, duration_us);

    tracing::debug!(
        event = "throughput",
        operation = operation,
        elements = elements,
        duration_us = duration_us,
        melems_per_sec = elements_per_sec / 1_000_000.0,
        "operation_throughput"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn span_keeps_name_and_threshold() {
        let span = PerformanceSpan::new("assign", Some(1000));
        assert_eq!(span.name(), "assign");
        assert_eq!(span.threshold_us, Some(1000));
    }

    #[test]
    fn span_measures_elapsed_time() {
        let span = PerformanceSpan::with_level(Level::INFO, "sleep", None);
        thread::sleep(Duration::from_millis(5));
        assert!(span.elapsed_us() >= 5_000);
    }

    #[test]
    fn per_second_handles_zero_duration() {
        assert_eq!(per_second(1024.0, 0), 0.0);
        assert!((per_second(1_000_000.0, 1000) - 1_000_000_000.0).abs() < 1.0);
    }

    #[test]
    fn record_helpers_do_not_panic() {
        record_transfer(4096, "H2D", 250);
        record_compilation("vexpr_f64_plus_v_v", 512, 256, 1200);
        record_throughput("assign", 1 << 20, 800);
    }
}
