//! Shorthands for the guards in [`crate::performance`].

/// Open a [`crate::performance::PerformanceSpan`]. Extra fields are logged
/// once at debug level when the span opens.
///
/// ```rust
/// use manifold_tracing::perf_span;
///
/// let _span = perf_span!("spmv", rows = 1024, nnz = 5120);
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        $crate::debug!(operation = $name, $($field = $value),+, "perf_span_open");
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

/// Evaluate a block and return `(value, elapsed_us)`, logging the timing.
///
/// ```rust
/// use manifold_tracing::timed_block;
///
/// let (sum, _us) = timed_block!("host_sum", { (1..=100).sum::<i32>() });
/// assert_eq!(sum, 5050);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        $crate::debug!(operation = $name, duration_us = duration_us, "timed_block_complete");
        (result, duration_us)
    }};
}
