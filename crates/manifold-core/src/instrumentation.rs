//! Compilation and execution metrics
//!
//! Both kinds are emitted as structured `tracing` events and can be
//! serialized for collection by external tools.
//!
//! ```rust
//! use manifold_core::instrumentation::ExecutionMetrics;
//!
//! let start = std::time::Instant::now();
//! // ... enqueue work ...
//! let metrics = ExecutionMetrics::new("vector_add", 1 << 20, 2, start);
//! metrics.log();
//! ```

use std::time::Instant;

use serde::Serialize;

/// One kernel built for one context.
#[derive(Debug, Clone, Serialize)]
pub struct CompilationMetrics {
    pub kernel: String,
    pub context: u64,
    pub source_bytes: usize,
    pub work_group_size: usize,
    /// Build plus kernel creation, microseconds.
    pub duration_us: u64,
}

impl CompilationMetrics {
    pub fn new(kernel: &str, context: u64, source_bytes: usize, work_group_size: usize, start: Instant) -> Self {
        Self {
            kernel: kernel.to_string(),
            context,
            source_bytes,
            work_group_size,
            duration_us: start.elapsed().as_micros() as u64,
        }
    }

    pub fn log(&self) {
        manifold_tracing::performance::record_compilation(
            &self.kernel,
            self.source_bytes,
            self.work_group_size,
            self.duration_us,
        );
        tracing::debug!(
            kernel = %self.kernel,
            context = self.context,
            source_bytes = self.source_bytes,
            duration_us = self.duration_us,
            "kernel_compiled"
        );
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// One operation enqueued across every device of its target.
///
/// The duration covers enqueueing only; devices may still be running.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionMetrics {
    pub operation: String,
    pub elements: usize,
    pub launches: usize,
    pub duration_us: u64,
}

impl ExecutionMetrics {
    pub fn new(operation: &str, elements: usize, launches: usize, start: Instant) -> Self {
        Self {
            operation: operation.to_string(),
            elements,
            launches,
            duration_us: start.elapsed().as_micros() as u64,
        }
    }

    pub fn log(&self) {
        tracing::debug!(
            operation = %self.operation,
            elements = self.elements,
            launches = self.launches,
            duration_us = self.duration_us,
            "expression_dispatched"
        );
        manifold_tracing::performance::record_throughput(&self.operation, self.elements, self.duration_us);
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
