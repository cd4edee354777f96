//! Runtime configuration resolved once from the environment
//!
//! | Variable | Values | Default |
//! |----------|--------|---------|
//! | `MANIFOLD_SHOW_KERNELS` | `1`/`true`/`yes` | off |
//! | `MANIFOLD_PARTITION` | `perf`, `equal` | `perf` |
//! | `MANIFOLD_ALIGNMENT` | positive integer | `16` |
//!
//! Unparseable values fall back to the default with a warning.

use std::env;
use std::sync::OnceLock;

use serde::Serialize;

/// Default partition granularity in elements.
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Policy used when no partitioning function was installed explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionPolicy {
    /// Proportional to measured vector throughput.
    #[default]
    Perf,
    /// Equal chunks.
    Equal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeConfig {
    /// Print generated kernel source to stdout before building it.
    pub show_kernels: bool,
    pub partition: PartitionPolicy,
    /// Partition boundaries are multiples of this many elements.
    pub alignment: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_kernels: false,
            partition: PartitionPolicy::Perf,
            alignment: DEFAULT_ALIGNMENT,
        }
    }
}

impl RuntimeConfig {
    /// Configuration for this process, read from the environment on first use.
    pub fn global() -> &'static RuntimeConfig {
        static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();
        CONFIG.get_or_init(|| {
            let config = Self::from_env();
            tracing::debug!(config = %config.to_json(), "runtime_config_resolved");
            config
        })
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Resolve from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(value) = lookup("MANIFOLD_SHOW_KERNELS") {
            config.show_kernels = matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }

        if let Some(value) = lookup("MANIFOLD_PARTITION") {
            match value.trim().to_ascii_lowercase().as_str() {
                "perf" => config.partition = PartitionPolicy::Perf,
                "equal" => config.partition = PartitionPolicy::Equal,
                other => tracing::warn!(value = other, "unknown MANIFOLD_PARTITION, using perf"),
            }
        }

        if let Some(value) = lookup("MANIFOLD_ALIGNMENT") {
            match value.trim().parse::<usize>() {
                Ok(alignment) if alignment > 0 => config.alignment = alignment,
                _ => tracing::warn!(value = %value, "invalid MANIFOLD_ALIGNMENT, using the default"),
            }
        }

        config
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(vars: &[(&str, &str)]) -> RuntimeConfig {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        RuntimeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        assert_eq!(resolve(&[]), RuntimeConfig::default());
    }

    #[test]
    fn reads_every_variable() {
        let config = resolve(&[
            ("MANIFOLD_SHOW_KERNELS", "true"),
            ("MANIFOLD_PARTITION", "Equal"),
            ("MANIFOLD_ALIGNMENT", "64"),
        ]);
        assert!(config.show_kernels);
        assert_eq!(config.partition, PartitionPolicy::Equal);
        assert_eq!(config.alignment, 64);
    }

    #[test]
    fn bad_values_fall_back() {
        let config = resolve(&[("MANIFOLD_PARTITION", "random"), ("MANIFOLD_ALIGNMENT", "0")]);
        assert_eq!(config.partition, PartitionPolicy::Perf);
        assert_eq!(config.alignment, DEFAULT_ALIGNMENT);
    }

    #[test]
    fn serializes_for_logging() {
        let json = RuntimeConfig::default().to_json();
        assert_eq!(json, r#"{"show_kernels":false,"partition":"perf","alignment":16}"#);
    }
}
