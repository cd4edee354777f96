//! Shared tracing configuration for the manifold workspace.
//!
//! Every binary, test and bench that wants log output installs its
//! subscriber through this crate so that filters, output formats and
//! redaction behave the same everywhere.
//!
//! ```no_run
//! use manifold_tracing::{init_global_tracing, TracingConfig};
//!
//! let config = TracingConfig::from_env();
//! init_global_tracing(&config).expect("subscriber already installed");
//! ```

pub mod performance;
mod redact;

#[macro_use]
pub mod macros;

use std::collections::HashSet;
use std::env;
use std::sync::Arc;

pub use tracing::{debug, error, info, trace, warn};

use redact::{JsonRedactingFields, TextRedactingFields};
use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter, Registry};

/// Environment variable selecting a preset: `local`, `ci` or `performance`.
pub const ENV_PROFILE: &str = "MANIFOLD_TRACING_PROFILE";
/// Environment variable overriding the filter directives.
pub const ENV_DIRECTIVES: &str = "MANIFOLD_TRACING_DIRECTIVES";
/// Environment variable selecting `pretty`, `compact` or `json` output.
pub const ENV_FORMAT: &str = "MANIFOLD_TRACING_FORMAT";
/// Comma-separated field names whose values are masked.
pub const ENV_REDACT_FIELDS: &str = "MANIFOLD_TRACING_REDACT_FIELDS";
/// Replacement text for masked values.
pub const ENV_REDACT_TOKEN: &str = "MANIFOLD_TRACING_REDACT_TOKEN";
/// `true`/`1`/`yes` enables performance spans.
pub const ENV_PERF_TRACING: &str = "MANIFOLD_PERF_TRACING";
/// Minimum span duration (microseconds) worth logging.
pub const ENV_PERF_THRESHOLD_US: &str = "MANIFOLD_PERF_THRESHOLD_US";

/// How the process-wide subscriber should behave.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Explicit filter directives (e.g. `manifold_core=debug,info`). When
    /// absent `RUST_LOG` is consulted, then [`Self::default_directive`].
    pub directives: Option<String>,
    /// Filter used when nothing else resolves.
    pub default_directive: String,
    /// Print event targets (module paths).
    pub include_targets: bool,
    /// ANSI colours; disabled for collected logs.
    pub ansi: bool,
    /// Span lifecycle events to emit.
    pub span_events: FmtSpan,
    /// Formatter flavour.
    pub output: TracingOutput,
    /// Field names whose values are replaced by [`Self::redaction_text`].
    pub redacted_fields: Vec<String>,
    pub redaction_text: String,
    /// When false, [`performance::PerformanceSpan`] guards are silent.
    pub enable_performance_tracing: bool,
    /// Spans shorter than this are not reported.
    pub performance_threshold_us: Option<u64>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::for_local()
    }
}

impl TracingConfig {
    /// Pretty, coloured output for a developer terminal.
    pub fn for_local() -> Self {
        Self {
            directives: None,
            default_directive: "info".to_string(),
            include_targets: true,
            ansi: true,
            span_events: FmtSpan::NONE,
            output: TracingOutput::Pretty,
            redacted_fields: Vec::new(),
            redaction_text: "***REDACTED***".to_string(),
            enable_performance_tracing: cfg!(debug_assertions),
            performance_threshold_us: None,
        }
    }

    /// JSON without colour, for CI and log collectors.
    pub fn for_ci() -> Self {
        Self {
            ansi: false,
            output: TracingOutput::Json,
            enable_performance_tracing: false,
            ..Self::for_local()
        }
    }

    /// Debug level for the compiler and the device queues, with span timing.
    pub fn for_performance() -> Self {
        Self {
            directives: Some("manifold_core=debug,manifold_backends=debug".to_string()),
            ansi: false,
            span_events: FmtSpan::CLOSE,
            output: TracingOutput::Json,
            enable_performance_tracing: true,
            ..Self::for_local()
        }
    }

    /// Quiet compact output for test binaries; honours `RUST_LOG`.
    pub fn for_tests() -> Self {
        Self {
            default_directive: "warn".to_string(),
            ansi: false,
            output: TracingOutput::Compact,
            enable_performance_tracing: false,
            ..Self::for_local()
        }
    }

    /// Start from the preset named by [`ENV_PROFILE`] and apply the
    /// other `MANIFOLD_*` overrides on top.
    pub fn from_env() -> Self {
        let profile = env::var(ENV_PROFILE)
            .unwrap_or_else(|_| "local".to_string())
            .to_ascii_lowercase();

        let mut config = match profile.as_str() {
            "ci" => Self::for_ci(),
            "performance" => Self::for_performance(),
            "test" => Self::for_tests(),
            _ => Self::for_local(),
        };

        if let Some(directives) = non_empty_var(ENV_DIRECTIVES) {
            config.directives = Some(directives);
        }

        if let Some(output) = non_empty_var(ENV_FORMAT).and_then(|v| TracingOutput::from_env_value(&v)) {
            config.output = output;
            if config.output == TracingOutput::Json {
                config.ansi = false;
            }
        }

        if let Some(fields) = non_empty_var(ENV_REDACT_FIELDS) {
            let fields: Vec<String> = fields
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(String::from)
                .collect();
            if !fields.is_empty() {
                config.redacted_fields = fields;
            }
        }

        if let Some(token) = non_empty_var(ENV_REDACT_TOKEN) {
            config.redaction_text = token;
        }

        if let Ok(flag) = env::var(ENV_PERF_TRACING) {
            config.enable_performance_tracing =
                flag == "1" || flag.eq_ignore_ascii_case("true") || flag.eq_ignore_ascii_case("yes");
        }

        if let Some(threshold) = non_empty_var(ENV_PERF_THRESHOLD_US).and_then(|v| v.parse().ok()) {
            config.performance_threshold_us = Some(threshold);
        }

        config
    }

    fn resolve_filter(&self) -> Result<EnvFilter, TracingSetupError> {
        match &self.directives {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|err| TracingSetupError::InvalidFilter(err.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Formatter flavours.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TracingOutput {
    Compact,
    Pretty,
    Json,
}

impl TracingOutput {
    fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Failure to configure or install the subscriber.
#[derive(Debug, thiserror::Error)]
pub enum TracingSetupError {
    #[error("invalid tracing directive: {0}")]
    InvalidFilter(String),

    /// Usually means a global subscriber is already installed.
    #[error("failed to install global tracing subscriber: {0}")]
    SubscriberInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build a subscriber for `config` without installing it.
pub fn build_subscriber(config: &TracingConfig) -> Result<impl Subscriber + Send + Sync, TracingSetupError> {
    let (filter, layer) = subscriber_layers(config)?;
    Ok(Registry::default().with(layer).with(filter))
}

/// Filter plus formatting layer, for callers composing their own registry.
pub fn subscriber_layers(
    config: &TracingConfig,
) -> Result<(EnvFilter, Box<dyn Layer<Registry> + Send + Sync>), TracingSetupError> {
    let filter = config.resolve_filter()?;
    let redacted: Arc<HashSet<String>> = Arc::new(config.redacted_fields.iter().cloned().collect());
    let replacement = Arc::new(config.redaction_text.clone());
    let redact = !redacted.is_empty();

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.output {
        TracingOutput::Compact => {
            let layer = tracing_fmt::layer()
                .compact()
                .with_target(config.include_targets)
                .with_ansi(config.ansi)
                .with_span_events(config.span_events.clone());
            if redact {
                Box::new(layer.fmt_fields(TextRedactingFields::new(redacted, replacement)))
            } else {
                Box::new(layer)
            }
        }
        TracingOutput::Pretty => {
            let layer = tracing_fmt::layer()
                .pretty()
                .with_target(config.include_targets)
                .with_ansi(config.ansi)
                .with_span_events(config.span_events.clone());
            if redact {
                Box::new(layer.fmt_fields(TextRedactingFields::new(redacted, replacement)))
            } else {
                Box::new(layer)
            }
        }
        TracingOutput::Json => {
            let layer = tracing_fmt::layer()
                .json()
                .with_target(config.include_targets)
                .with_span_events(config.span_events.clone())
                .with_ansi(false);
            if redact {
                Box::new(layer.fmt_fields(JsonRedactingFields::new(redacted, replacement)))
            } else {
                Box::new(layer)
            }
        }
    };

    Ok((filter, layer))
}

/// Install the configured subscriber as the process-wide default.
pub fn init_global_tracing(config: &TracingConfig) -> Result<(), TracingSetupError> {
    build_subscriber(config)?.try_init()?;
    performance::set_enabled(config.enable_performance_tracing, config.performance_threshold_us);
    Ok(())
}

/// Install [`TracingConfig::for_tests`] once; later calls are no-ops.
///
/// Test binaries call this from every test so that whichever test runs
/// first wins and the rest silently reuse the subscriber.
pub fn init_test_tracing() {
    let _ = init_global_tracing(&TracingConfig::for_tests());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear(keys: &[&str]) {
        for key in keys {
            env::remove_var(key);
        }
    }

    const ALL_KEYS: &[&str] = &[
        ENV_PROFILE,
        ENV_DIRECTIVES,
        ENV_FORMAT,
        ENV_REDACT_FIELDS,
        ENV_REDACT_TOKEN,
        ENV_PERF_TRACING,
        ENV_PERF_THRESHOLD_US,
    ];

    #[test]
    fn rejects_invalid_directive() {
        let config = TracingConfig {
            directives: Some("=::invalid".to_string()),
            ..TracingConfig::default()
        };
        assert!(matches!(build_subscriber(&config), Err(TracingSetupError::InvalidFilter(_))));
    }

    #[test]
    fn builds_every_output_flavour() {
        for output in [TracingOutput::Compact, TracingOutput::Pretty, TracingOutput::Json] {
            let config = TracingConfig {
                output,
                redacted_fields: vec!["source".to_string()],
                ..TracingConfig::default()
            };
            assert!(build_subscriber(&config).is_ok());
        }
    }

    #[test]
    fn from_env_applies_profile_and_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear(ALL_KEYS);

        env::set_var(ENV_PROFILE, "ci");
        env::set_var(ENV_FORMAT, "compact");
        env::set_var(ENV_DIRECTIVES, "manifold_core=trace");
        env::set_var(ENV_REDACT_FIELDS, "source, log");
        env::set_var(ENV_REDACT_TOKEN, "[elided]");

        let config = TracingConfig::from_env();
        clear(ALL_KEYS);

        assert_eq!(config.directives.as_deref(), Some("manifold_core=trace"));
        assert!(!config.ansi);
        assert_eq!(config.output, TracingOutput::Compact);
        assert_eq!(config.redacted_fields, vec!["source", "log"]);
        assert_eq!(config.redaction_text, "[elided]");
    }

    #[test]
    fn from_env_reads_performance_settings() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear(ALL_KEYS);

        env::set_var(ENV_PERF_TRACING, "yes");
        env::set_var(ENV_PERF_THRESHOLD_US, "250");

        let config = TracingConfig::from_env();
        clear(ALL_KEYS);

        assert!(config.enable_performance_tracing);
        assert_eq!(config.performance_threshold_us, Some(250));
    }

    #[test]
    fn performance_preset_targets_workspace_crates() {
        let config = TracingConfig::for_performance();
        assert!(config.enable_performance_tracing);
        assert_eq!(config.output, TracingOutput::Json);
        assert!(config.directives.unwrap().contains("manifold_backends"));
    }
}
