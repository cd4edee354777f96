//! Field formatters that mask configured field values.
//!
//! Generated kernel sources and build logs can be large; the usual use is
//! `MANIFOLD_TRACING_REDACT_FIELDS=source,log` on CI.

use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map as JsonMap, Number as JsonNumber, Value as JsonValue};
use tracing::field::{Field, Visit};
use tracing_subscriber::field::RecordFields;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::FormatFields;

#[derive(Clone)]
pub(crate) struct TextRedactingFields {
    redacted: Arc<HashSet<String>>,
    replacement: Arc<String>,
}

impl TextRedactingFields {
    pub(crate) fn new(redacted: Arc<HashSet<String>>, replacement: Arc<String>) -> Self {
        Self { redacted, replacement }
    }
}

impl<'writer> FormatFields<'writer> for TextRedactingFields {
    fn format_fields<R: RecordFields>(&self, mut writer: Writer<'writer>, fields: R) -> fmt::Result {
        let mut collector = Collector::<String>::new(&self.redacted, &self.replacement);
        fields.record(&mut collector);

        for (index, (key, value)) in collector.entries.into_iter().enumerate() {
            if index > 0 {
                writer.write_char(' ')?;
            }
            write!(writer, "{key}={value}")?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub(crate) struct JsonRedactingFields {
    redacted: Arc<HashSet<String>>,
    replacement: Arc<String>,
}

impl JsonRedactingFields {
    pub(crate) fn new(redacted: Arc<HashSet<String>>, replacement: Arc<String>) -> Self {
        Self { redacted, replacement }
    }
}

impl<'writer> FormatFields<'writer> for JsonRedactingFields {
    fn format_fields<R: RecordFields>(&self, mut writer: Writer<'writer>, fields: R) -> fmt::Result {
        let mut collector = Collector::<JsonValue>::new(&self.redacted, &self.replacement);
        fields.record(&mut collector);

        let object: JsonMap<String, JsonValue> = collector.entries.into_iter().collect();
        let serialized = serde_json::to_string(&JsonValue::Object(object)).map_err(|_| fmt::Error)?;
        writer.write_str(&serialized)
    }
}

/// Rendering of a single recorded value for one output flavour.
trait Rendered: Sized {
    fn masked(replacement: &str) -> Self;
    fn debug(value: &dyn fmt::Debug) -> Self;
    fn text(value: &str) -> Self;
    fn int(value: i64) -> Self;
    fn uint(value: u64) -> Self;
    fn float(value: f64) -> Self;
    fn boolean(value: bool) -> Self;
}

impl Rendered for String {
    fn masked(replacement: &str) -> Self {
        format!("{replacement:?}")
    }
    fn debug(value: &dyn fmt::Debug) -> Self {
        format!("{value:?}")
    }
    fn text(value: &str) -> Self {
        format!("{value:?}")
    }
    fn int(value: i64) -> Self {
        value.to_string()
    }
    fn uint(value: u64) -> Self {
        value.to_string()
    }
    fn float(value: f64) -> Self {
        value.to_string()
    }
    fn boolean(value: bool) -> Self {
        value.to_string()
    }
}

impl Rendered for JsonValue {
    fn masked(replacement: &str) -> Self {
        JsonValue::String(replacement.to_string())
    }
    fn debug(value: &dyn fmt::Debug) -> Self {
        JsonValue::String(format!("{value:?}"))
    }
    fn text(value: &str) -> Self {
        JsonValue::String(value.to_string())
    }
    fn int(value: i64) -> Self {
        JsonValue::Number(value.into())
    }
    fn uint(value: u64) -> Self {
        JsonValue::Number(value.into())
    }
    fn float(value: f64) -> Self {
        JsonNumber::from_f64(value)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(value.to_string()))
    }
    fn boolean(value: bool) -> Self {
        JsonValue::Bool(value)
    }
}

struct Collector<'a, V> {
    entries: Vec<(String, V)>,
    redacted: &'a HashSet<String>,
    replacement: &'a str,
}

impl<'a, V: Rendered> Collector<'a, V> {
    fn new(redacted: &'a HashSet<String>, replacement: &'a str) -> Self {
        Self {
            entries: Vec::new(),
            redacted,
            replacement,
        }
    }

    fn push(&mut self, field: &Field, render: impl FnOnce() -> V) {
        let value = if self.redacted.contains(field.name()) {
            V::masked(self.replacement)
        } else {
            render()
        };
        self.entries.push((field.name().to_string(), value));
    }
}

impl<V: Rendered> Visit for Collector<'_, V> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field, || V::debug(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field, || V::text(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, || V::int(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, || V::uint(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.push(field, || V::float(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, || V::boolean(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn Error + 'static)) {
        self.push(field, || V::text(&value.to_string()));
    }
}
