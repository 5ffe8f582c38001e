use crate::config::{LogFormat, LogOutput, LoggingConfig};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Mutex;
use tracing::{Event, Span, Subscriber};
use tracing_subscriber::{
    fmt::{format::Writer, writer::BoxMakeWriter, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter,
};
use uuid::Uuid;

/// Field names whose values never reach the log in clear text
const SENSITIVE_KEYS: [&str; 6] = ["pass", "password", "secret", "token", "credential", "auth"];

/// Structured log entry for JSON output
#[derive(Debug, Serialize)]
pub struct StructuredLogEntry {
    /// Timestamp in RFC3339 format
    pub timestamp: String,
    pub level: String,
    /// Event target, usually the module path
    pub component: String,
    pub message: String,
    /// Fields of the enclosing spans, e.g. the connection id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
    #[serde(flatten)]
    pub fields: HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<LogLocation>,
}

/// Source code location information
#[derive(Debug, Serialize)]
pub struct LogLocation {
    pub file: String,
    pub line: u32,
}

/// JSON formatter emitting one object per event
pub struct JsonFormatter {
    redact_sensitive: bool,
}

impl JsonFormatter {
    pub fn new(redact_sensitive: bool) -> Self {
        Self { redact_sensitive }
    }

    fn redact_fields(&self, fields: &mut HashMap<String, serde_json::Value>) {
        if !self.redact_sensitive {
            return;
        }

        for (key, value) in fields.iter_mut() {
            if is_sensitive_key(key) {
                *value = serde_json::Value::String("[REDACTED]".to_string());
            }
        }
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key_lower = key.to_lowercase();
    SENSITIVE_KEYS.iter().any(|&sensitive| key_lower.contains(sensitive))
}

impl<S, N> FormatEvent<S, N> for JsonFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();

        let span = ctx.event_scope().map(|scope| {
            scope
                .from_root()
                .map(|span| {
                    let extensions = span.extensions();
                    match extensions.get::<tracing_subscriber::fmt::FormattedFields<N>>() {
                        Some(fields) if !fields.is_empty() => format!("{}{{{}}}", span.name(), fields),
                        _ => span.name().to_string(),
                    }
                })
                .collect::<Vec<_>>()
                .join(":")
        });

        let mut fields = HashMap::new();
        let mut visitor = JsonFieldVisitor::new(&mut fields);
        event.record(&mut visitor);
        self.redact_fields(&mut fields);

        let message = fields
            .remove("message")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        let entry = StructuredLogEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: metadata.level().to_string().to_uppercase(),
            component: metadata.target().to_string(),
            message,
            span,
            fields,
            location: Some(LogLocation {
                file: metadata.file().unwrap_or("unknown").to_string(),
                line: metadata.line().unwrap_or(0),
            }),
        };

        let json = serde_json::to_string(&entry).map_err(|_| fmt::Error)?;
        writeln!(writer, "{}", json)
    }
}

/// Visitor for collecting event fields into a HashMap
struct JsonFieldVisitor<'a> {
    fields: &'a mut HashMap<String, serde_json::Value>,
}

impl<'a> JsonFieldVisitor<'a> {
    fn new(fields: &'a mut HashMap<String, serde_json::Value>) -> Self {
        Self { fields }
    }
}

impl<'a> tracing::field::Visit for JsonFieldVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::String(format!("{:?}", value)),
        );
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::String(value.to_string()),
        );
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields.insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

/// Install the global subscriber described by `config`
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let mut filter = EnvFilter::new(&config.level);
    for (component, level) in &config.component_levels {
        let directive = format!("{}={}", component, level)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid log directive for {}: {}", component, e)))?;
        filter = filter.add_directive(directive);
    }

    let writer = match &config.output {
        LogOutput::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogOutput::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .event_format(JsonFormatter::new(config.redact_sensitive_data))
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(writer))
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_writer(writer))
            .try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("Failed to install log subscriber: {}", e)))
}

/// Span wrapping every event emitted on behalf of one miner connection
pub fn connection_span(conn_id: Uuid, peer: SocketAddr) -> Span {
    tracing::info_span!("connection", conn_id = %conn_id, peer = %peer)
}
