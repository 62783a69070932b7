use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use tracing_core::field::{Field, Visit};
use tracing_core::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::FormatEvent;
use tracing_subscriber::fmt::{FmtContext, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;

use crate::config::ChannelConfig;
use crate::error::{Error, Result};

pub const DEFAULT_LINE_FORMAT: &str = "%channel%: %level_name%: %message% %context% %extra%";

/// A log entry as seen by a [`LogFormatter`].
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord<'a> {
    pub datetime: DateTime<Utc>,
    pub channel: &'a str,
    pub level: Level,
    pub message: String,
    /// Fields recorded on the event itself.
    pub context: Map<String, Value>,
    /// One entry per enclosing span, outermost first: span name to its
    /// formatted fields.
    pub extra: Map<String, Value>,
}

impl LogRecord<'_> {
    pub fn level_name(&self) -> &'static str {
        level_name(&self.level)
    }
}

pub fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "TRACE",
        Level::DEBUG => "DEBUG",
        Level::INFO => "INFO",
        Level::WARN => "WARNING",
        Level::ERROR => "ERROR",
    }
}

/// Renders a record into the line that is shipped to CloudWatch.
pub trait LogFormatter: Send + Sync {
    fn format(&self, record: &LogRecord<'_>) -> String;
}

/// Template based formatter.
///
/// Supported placeholders are `%datetime%`, `%channel%`, `%level_name%`,
/// `%message%`, `%context%`, `%extra%` and `%context.KEY%` / `%extra.KEY%`
/// for single entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineFormatter {
    format: String,
    date_format: Option<String>,
    allow_inline_line_breaks: bool,
    ignore_empty_context_and_extra: bool,
}

impl Default for LineFormatter {
    fn default() -> Self {
        Self::new(DEFAULT_LINE_FORMAT)
    }
}

impl LineFormatter {
    pub fn new(format: &str) -> Self {
        Self {
            format: format.to_string(),
            date_format: None,
            allow_inline_line_breaks: false,
            ignore_empty_context_and_extra: false,
        }
    }

    /// `strftime` style format for `%datetime%`. RFC 3339 with microseconds
    /// when unset.
    pub fn date_format(mut self, date_format: &str) -> Self {
        self.date_format = Some(date_format.to_string());
        self
    }

    pub fn allow_inline_line_breaks(mut self, allow: bool) -> Self {
        self.allow_inline_line_breaks = allow;
        self
    }

    pub fn ignore_empty_context_and_extra(mut self, ignore: bool) -> Self {
        self.ignore_empty_context_and_extra = ignore;
        self
    }

    fn datetime(&self, datetime: &DateTime<Utc>) -> String {
        match &self.date_format {
            Some(date_format) => datetime.format(date_format).to_string(),
            None => datetime.to_rfc3339_opts(SecondsFormat::Micros, false),
        }
    }

    fn normalize(&self, text: &str) -> String {
        if self.allow_inline_line_breaks {
            text.to_string()
        } else {
            text.replace("\r\n", " ").replace('\r', " ").replace('\n', " ")
        }
    }

    fn render_map(&self, map: &Map<String, Value>) -> String {
        if map.is_empty() && self.ignore_empty_context_and_extra {
            String::new()
        } else {
            Value::Object(map.clone()).to_string()
        }
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl LineFormatter {
    fn placeholder(&self, name: &str, record: &LogRecord<'_>) -> Option<String> {
        let value = match name {
            "datetime" => self.datetime(&record.datetime),
            "channel" => record.channel.to_string(),
            "level_name" => record.level_name().to_string(),
            "message" => self.normalize(&record.message),
            "context" => self.render_map(&record.context),
            "extra" => self.render_map(&record.extra),
            _ => {
                let (map, key) = if let Some(key) = name.strip_prefix("context.") {
                    (&record.context, key)
                } else if let Some(key) = name.strip_prefix("extra.") {
                    (&record.extra, key)
                } else {
                    return None;
                };
                map.get(key)
                    .map(|value| self.normalize(&render_value(value)))
                    .unwrap_or_default()
            }
        };
        Some(value)
    }
}

impl LogFormatter for LineFormatter {
    /// Substitutes placeholders in one pass over the template, so values
    /// that contain `%...%` are emitted verbatim. Unknown placeholders are
    /// kept as written.
    fn format(&self, record: &LogRecord<'_>) -> String {
        let mut output = String::with_capacity(self.format.len());
        let mut rest = self.format.as_str();

        while let Some(start) = rest.find('%') {
            output.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let end = match after.find('%') {
                Some(end) => end,
                None => {
                    rest = &rest[start..];
                    break;
                }
            };
            match self.placeholder(&after[..end], record) {
                Some(value) => {
                    output.push_str(&value);
                    rest = &after[end + 1..];
                }
                None => {
                    output.push('%');
                    rest = after;
                }
            }
        }
        output.push_str(rest);
        output
    }
}

/// Numeric severity of `level`, on the syslog-derived scale used by
/// `level` in [`JsonFormatter`] output.
pub fn severity(level: &Level) -> u16 {
    match *level {
        Level::TRACE | Level::DEBUG => 100,
        Level::INFO => 200,
        Level::WARN => 300,
        Level::ERROR => 400,
    }
}

/// One JSON object per record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonFormatter;

impl LogFormatter for JsonFormatter {
    fn format(&self, record: &LogRecord<'_>) -> String {
        json!({
            "message": record.message,
            "context": record.context,
            "level": severity(&record.level),
            "level_name": record.level_name(),
            "channel": record.channel,
            "datetime": record.datetime.to_rfc3339_opts(SecondsFormat::Micros, false),
            "extra": record.extra,
        })
        .to_string()
    }
}

type FormatterConstructor = Arc<dyn Fn() -> Arc<dyn LogFormatter> + Send + Sync>;

/// Named formatter constructors, filled in at startup.
#[derive(Clone, Default)]
pub struct FormatterRegistry {
    constructors: HashMap<String, FormatterConstructor>,
}

impl FormatterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding `"line"` and `"json"`.
    pub fn with_builtin() -> Self {
        Self::new()
            .register("line", || Arc::new(LineFormatter::default()))
            .register("json", || Arc::new(JsonFormatter))
    }

    pub fn register<F>(mut self, name: &str, constructor: F) -> Self
    where
        F: Fn() -> Arc<dyn LogFormatter> + Send + Sync + 'static,
    {
        self.constructors
            .insert(name.to_string(), Arc::new(constructor));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn make(&self, name: &str) -> Option<Arc<dyn LogFormatter>> {
        self.constructors.get(name).map(|constructor| constructor())
    }

    /// Picks the formatter configured on `config`: its formatter factory,
    /// the registered formatter named by `formatter`, or the default
    /// [`LineFormatter`] when neither is present.
    pub fn resolve(&self, config: &ChannelConfig) -> Result<Arc<dyn LogFormatter>> {
        if let Some(factory) = config.formatter_factory() {
            return Ok(factory(config));
        }
        match config.get("formatter") {
            None => Ok(Arc::new(LineFormatter::default())),
            Some(Value::String(name)) => self.make(name).ok_or_else(|| {
                Error::config(format!("formatter `{}` is not registered", name))
            }),
            Some(other) => Err(Error::config(format!(
                "formatter must name a registered formatter or be a callable, got {}",
                other
            ))),
        }
    }
}

impl fmt::Debug for FormatterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.constructors.keys().collect();
        names.sort();
        f.debug_struct("FormatterRegistry")
            .field("formatters", &names)
            .finish()
    }
}

/// Bridges a [`LogFormatter`] into `tracing-subscriber`'s fmt layer.
pub(crate) struct ChannelFormat {
    channel: String,
    formatter: Arc<dyn LogFormatter>,
}

impl ChannelFormat {
    pub(crate) fn new(channel: &str, formatter: Arc<dyn LogFormatter>) -> Self {
        Self {
            channel: channel.to_string(),
            formatter,
        }
    }
}

impl<S, N> FormatEvent<S, N> for ChannelFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        writer: &mut dyn fmt::Write,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut fields = FieldCollector::default();
        event.record(&mut fields);

        let mut extra = Map::new();
        #[allow(deprecated)]
        ctx.visit_spans(|span| {
            let extensions = span.extensions();
            let formatted = extensions
                .get::<FormattedFields<N>>()
                .map(|fields| fields.fields.clone())
                .unwrap_or_default();
            extra.insert(span.name().to_string(), Value::String(formatted));
            Ok::<(), fmt::Error>(())
        })?;

        let record = LogRecord {
            datetime: Utc::now(),
            channel: &self.channel,
            level: *event.metadata().level(),
            message: fields.message,
            context: fields.context,
            extra,
        };
        writeln!(writer, "{}", self.formatter.format(&record))
    }
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    context: Map<String, Value>,
}

impl FieldCollector {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = render_value(&value);
        } else {
            self.context.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldCollector {
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::String(format!("{:?}", value)));
    }
}
