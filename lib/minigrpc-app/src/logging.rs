//! Logging.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use minigrpc_error::{generic_error, GenericError};
use tracing::{field, level_filters::LevelFilter, Event, Subscriber};
use tracing_subscriber::{
    field::VisitOutput,
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt as _,
    registry::LookupSpan,
    util::SubscriberInitExt as _,
    EnvFilter, Layer,
};

/// Environment variable holding the log filtering directives.
pub const LOG_LEVEL_ENV_VAR: &str = "MINIGRPC_LOG_LEVEL";

/// Environment variable selecting JSON-formatted log output.
pub const LOG_FORMAT_JSON_ENV_VAR: &str = "MINIGRPC_LOG_FORMAT_JSON";

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// This function reads the `MINIGRPC_LOG_LEVEL` environment variable to determine the filtering directives to use. If
/// the environment variable is not set, the default level is `default_level`, or `INFO` if that is not given either.
/// Additionally, it reads the `MINIGRPC_LOG_FORMAT_JSON` environment variable to determine which output format to use.
/// If it is set to `true` or `1`, the logs will be formatted as JSON. Otherwise, logs are written in a compact,
/// pipe-delimited, human-readable format.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(app_name: &str, default_level: Option<LevelFilter>) -> Result<(), GenericError> {
    let is_json = std::env::var(LOG_FORMAT_JSON_ENV_VAR)
        .map(|s| is_truthy(&s))
        .unwrap_or(false);

    let level_filter = EnvFilter::builder()
        .with_default_directive(default_level.unwrap_or(LevelFilter::INFO).into())
        .with_env_var(LOG_LEVEL_ENV_VAR)
        .from_env_lossy();

    let result = if is_json {
        tracing_subscriber::registry()
            .with(json_layer().with_filter(level_filter))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::Layer::new()
                    .event_format(PipeDelimitedFormatter::new(app_name))
                    .with_filter(level_filter),
            )
            .try_init()
    };

    result.map_err(|e| generic_error!("Failed to initialize logging: {}", e))
}

fn is_truthy(value: &str) -> bool {
    let value = value.trim().to_lowercase();
    value == "true" || value == "1"
}

fn json_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::Layer::new()
        .json()
        .flatten_event(true)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
}

/// Event formatter producing `<time> | <APP> | <LEVEL> | (<file>:<line>) | key:value,... | message` lines.
struct PipeDelimitedFormatter {
    app_name: String,
}

impl PipeDelimitedFormatter {
    fn new(app_name: &str) -> Self {
        // "minigrpc-demo" and "Minigrpc Demo" both become "MINIGRPCDEMO".
        let app_name = app_name.to_uppercase().replace(['-', ' '], "");

        Self { app_name }
    }
}

impl<S, N> FormatEvent<S, N> for PipeDelimitedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, _ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let metadata = event.metadata();

        write!(
            writer,
            "{} | {} | {} | ",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            self.app_name,
            metadata.level()
        )?;

        match (metadata.file(), metadata.line()) {
            (Some(file), Some(line)) => write!(writer, "({}:{})", file, line)?,
            _ => write!(writer, "(unknown:0)")?,
        }

        let mut visitor = PipeDelimitedFieldVisitor::new(writer.by_ref());
        event.record(&mut visitor);
        visitor.finish()?;

        writeln!(writer)
    }
}

/// Field visitor that writes structured fields as `| key:value,key2:value2` followed by `| message`.
///
/// The first write error is latched and returned from `finish`; every write after it is skipped.
struct PipeDelimitedFieldVisitor<'writer> {
    writer: Writer<'writer>,
    fields_written: usize,
    message: String,
    result: fmt::Result,
}

impl<'writer> PipeDelimitedFieldVisitor<'writer> {
    fn new(writer: Writer<'writer>) -> Self {
        Self {
            writer,
            fields_written: 0,
            message: String::new(),
            result: Ok(()),
        }
    }

    fn write_field(&mut self, field: &field::Field, f: impl FnOnce(&mut dyn fmt::Write) -> fmt::Result) {
        if self.result.is_err() {
            return;
        }

        // The message always goes last.
        if field.name() == "message" {
            self.result = f(&mut self.message);
            return;
        }

        let lead = if self.fields_written == 0 { " | " } else { "," };
        self.result = write!(self.writer, "{}{}:", lead, field.name()).and_then(|()| f(&mut self.writer));
        if self.result.is_ok() {
            self.fields_written += 1;
        }
    }
}

impl field::Visit for PipeDelimitedFieldVisitor<'_> {
    fn record_debug(&mut self, field: &field::Field, value: &dyn fmt::Debug) {
        self.write_field(field, |w| write!(w, "{:?}", value));
    }

    fn record_str(&mut self, field: &field::Field, value: &str) {
        self.write_field(field, |w| write!(w, "{}", value));
    }
}

impl VisitOutput<fmt::Result> for PipeDelimitedFieldVisitor<'_> {
    fn finish(mut self) -> fmt::Result {
        self.result?;

        if self.message.is_empty() {
            Ok(())
        } else {
            write!(self.writer, " | {}", self.message)
        }
    }
}
