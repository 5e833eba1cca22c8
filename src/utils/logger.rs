//! Logging utilities
//!
//! This module provides the log formatter and subscriber setup.

use std::fs::OpenOptions;
use std::io;
use std::sync::Arc;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

/// Custom event formatter for decode logs
pub struct HexframeFormatter;

impl<S, N> FormatEvent<S, N> for HexframeFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        // Format timestamp
        let now = chrono::Local::now();
        write!(writer, "[{} ", now.format("%Y-%m-%d %H:%M:%S%.3f"))?;

        // Format level
        let level: Level = *event.metadata().level();
        match level {
            Level::TRACE => write!(writer, "TRACE")?,
            Level::DEBUG => write!(writer, "DEBUG")?,
            Level::INFO => write!(writer, "INFO ")?,
            Level::WARN => write!(writer, "WARN ")?,
            Level::ERROR => write!(writer, "ERROR")?,
        }
        write!(writer, "] ")?;

        // Format module path
        if let Some(module_path) = event.metadata().module_path() {
            write!(writer, "[{}] ", module_path)?;
        }

        // Format fields
        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Initialize the logging system
///
/// Events go to stdout; when `log_file` is given they are mirrored to that
/// file as well.
pub fn init_logging(log_level: Level, log_file: Option<&str>) {
    let log_file: Option<std::fs::File> = log_file.and_then(|path: &str| {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("Failed to open log file: {}", e);
                None
            }
        }
    });

    let result: Result<(), tracing::subscriber::SetGlobalDefaultError> = match log_file {
        Some(file) => {
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(log_level)
                .event_format(HexframeFormatter)
                .with_writer(io::stdout.and(Arc::new(file)))
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(log_level)
                .event_format(HexframeFormatter)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }
    };

    result.expect("Failed to set global default subscriber");
}
