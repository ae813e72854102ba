//! Console log format: `[timestamp] [service] [level] message`.
//!
//! Events carrying a `component` field are attributed to `esbox-<component>`.

use std::fmt;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const SERVICE_NAME_WIDTH: usize = 18;
const LOG_LEVEL_WIDTH: usize = 9;

/// Log an info event attributed to a component
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

/// Log a warning attributed to a component
#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

/// Log a debug event attributed to a component
#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

/// Formatter for the esbox console output
pub struct EsboxLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl EsboxLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: color_terminal(),
        }
    }

    fn service_column(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(component) => format!("{}-{}", self.service_name, component),
            None => self.service_name.clone(),
        };
        if name.chars().count() > SERVICE_NAME_WIDTH {
            let truncated: String = name.chars().take(SERVICE_NAME_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = SERVICE_NAME_WIDTH)
        }
    }

    fn paint(&self, color: &'static str) -> &'static str {
        if self.color_enabled {
            color
        } else {
            ""
        }
    }
}

fn level_label(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "✗ ERROR",
        Level::WARN => "⚠ WARN",
        Level::INFO => "ℹ INFO",
        Level::DEBUG => "◦ DEBUG",
        Level::TRACE => "◦ TRACE",
    }
}

fn level_color(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => COLOR_BRIGHT_RED,
        Level::WARN => COLOR_BRIGHT_YELLOW,
        Level::INFO => COLOR_GREEN,
        Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
    }
}

impl<S, N> FormatEvent<S, N> for EsboxLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, _ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();

        let mut fields = EventFields::default();
        event.record(&mut fields);

        write!(
            writer,
            "{}[{}] [{}] [{}{:<width$}{}] ",
            self.paint(COLOR_CYAN),
            timestamp,
            self.service_column(fields.component.as_deref()),
            self.paint(level_color(level)),
            level_label(level),
            self.paint(COLOR_RESET),
            width = LOG_LEVEL_WIDTH
        )?;
        writeln!(writer, "{}{}", fields.message, self.paint(COLOR_RESET))
    }
}

#[derive(Default)]
struct EventFields {
    message: String,
    component: Option<String>,
}

impl Visit for EventFields {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let unquoted = rendered
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(rendered);
        match field.name() {
            "message" => self.message = unquoted,
            "component" => self.component = Some(unquoted),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            _ => {}
        }
    }
}

fn color_terminal() -> bool {
    matches!(std::env::var("TERM"), Ok(term) if term != "dumb")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formatter() -> EsboxLogFormatter {
        EsboxLogFormatter {
            service_name: "esbox".to_string(),
            color_enabled: false,
        }
    }

    #[test]
    fn test_service_column() {
        let f = formatter();
        assert_eq!(f.service_column(None).trim_end(), "esbox");
        assert_eq!(f.service_column(Some("device")).trim_end(), "esbox-device");
        assert_eq!(f.service_column(None).len(), SERVICE_NAME_WIDTH);
        assert_eq!(f.service_column(Some("a-very-long-component")).chars().count(), SERVICE_NAME_WIDTH);
    }

    #[test]
    fn test_no_color_without_terminal() {
        assert_eq!(formatter().paint(COLOR_GREEN), "");
    }
}
