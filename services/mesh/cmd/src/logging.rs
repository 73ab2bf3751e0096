use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const SOURCE_WIDTH: usize = 20;
const LEVEL_WIDTH: usize = 9;

/// Log line layout: `[timestamp] [source] [level] message key=value...`
///
/// Logs go to stderr so they never interleave with chat output on stdout.
pub struct ChatLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl ChatLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: std::io::stderr().is_terminal(),
        }
    }

    #[cfg(test)]
    fn plain(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            color_enabled: false,
        }
    }

    /// Source column: the `component` field, else the emitting crate's suffix
    fn source(&self, component: Option<&str>, target: &str) -> String {
        let crate_name = target.split("::").next().unwrap_or(target);
        let name = match component {
            Some(component) => format!("{}-{}", self.service_name, component),
            None if crate_name == "mesh_chat" => self.service_name.clone(),
            None => match crate_name.strip_prefix("mesh_") {
                Some(suffix) => format!("{}-{}", self.service_name, suffix),
                None => crate_name.replace('_', "-"),
            },
        };

        if name.chars().count() > SOURCE_WIDTH {
            let head: String = name.chars().take(SOURCE_WIDTH - 1).collect();
            format!("{}…", head)
        } else {
            format!("{:<width$}", name, width = SOURCE_WIDTH)
        }
    }

    fn level_label(level: &Level) -> String {
        let label = match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", label, width = LEVEL_WIDTH)
    }

    fn level_color(&self, level: &Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }
}

impl<S, N> FormatEvent<S, N> for ChatLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let metadata = event.metadata();

        let mut fields = FieldVisitor::default();
        event.record(&mut fields);

        let (cyan, reset) = if self.color_enabled {
            (COLOR_CYAN, COLOR_RESET)
        } else {
            ("", "")
        };

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] {}",
            cyan,
            timestamp,
            self.source(fields.component.as_deref(), metadata.target()),
            self.level_color(metadata.level()),
            Self::level_label(metadata.level()),
            reset,
            fields.message
        )?;
        for (key, value) in &fields.extra {
            write!(writer, " {}={}", key, value)?;
        }
        writeln!(writer, "{}", reset)
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => self.extra.push((name, value.to_string())),
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let unquoted = rendered
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(rendered);

        match field.name() {
            "message" => self.message = unquoted,
            "component" => self.component = Some(unquoted),
            name => self.extra.push((name, unquoted)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_from_component_field() {
        let formatter = ChatLogFormatter::plain("mesh-chat");
        assert_eq!(
            formatter.source(Some("console"), "mesh_chat").trim_end(),
            "mesh-chat-console"
        );
    }

    #[test]
    fn test_source_from_target_crate() {
        let formatter = ChatLogFormatter::plain("mesh-chat");
        assert_eq!(
            formatter.source(None, "mesh_session::manager").trim_end(),
            "mesh-chat-session"
        );
        assert_eq!(formatter.source(None, "mesh_chat").trim_end(), "mesh-chat");
        assert_eq!(formatter.source(None, "tokio::net").trim_end(), "tokio");
    }

    #[test]
    fn test_source_is_fixed_width() {
        let formatter = ChatLogFormatter::plain("mesh-chat");
        assert_eq!(formatter.source(None, "mesh_wire").chars().count(), SOURCE_WIDTH);

        let long = formatter.source(Some("a-rather-long-component"), "mesh_chat");
        assert_eq!(long.chars().count(), SOURCE_WIDTH);
        assert!(long.ends_with('…'));
    }

    #[test]
    fn test_no_color_when_disabled() {
        let formatter = ChatLogFormatter::plain("mesh-chat");
        assert_eq!(formatter.level_color(&Level::ERROR), "");
        assert!(ChatLogFormatter::level_label(&Level::WARN).starts_with("⚠ WARN"));
    }
}
