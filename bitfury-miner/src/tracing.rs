//! Tracing setup for bitfury-miner.
//!
//! Call [`init_journald_or_stdout`] once at startup. Everywhere else,
//! `use crate::tracing::prelude::*` brings in the `trace!()` .. `error!()`
//! macros.

use std::env;
use std::io::IsTerminal;

use time::OffsetDateTime;
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{format::Writer, time::FormatTime},
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

const CRATE_PREFIX: &str = "bitfury_miner::";

/// Log to journald under systemd, to stdout otherwise.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        if let Ok(layer) = tracing_journald::layer() {
            tracing_subscriber::registry().with(layer).init();
        } else {
            use_stdout();
            error!("Failed to initialize journald logging, using stdout.");
        }
    } else {
        use_stdout();
    }
}

// RUST_LOG filters; the default level is INFO. Colour only on a terminal.
fn use_stdout() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    let formatter = LineFormatter {
        color: std::io::stdout().is_terminal(),
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTimer)
                .fmt_fields(tracing_subscriber::fmt::format::DefaultFields::new())
                .event_format(formatter),
        )
        .init();
}

/// One line per event, structured fields indented on a second line.
///
/// ```text
/// 14:02:11 INFO  autoclock: Reclocking chip.
///                chip=0:3, bits=55
/// ```
struct LineFormatter {
    color: bool,
}

#[derive(Default)]
struct FieldCollector {
    fields: Vec<(String, String)>,
    message: Option<String>,
}

impl tracing::field::Visit for FieldCollector {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push((field.name().to_string(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        let formatted = unquote(&format!("{:?}", value)).to_string();
        if field.name() == "message" {
            self.message = Some(formatted);
        } else {
            self.fields.push((field.name().to_string(), formatted));
        }
    }
}

fn unquote(s: &str) -> &str {
    let s = s
        .strip_prefix("Some(")
        .and_then(|inner| inner.strip_suffix(')'))
        .unwrap_or(s);
    s.trim_matches('"')
}

/// Module path shown for an event target.
///
/// Our own modules lose the crate prefix; bridged `log` records use their
/// original target; dependency paths are kept whole.
fn short_target(target: &str, fields: &[(String, String)]) -> String {
    if let Some(stripped) = target.strip_prefix(CRATE_PREFIX) {
        return stripped.to_string();
    }
    if target == "bitfury_miner" {
        return "main".to_string();
    }
    if target == "log" {
        if let Some((_, v)) = fields.iter().find(|(k, _)| k == "log.target") {
            return v.clone();
        }
    }
    target.to_string()
}

fn level_style(level: tracing::Level) -> (&'static str, &'static str) {
    match level {
        tracing::Level::ERROR => ("\x1b[31m", "ERROR"),
        tracing::Level::WARN => ("\x1b[33m", "WARN "),
        tracing::Level::INFO => ("\x1b[32m", "INFO "),
        tracing::Level::DEBUG => ("\x1b[34m", "DEBUG"),
        tracing::Level::TRACE => ("\x1b[35m", "TRACE"),
    }
}

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for LineFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        LocalTimer.format_time(&mut writer)?;
        write!(writer, " ")?;

        let (color, level) = level_style(*event.metadata().level());
        if self.color {
            write!(writer, "{}{}\x1b[0m ", color, level)?;
        } else {
            write!(writer, "{} ", level)?;
        }

        write!(
            writer,
            "{}: ",
            short_target(event.metadata().target(), &visitor.fields)
        )?;
        if let Some(message) = &visitor.message {
            write!(writer, "{}", message)?;
        }

        let fields: Vec<_> = visitor
            .fields
            .iter()
            .filter(|(k, _)| !k.starts_with("log."))
            .collect();
        if !fields.is_empty() {
            // Timestamp (8) + space + level (5) + space
            writeln!(writer)?;
            write!(writer, "{}               ", if self.color { "\x1b[90m" } else { "" })?;
            for (i, (key, value)) in fields.iter().enumerate() {
                if i > 0 {
                    write!(writer, ", ")?;
                }
                write!(writer, "{}={}", key, value)?;
            }
            if self.color {
                write!(writer, "\x1b[0m")?;
            }
        }

        writeln!(writer)
    }
}

/// Local wall-clock time to the second.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| std::fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
