use colored::*;
use std::str::FromStr;
use sshsock_traits::logging::LoggingService;
use tracing::Level;
use tracing_subscriber::fmt::format::{DefaultFields, FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::{FmtContext, Layer, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Formats events as `2024-05-01 12:00:00  INFO message key=value`.
///
/// Debug and trace events additionally carry their target, which is the only
/// way to tell the transport crates apart when running with `--verbose`.
struct TunnelFormatter {
    use_color: bool,
}

fn level_label(level: Level, use_color: bool) -> ColoredString {
    let label = match level {
        Level::TRACE => "TRACE",
        Level::DEBUG => "DEBUG",
        Level::INFO => " INFO",
        Level::WARN => " WARN",
        Level::ERROR => "ERROR",
    };
    if !use_color {
        return label.normal();
    }
    match level {
        Level::TRACE => label.magenta().bold(),
        Level::DEBUG => label.blue().bold(),
        Level::INFO => label.green().bold(),
        Level::WARN => label.yellow().bold(),
        Level::ERROR => label.red().bold(),
    }
}

impl<S, N> FormatEvent<S, N> for TunnelFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let metadata = event.metadata();
        let level = *metadata.level();
        let time = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");

        write!(writer, "{} {} ", time, level_label(level, self.use_color))?;
        if level >= Level::DEBUG {
            let target = if self.use_color {
                metadata.target().dimmed()
            } else {
                metadata.target().normal()
            };
            write!(writer, "{}: ", target)?;
        }

        ctx.format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Parses a level name, treating `verbose` as an alias for `debug`.
pub fn parse_level(level_str: &str) -> Level {
    match level_str.trim().to_ascii_lowercase().as_str() {
        "verbose" => Level::DEBUG,
        other => Level::from_str(other).unwrap_or(Level::INFO),
    }
}

/// The fmt layer used for every subscriber. Field names are only styled
/// when `use_color` is set.
fn tunnel_layer<S, W>(make_writer: W, use_color: bool) -> Layer<S, DefaultFields, TunnelFormatter, W>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + 'static,
{
    Layer::default()
        .with_writer(make_writer)
        .with_ansi(use_color)
        .event_format(TunnelFormatter { use_color })
}

pub struct LoggingServiceImpl;

impl LoggingService for LoggingServiceImpl {
    /// Installs the global subscriber. Logs go to stderr; stdout is reserved
    /// for the advertised listen address.
    fn init_logging(
        level_str: &str,
        use_color: bool,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let env_filter = EnvFilter::builder()
            .with_default_directive(parse_level(level_str).into())
            .from_env_lossy();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(tunnel_layer(std::io::stderr, use_color))
            .try_init()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_formatter_output_shape() {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = buf.clone();
        let subscriber = tracing_subscriber::registry().with(tunnel_layer(move || Capture(sink.clone()), false));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(port = 2375, "listening");
            tracing::debug!("dialing");
        });

        let output = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
        assert!(!output.contains('\u{1b}'), "escape codes without color: {:?}", output);
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2, "{}", output);

        let info = Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}  INFO listening port=2375$").unwrap();
        assert!(info.is_match(lines[0]), "{}", lines[0]);
        let debug = Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2} DEBUG sshsock_logging::tests: dialing$").unwrap();
        assert!(debug.is_match(lines[1]), "{}", lines[1]);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level(" WARN "), Level::WARN);
        assert_eq!(parse_level("verbose"), Level::DEBUG);
        assert_eq!(parse_level("nonsense"), Level::INFO);
    }

    #[test]
    fn test_level_label_without_color_is_plain() {
        assert_eq!(level_label(Level::INFO, false).to_string(), " INFO");
        assert_eq!(level_label(Level::ERROR, false).to_string(), "ERROR");
    }
}
