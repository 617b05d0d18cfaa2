use ansi_term::{Colour, Style};
use once_cell::sync::OnceCell;
use std::{
    collections::HashMap,
    fmt,
    fmt::Write as _,
    path::Path,
    str::FromStr,
};

use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing_core::{event::Event, Level, Metadata};
use tracing_log::LogTracer;
use tracing_subscriber::{
    fmt::{format::FmtSpan, FmtContext, FormatEvent, FormatFields, FormattedFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    EnvFilter, Registry,
};

/// Returns hostname.
fn get_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_str().unwrap_or("").to_string(),
        Err(_) => std::env::var("HOSTNAME").unwrap_or_else(|_| String::new()),
    }
}

static HOSTNAME_PREFIX: OnceCell<String> = OnceCell::new();

// Custom struct used to format the log/trace LEVEL
struct FormatLevel<'a> {
    level: &'a Level,
    ansi: bool,
}

impl<'a> FormatLevel<'a> {
    fn new(level: &'a Level, ansi: bool) -> Self {
        Self { level, ansi }
    }

    fn short(&self) -> &str {
        match *self.level {
            Level::TRACE => "T",
            Level::DEBUG => "D",
            Level::INFO => "I",
            Level::WARN => "W",
            Level::ERROR => "E",
        }
    }

    fn long(&self) -> String {
        match *self.level {
            Level::TRACE => "TRACE",
            Level::DEBUG => "DEBUG",
            Level::INFO => "INFO",
            Level::WARN => "WARN",
            Level::ERROR => "ERROR",
        }
        .to_string()
    }

    fn fmt_line(&self, f: &mut dyn fmt::Write, line: &str) -> std::fmt::Result {
        if self.ansi {
            write!(
                f,
                "{}",
                match *self.level {
                    Level::TRACE => Colour::Cyan.dimmed().paint(line),
                    Level::DEBUG => Colour::White.dimmed().paint(line),
                    Level::INFO => Colour::White.paint(line),
                    Level::WARN => Colour::Yellow.paint(line),
                    Level::ERROR => Colour::Red.paint(line),
                }
            )
        } else {
            write!(f, "{line}")
        }
    }
}

// Display trace LEVEL.
impl std::fmt::Display for FormatLevel<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const TRACE: &str = "TRACE";
        const DEBUG: &str = "DEBUG";
        const INFO: &str = " INFO";
        const WARN: &str = " WARN";
        const ERROR: &str = "ERROR";

        if self.ansi {
            match *self.level {
                Level::TRACE => write!(f, "{}", Colour::Purple.paint(TRACE)),
                Level::DEBUG => write!(f, "{}", Colour::Blue.paint(DEBUG)),
                Level::INFO => write!(f, "{}", Colour::Green.paint(INFO)),
                Level::WARN => write!(f, "{}", Colour::Yellow.paint(WARN)),
                Level::ERROR => write!(f, "{}", Colour::Red.paint(ERROR)),
            }
        } else {
            match *self.level {
                Level::TRACE => f.pad(TRACE),
                Level::DEBUG => f.pad(DEBUG),
                Level::INFO => f.pad(INFO),
                Level::WARN => f.pad(WARN),
                Level::ERROR => f.pad(ERROR),
            }
        }
    }
}

// Custom struct used to format trace context (span) information
struct CustomContext<'a, S, N>
where
    S: tracing_core::subscriber::Subscriber + for<'s> LookupSpan<'s>,
    N: for<'w> FormatFields<'w> + 'static,
{
    context: &'a FmtContext<'a, S, N>,
    span: Option<&'a tracing_core::span::Id>,
    ansi: bool,
}

impl<'a, S, N> CustomContext<'a, S, N>
where
    S: tracing_core::subscriber::Subscriber + for<'s> LookupSpan<'s>,
    N: for<'w> FormatFields<'w> + 'static,
{
    fn new(
        context: &'a FmtContext<'a, S, N>,
        span: Option<&'a tracing_core::span::Id>,
        ansi: bool,
    ) -> Self {
        Self {
            context,
            span,
            ansi,
        }
    }
}

// Display trace context (span) information
impl<S, N> std::fmt::Display for CustomContext<'_, S, N>
where
    S: tracing_core::subscriber::Subscriber + for<'s> LookupSpan<'s>,
    N: for<'w> FormatFields<'w> + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bold = if self.ansi {
            Style::new().bold()
        } else {
            Style::new()
        };
        let scope = self
            .span
            .and_then(|id| self.context.span(id))
            .or_else(|| self.context.lookup_current())
            .into_iter()
            .flat_map(|span| span.scope().from_root());

        for span in scope {
            write!(f, ":{}", bold.paint(span.metadata().name()))?;

            let extensions = span.extensions();

            let fields = &extensions
                .get::<FormattedFields<N>>()
                .expect("unable to find FormattedFields in extensions");

            if !fields.is_empty() {
                write!(f, "{}{}{}", bold.paint("{"), fields, bold.paint("}"))?;
            }
        }

        Ok(())
    }
}

fn basename(path: &str) -> &str {
    Path::new(path).file_name().unwrap().to_str().unwrap()
}

// Custom struct used to format a callsite location (filename and line number)
struct Location<'a> {
    meta: &'a Metadata<'a>,
}

impl<'a> Location<'a> {
    fn new(meta: &'a Metadata<'a>) -> Self {
        Self { meta }
    }
}

// Display callsite location (filename and line number) from metadata
impl std::fmt::Display for Location<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(file) = self.meta.file() {
            if let Some(line) = self.meta.line() {
                write!(f, "{}:{}", basename(file), line)?;
            }
        }
        Ok(())
    }
}

/// Log output styles.
#[derive(Debug, Copy, Clone)]
pub enum LogStyle {
    Default,
    Compact,
    Json,
}

// Custom struct used to format trace events.
#[derive(Debug, Copy, Clone)]
pub struct LogFormat {
    ansi: bool,
    style: LogStyle,
    show_date: bool,
    show_host: bool,
}

impl Default for LogFormat {
    fn default() -> Self {
        Self {
            ansi: false,
            style: LogStyle::Default,
            show_date: true,
            show_host: false,
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut r = Self::default();

        for p in s.split(',').filter(|i| !i.is_empty()) {
            match p {
                "default" => r.style = LogStyle::Default,
                "compact" => r.style = LogStyle::Compact,
                "json" => r.style = LogStyle::Json,
                "color" => r.ansi = true,
                "nocolor" => r.ansi = false,
                "date" => r.show_date = true,
                "nodate" => r.show_date = false,
                "host" => r.show_host = true,
                "nohost" => r.show_host = false,
                _ => return Err(format!("Bad log format option: {p}")),
            }
        }

        Ok(r)
    }
}

// Format a trace event.
impl<S, N> FormatEvent<S, N> for LogFormat
where
    S: tracing_core::subscriber::Subscriber + for<'s> LookupSpan<'s>,
    N: for<'w> FormatFields<'w> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        writer: &mut dyn fmt::Write,
        evt: &Event<'_>,
    ) -> std::fmt::Result {
        match self.style {
            LogStyle::Default => self.default_style(ctx, writer, evt),
            LogStyle::Compact => self.compact_style(ctx, writer, evt),
            LogStyle::Json => self.json_style(ctx, writer, evt),
        }
    }
}

fn ellipsis(s: &str, w: usize) -> String {
    if w < 8 || s.len() <= w {
        s.to_owned()
    } else {
        format!("{}...", &s[..w - 3])
    }
}

/// Input struct for json serializer.
#[derive(Serialize)]
struct JsonLogger {
    hostname: String,
    level: String,
    timestamp: String,
    fields: HashMap<String, String>,
}

/// Visitor struct for fetching Event fields.
pub struct StringVisitor<'a> {
    string: &'a mut String,
}

impl Visit for StringVisitor<'_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        write!(self.string, "{} = {:?}; ", field.name(), value).unwrap();
    }
}

impl<'a> StringVisitor<'a> {
    pub fn new(string: &'a mut String) -> Self {
        Self { string }
    }
}

impl LogFormat {
    /// Formats an event in default mode.
    fn default_style<S, N>(
        &self,
        context: &FmtContext<'_, S, N>,
        writer: &mut dyn fmt::Write,
        event: &Event<'_>,
    ) -> std::fmt::Result
    where
        S: tracing_core::subscriber::Subscriber + for<'s> LookupSpan<'s>,
        N: for<'w> FormatFields<'w> + 'static,
    {
        let meta = event.metadata();
        let chrono_fmt = if self.show_date {
            "%FT%T%.9f%Z"
        } else {
            "%T%.6f"
        };

        write!(
            writer,
            "[{}{} {} {}{}:{}] ",
            self.hostname(),
            chrono::Local::now().format(chrono_fmt),
            FormatLevel::new(meta.level(), self.ansi),
            meta.target(),
            CustomContext::new(context, event.parent(), self.ansi),
            Location::new(meta)
        )?;

        context.format_fields(writer, event)?;

        writeln!(writer)
    }

    /// Formats an event in compact mode.
    fn compact_style<S, N>(
        &self,
        context: &FmtContext<'_, S, N>,
        writer: &mut dyn fmt::Write,
        event: &Event<'_>,
    ) -> std::fmt::Result
    where
        S: tracing_core::subscriber::Subscriber + for<'s> LookupSpan<'s>,
        N: for<'w> FormatFields<'w> + 'static,
    {
        let meta = event.metadata();
        let loc = ellipsis(&Location::new(meta).to_string(), 18);
        let fmt = FormatLevel::new(meta.level(), self.ansi);
        let now = chrono::Local::now();

        let mut buf = String::new();

        write!(
            buf,
            "{}{} | {:<18} [{}] ",
            self.hostname(),
            now.format(if self.show_date {
                "%x %T%.6f"
            } else {
                "%T%.6f"
            }),
            loc,
            fmt.short(),
        )?;

        let ctx = CustomContext::new(context, event.parent(), false).to_string();
        if ctx.len() > 1 {
            write!(buf, "{}: ", &ctx[1..])?;
        }

        fmt.fmt_line(writer, &buf)?;

        context.format_fields(writer, event)?;

        writeln!(writer)
    }

    /// Formats an event in json mode to stdout.
    fn json_style<S, N>(
        &self,
        _context: &FmtContext<'_, S, N>,
        writer: &mut dyn fmt::Write,
        event: &Event<'_>,
    ) -> std::fmt::Result
    where
        S: tracing_core::subscriber::Subscriber + for<'s> LookupSpan<'s>,
        N: for<'w> FormatFields<'w> + 'static,
    {
        let meta = event.metadata();
        let fmt = FormatLevel::new(meta.level(), self.ansi);
        let now = chrono::Local::now();

        let mut output_string = String::new();
        let mut visitor = StringVisitor::new(&mut output_string);
        event.record(&mut visitor);
        let output = visitor.string;
        let key = "message".to_string();
        let output = output.trim_end_matches("; ");
        let val = match output.strip_prefix("message = ") {
            Some(stripped) => stripped,
            None => output,
        };
        let mut msg = HashMap::new();
        msg.insert(key, val.to_string());

        let json_log = JsonLogger {
            hostname: self.hostname().to_string(),
            level: fmt.long(),
            timestamp: now.to_rfc2822(),
            fields: msg,
        };
        let json_str = serde_json::to_string(&json_log).unwrap_or_default();
        fmt.fmt_line(writer, &json_str)?;
        writeln!(writer)
    }

    fn hostname(&self) -> &str {
        if self.show_host {
            HOSTNAME_PREFIX
                .get_or_init(|| format!("{} :: ", get_hostname()))
                .as_str()
        } else {
            ""
        }
    }
}

/// Configures the logging format and level. `level` follows `RUST_LOG`
/// syntax, e.g. `raidguardd=debug`.
pub fn init_ex(level: &str, format: LogFormat) {
    // Bridges `log`-facade messages (nix, udev, tokio internals) into
    // `tracing` events.
    LogTracer::init().expect("failed to initialise LogTracer");

    let builder = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::FULL)
        .event_format(format);

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = Registry::default().with(filter).with(builder);

    tracing::subscriber::set_global_default(subscriber).expect("failed to set default subscriber");
}

pub fn init(level: &str) {
    init_ex(level, Default::default())
}
