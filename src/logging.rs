use std::fmt;
use std::path::Path;
use tracing::{Event, Subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Event formatter that prefixes every line with the process namespace.
///
/// The orchestrator, master, and workers all log to the same terminal;
/// the prefix is what keeps interleaved output attributable:
///
/// ```text
///  INFO [worker_1] worker_1 serving websockets at 127.0.0.1:9002
/// ```
pub struct NamespaceFormatter {
    namespace: String,
}

impl NamespaceFormatter {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

impl<S, N> FormatEvent<S, N> for NamespaceFormatter
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
        write!(
            writer,
            "{:>5} [{}] ",
            event.metadata().level(),
            self.namespace
        )?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Initializes tracing for one fabric process.
///
/// Verbosity maps `-v` counts to levels (default info, `-v` debug, `-vv`
/// and up trace). Stdout gets the namespace-prefixed format unless
/// `quiet`; `log_file` adds a daily-rotated plain file layer. The
/// returned guard must stay alive for file logging to flush.
pub fn init(
    namespace: &str,
    verbose: u8,
    quiet: bool,
    log_file: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let mut guard = None;
    let file_layer = log_file.map(|path| {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let name = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("ws-fabric.log"));
        let appender = tracing_appender::rolling::daily(dir, name);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(level)
            .boxed()
    });

    let stdout_layer = (!quiet).then(|| {
        tracing_subscriber::fmt::layer()
            .event_format(NamespaceFormatter::new(namespace))
            .with_filter(level)
            .boxed()
    });

    let _ = tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .try_init();
    guard
}
