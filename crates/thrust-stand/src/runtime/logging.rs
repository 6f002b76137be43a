use std::path::Path;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "thrust-stand.log";
const DEFAULT_DIRECTIVES: &str = "info,thrust_stand=debug,stand_core=debug";

/// Target of every line crossing the link. Off on the console by default,
/// always on in the session log.
pub const LINK_TARGET: &str = "link";

/// Initialize the tracing subscriber with optional JSON output and an
/// optional daily-rolling session log under `log_dir`.
///
/// The returned guard flushes the file writer on drop; hold it for the
/// life of the process.
pub fn init_tracing(json_output: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(session_layer(writer)), Some(guard))
        }
        None => (None, None),
    };

    // Console logs go to stderr; stdout carries the link in --stdin mode.
    let registry = tracing_subscriber::registry().with(file_layer);
    if json_output {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter()),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .pretty()
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter()),
            )
            .init();
    }
    guard
}

fn console_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Plain-text session log: the usual diagnostics plus timestamped link
/// traffic in both directions.
pub(crate) fn session_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(EnvFilter::new(format!(
            "{},{}=debug",
            DEFAULT_DIRECTIVES, LINK_TARGET
        )))
}

/// In-memory writer for asserting on formatted log output.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct CaptureWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

#[cfg(test)]
impl CaptureWriter {
    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[cfg(test)]
impl std::io::Write for CaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
impl<'a> MakeWriter<'a> for CaptureWriter {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
