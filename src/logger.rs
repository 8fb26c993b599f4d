use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::SubscriberBuilder;


/// Keeps the non-blocking writer alive. Clones share one writer; `flush` on any of them
/// writes out what is buffered and stops it, so a path that ends in `process::exit` loses nothing.
#[derive(Clone)]
pub struct LogGuard(Arc<Mutex<Option<WorkerGuard>>>);

impl LogGuard {
    fn new(guard: WorkerGuard) -> Self {
        Self(Arc::new(Mutex::new(Some(guard))))
    }

    pub fn flush(&self) {
        let guard = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(guard);
    }
}



/*
    @@@
    @file_subscriber();
    . Creates a daily-rotating log file (<dir>/webvisor.log) and wraps it in a non-blocking writer.
    . Configures a tracing subscriber at `level` (with targets and levels, no ANSI) on that writer.
*/
pub fn file_subscriber(
    dir: &Path,
    level: &str,
) -> anyhow::Result<(impl tracing::Subscriber + Send + Sync + 'static, LogGuard)> {
    let level = tracing::Level::from_str(level)
        .map_err(|_| anyhow::anyhow!("unknown log level `{level}`"))?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "webvisor.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let subscriber = SubscriberBuilder::default()
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_writer(non_blocking)
        .with_max_level(level)
        .finish();

    Ok((subscriber, LogGuard::new(guard)))
}

/// Installs the file subscriber globally. Keep the guard until shutdown.
pub fn logs_tracing(dir: &Path, level: &str) -> anyhow::Result<LogGuard> {
    let (subscriber, guard) = file_subscriber(dir, level)?;
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(guard)
}
