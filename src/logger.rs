use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter (e.g. `debug`,
/// `service_fixture=trace`).
pub const LOG_ENV: &str = "SERVICE_FIXTURE_LOG";

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

/*
    @@@
    @init_file_logging();
    . Creates a daily-rotating log file (<dir>/service-fixture.log) and wraps it in a non-blocking writer.
    . Filters by SERVICE_FIXTURE_LOG, defaulting to INFO, with timestamps, thread names and targets.
    . Keeps the appender alive by returning the guard.
*/
pub fn init_file_logging(dir: &Path) -> anyhow::Result<WorkerGuard> {
    let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "service-fixture.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let subscriber = SubscriberBuilder::default()
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_thread_names(true)
        .with_writer(non_blocking)
        .with_env_filter(filter())
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(guard)
}

/*
    @@@
    @init_stderr_logging();
    . Same filter, written to stderr so stdout stays free for the pid and details.
*/
pub fn init_stderr_logging() -> anyhow::Result<()> {
    let subscriber = SubscriberBuilder::default()
        .with_target(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .with_env_filter(filter())
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
