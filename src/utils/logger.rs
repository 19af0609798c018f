//! Logging utilities

use crate::Result;
use std::path::Path;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Initialize logging system
///
/// Console output plus a daily-rotated file next to `log_file`. `RUST_LOG`
/// overrides `log_level` when set.
pub fn init<P: AsRef<Path>>(log_level: &str, log_file: P) -> Result<()> {
    let log_file = log_file.as_ref();
    let directory = log_file.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(directory)?;

    let file_appender = RollingFileAppender::new(
        Rotation::DAILY,
        directory,
        log_file
            .file_name()
            .unwrap_or(std::ffi::OsStr::new("odds-aggregator.log")),
    );

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    Registry::default()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}

/// Log provider activity with structured fields
#[macro_export]
macro_rules! log_provider {
    ($level:ident, $provider:expr, $operation:expr, $($field:tt)*) => {
        tracing::$level!(
            provider = %$provider,
            operation = %$operation,
            $($field)*
        );
    };
}

/// Log transport lifecycle with structured fields
#[macro_export]
macro_rules! log_transport {
    ($level:ident, $method:expr, $status:expr, $($field:tt)*) => {
        tracing::$level!(
            method = %$method,
            status = %$status,
            $($field)*
        );
    };
}

/// Log an arbitrage opportunity with structured fields
#[macro_export]
macro_rules! log_arbitrage {
    ($level:ident, $event:expr, $market:expr, $profit_pct:expr, $($field:tt)*) => {
        tracing::$level!(
            event = %$event,
            market = %$market,
            profit_pct = %$profit_pct,
            $($field)*
        );
    };
}
