//! Log routing
//!
//! ```text
//!            ┌─ file (text or JSON, rotated) ── everything that passes EnvFilter
//! tracing ───┼─ stdout ── progress lines, debug chatter   (INFO and below)
//!            └─ stderr ── MISMATCH blocks, SELECT failed,  (WARN, ERROR)
//!                         connection failures
//! ```
//!
//! The console split holds in JSON mode too, so an operator watching a CI
//! run sees mismatches and failures live without tailing the log file.

use std::io;
use tracing::{Level, Metadata, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

use crate::config::ProbeConfig;

/// Events that belong on the operator's error stream
pub fn is_operator_alert(meta: &Metadata<'_>) -> bool {
    let level = *meta.level();
    level == Level::ERROR || level == Level::WARN
}

/// Console layers: alerts to `err`, everything else to `out`.
pub fn console_layers<S, O, E>(out: O, err: E, ansi: bool) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    O: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    E: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(out)
        .with_filter(filter_fn(|meta| !is_operator_alert(meta)));
    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(err)
        .with_filter(filter_fn(is_operator_alert));
    stdout_layer.and_then(stderr_layer)
}

/// Install the global subscriber. Keep the guard alive until exit so the
/// file writer flushes.
pub fn init_logging(config: &ProbeConfig) -> WorkerGuard {
    let file_appender = match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => tracing_appender::rolling::daily(&config.log_dir, &config.log_file),
        _ => tracing_appender::rolling::never(&config.log_dir, &config.log_file),
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // sqlx logs every statement at info; that would drown the progress lines.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", config.log_level)));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(console_layers(io::stdout, io::stderr, true));

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    }

    guard
}
