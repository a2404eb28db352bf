//! Process-wide `tracing` setup.
//!
//! Console output goes to stderr so stdout stays parseable. `RUST_LOG`
//! overrides `[logging].level`. When `[logging].file` is set, events are
//! also written to that file through a non-blocking appender; the file
//! never gets ANSI colours. Keep the returned guard alive for the life
//! of the process or buffered lines are lost on exit.

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Install the global subscriber. Returns the file writer guard, if any.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let json = config.format == "json";

    let console = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(atty::is(atty::Stream::Stderr))
            .boxed()
    };

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(std::path::Path::new("."));
            std::fs::create_dir_all(dir)?;
            let name = path
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or("smoothbrain.log");
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = if json {
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .boxed()
            } else {
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file_layer)
        .try_init();

    tracing::debug!(
        format = %config.format,
        file = config
            .file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(stderr)".to_string()),
        "logging initialized"
    );

    Ok(guard)
}
