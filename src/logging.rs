use crate::config::{self, LogFormat, LoggingConfig};
use std::path::Path;
use std::sync::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global subscriber: stderr in the configured format plus,
/// when `log_file` can be opened, an append-only JSON-lines file.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init(config: &LoggingConfig, log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| configured_filter(config));

    let stderr_layer = match config.format {
        LogFormat::Text => fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let mut open_error = None;
    let file_layer = log_file.and_then(|path| match open_append(path) {
        Ok(file) => Some(
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .boxed(),
        ),
        Err(e) => {
            open_error = Some((path.to_path_buf(), e));
            None
        }
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();

    if let Some((path, e)) = open_error {
        tracing::warn!(path = %path.display(), error = %e, "log file unavailable, logging to stderr only");
    }
}

/// Filter for the configured level. Unknown names fall back to `info`;
/// `validate` reports them once logging is up.
fn configured_filter(config: &LoggingConfig) -> EnvFilter {
    let level = config::level_filter(&config.level).unwrap_or(LevelFilter::INFO);
    EnvFilter::new(level.to_string().to_lowercase())
}

fn open_append(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}
