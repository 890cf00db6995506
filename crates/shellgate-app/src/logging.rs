use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{prelude::*, EnvFilter, Layer};

use crate::cli::{Cli, LogFormat};

const DEFAULT_FILTER: &str = "shellgate=info,tower_http=info";

/// `--log-level` wins over `RUST_LOG`, which wins over the built-in filter
fn env_filter(level: Option<&str>) -> Result<EnvFilter> {
    match level {
        Some(directives) => {
            EnvFilter::try_new(directives).with_context(|| format!("invalid log filter '{}'", directives))
        }
        None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))),
    }
}

/// Install the global subscriber for the process
pub fn init(cli: &Cli) -> Result<()> {
    let filter = env_filter(cli.log_level.as_deref())?;
    let layer = fmt_layer(cli.log_format, cli.log_file.as_deref())?;

    if let Err(err) = tracing_subscriber::registry().with(layer).with(filter).try_init() {
        tracing::warn!(error = %err, "tracing already initialized");
    }
    Ok(())
}

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

fn fmt_layer(format: LogFormat, file: Option<&Path>) -> Result<BoxedLayer> {
    let layer = match file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let writer = Arc::new(file);
            match format {
                LogFormat::Json => tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .boxed(),
                LogFormat::Pretty => tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .boxed(),
            }
        }
        None => match format {
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .boxed(),
            LogFormat::Pretty => tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .boxed(),
        },
    };
    Ok(layer)
}
