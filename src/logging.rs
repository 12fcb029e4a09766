//! Tracing setup.
//!
//! Console output goes to stderr; a daily rolling `deskflow.log` goes to the
//! data directory, or to `DESKFLOW_LOG_DIR` when set. With
//! `DESKFLOW_LOG_FORMAT=json` the file carries one JSON object per event,
//! including the current span, for log shippers.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,deskflow=debug";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => bail!("unknown log format '{}', expected text or json", other),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
}

impl LogOptions {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let format = match lookup("DESKFLOW_LOG_FORMAT") {
            Some(value) => value.parse().context("DESKFLOW_LOG_FORMAT")?,
            None => LogFormat::default(),
        };
        Ok(Self {
            dir: lookup("DESKFLOW_LOG_DIR")
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
            format,
        })
    }

    fn log_dir(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => Ok(dir.clone()),
            None => {
                let dirs = directories::ProjectDirs::from("com", "deskflow", "deskflow")
                    .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
                Ok(dirs.data_dir().join("logs"))
            }
        }
    }
}

/// Install the global subscriber. Hold the returned guard until exit so the
/// file writer flushes.
pub fn init(options: &LogOptions) -> Result<(WorkerGuard, PathBuf)> {
    let log_dir = options.log_dir()?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "deskflow.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (text_file, json_file) = match options.format {
        LogFormat::Text => (
            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            ),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(non_blocking)
                    .with_target(true),
            ),
        ),
    };

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(text_file)
        .with(json_file)
        .with(console_layer)
        .try_init()?;

    tracing::debug!(
        "Logging to {} as {:?}",
        log_dir.display(),
        options.format
    );

    Ok((guard, log_dir))
}

/// Console-only subscriber for tests. The first caller wins.
#[cfg(test)]
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}
