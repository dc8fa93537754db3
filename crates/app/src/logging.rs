//! File logging for the CLI.
//!
//! Options come from clap (flag, then `PARLEY_*` env var). The filter falls
//! back to `RUST_LOG` and then to `info`. Events go to `parley.log` in the
//! log directory as flattened JSON or pretty text.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Args, ValueEnum};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const DEFAULT_FILTER: &str = "info";
const LOG_FILE: &str = "parley.log";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        }
    }
}

#[derive(Debug, Clone, Default, Args)]
pub struct LogOptions {
    /// Tracing filter directives, e.g. `parley=debug,info`
    #[arg(long, global = true, env = "PARLEY_LOG_FILTER")]
    pub log_filter: Option<String>,

    #[arg(long, global = true, env = "PARLEY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,

    /// Start with an empty log file
    #[arg(long, global = true, env = "PARLEY_TRUNCATE_LOG")]
    pub truncate_log: bool,

    /// Identifier stamped on this run's startup event
    #[arg(long, global = true, env = "PARLEY_RUN_ID")]
    pub run_id: Option<String>,
}

impl LogOptions {
    /// Filter to install: explicit option, then `rust_log`, then the default.
    pub fn filter_directives(&self, rust_log: Option<String>) -> String {
        self.log_filter
            .clone()
            .or(rust_log)
            .filter(|directives| !directives.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string())
    }

    pub fn resolve_run_id(&self) -> String {
        self.run_id.clone().unwrap_or_else(|| {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or(0);
            format!("pid-{}-{}", std::process::id(), now)
        })
    }
}

pub struct LoggingHandle {
    pub run_id: String,
    pub guard: WorkerGuard,
}

pub fn init_logging(log_dir: &Path, options: &LogOptions) -> anyhow::Result<LoggingHandle> {
    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE);

    if options.truncate_log {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)?;
    }

    let directives = options.filter_directives(std::env::var("RUST_LOG").ok());
    let (filter, filter_rejected) = match EnvFilter::try_new(&directives) {
        Ok(filter) => (filter, false),
        Err(_) => (EnvFilter::new(DEFAULT_FILTER), true),
    };

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, LOG_FILE));
    let layer = match options.log_format {
        LogFormat::Json => fmt::layer()
            .with_writer(writer)
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .pretty()
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init()?;

    let run_id = options.resolve_run_id();

    if filter_rejected {
        tracing::warn!(
            component = "logging",
            event = "logging.filter_rejected",
            filter = %directives,
            "Invalid log filter, using default"
        );
    }
    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        log_path = %log_path.display(),
        format = options.log_format.as_str(),
        filter = %directives,
        run_id = %run_id,
    );

    Ok(LoggingHandle { run_id, guard })
}
