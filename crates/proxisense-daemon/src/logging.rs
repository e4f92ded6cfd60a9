//! Logging initialization and configuration.
//!
//! - **Production**: JSON logs to a rolling file under the configured log
//!   directory, plus compact logs to stdout for journald
//! - **Development**: Pretty logs to stdout with span events
//!
//! The filter comes from `RUST_LOG` when set, then `PROXISENSE_LOG_LEVEL`,
//! then `logging.level` in the configuration file.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Context;
use proxisense_core::{LogRotation, LoggingConfig};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable overriding the configured log level.
pub const LOG_LEVEL_ENV: &str = "PROXISENSE_LOG_LEVEL";

const FILE_PREFIX: &str = "proxisense";

/// Static guards to keep non-blocking writers alive for the whole run.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static STDOUT_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber described by `config`.
///
/// # Errors
///
/// Returns an error if the filter cannot be parsed or, in production, the
/// log directory cannot be created.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let directive = resolve_level(std::env::var(LOG_LEVEL_ENV).ok(), &config.level);
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&directive))
        .with_context(|| format!("invalid log filter `{directive}`"))?;

    if config.production {
        let dir = log_directory(config.directory.as_deref());
        let appender = file_appender(&dir, config.rotation)?;
        init_production(env_filter, appender);
    } else {
        init_development(env_filter);
    }

    Ok(())
}

fn resolve_level(from_env: Option<String>, configured: &str) -> String {
    from_env
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| configured.to_string())
}

const fn rotation(rotation: LogRotation) -> Rotation {
    match rotation {
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    }
}

fn file_appender(dir: &Path, every: LogRotation) -> anyhow::Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("cannot create log directory {}", dir.display()))?;
    RollingFileAppender::builder()
        .rotation(rotation(every))
        .filename_prefix(FILE_PREFIX)
        .filename_suffix("log")
        .build(dir)
        .with_context(|| format!("cannot open log file in {}", dir.display()))
}

fn init_production(env_filter: EnvFilter, appender: RollingFileAppender) {
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(appender);
    let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_stdout)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);
}

fn init_development(env_filter: EnvFilter) {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();
}

/// The configured directory, else `/var/log/proxisense` on Linux and the
/// platform data dir elsewhere.
fn log_directory(configured: Option<&Path>) -> PathBuf {
    if let Some(dir) = configured {
        return dir.to_path_buf();
    }
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/proxisense")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "proxisense")
            .map(|dirs| dirs.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("./logs"))
    }
}
