use clap::ValueEnum;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const FILTER_ENV: &str = "RTC_BOT_LOG_FILTER";
pub const TRACE_DEPS_ENV: &str = "RTC_BOT_TRACE_DEPS";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Where and how much the bot logs. `file` is appended to; stderr otherwise.
#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

// Holding the guard keeps the writer thread flushing until exit.
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }
    let filter = build_env_filter(config.level.into(), |var| std::env::var(var).ok());
    let (writer, guard) = match &config.file {
        Some(path) => tracing_appender::non_blocking(append_to(path)?),
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    Ok(())
}

fn append_to(path: &Path) -> Result<File, InitError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| InitError::Io {
            path: path.to_path_buf(),
            source,
        })
}

const DEP_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_srtp",
    "webrtc_sctp",
    "webrtc_mdns",
    "tokio_tungstenite",
    "tungstenite",
    "hyper",
    "reqwest",
];

/// Directive string for the subscriber. An explicit filter variable wins;
/// otherwise dependency targets are held at `warn` unless dependency traces
/// were asked for.
fn build_env_filter(level: LevelFilter, lookup: impl Fn(&str) -> Option<String>) -> String {
    if let Some(filter) = lookup(FILTER_ENV).filter(|value| !value.trim().is_empty()) {
        return filter;
    }
    let mut filter = level.to_string().to_lowercase();
    let deps_allowed = lookup(TRACE_DEPS_ENV)
        .and_then(|value| env_truthy(&value))
        .unwrap_or(false);
    if !deps_allowed {
        for target in DEP_TARGETS {
            filter.push(',');
            filter.push_str(target);
            filter.push_str("=warn");
        }
    }
    filter
}

fn env_truthy(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn explicit_filter_wins() {
        let filter = build_env_filter(
            LevelFilter::INFO,
            lookup(&[(FILTER_ENV, "media_session=trace"), (TRACE_DEPS_ENV, "0")]),
        );
        assert_eq!(filter, "media_session=trace");
    }

    #[test]
    fn dependencies_are_clamped_by_default() {
        let filter = build_env_filter(LevelFilter::DEBUG, lookup(&[]));
        assert!(filter.starts_with("debug,"));
        assert!(filter.contains("webrtc=warn"));
        assert!(filter.contains("tungstenite=warn"));
    }

    #[test]
    fn dependency_traces_can_be_enabled() {
        let filter = build_env_filter(LevelFilter::TRACE, lookup(&[(TRACE_DEPS_ENV, "yes")]));
        assert_eq!(filter, "trace");
    }

    #[test]
    fn truthy_values() {
        assert_eq!(env_truthy(" On "), Some(true));
        assert_eq!(env_truthy("0"), Some(false));
        assert_eq!(env_truthy("maybe"), None);
        assert_eq!(LevelFilter::from(LogLevel::Warn), LevelFilter::WARN);
    }
}
