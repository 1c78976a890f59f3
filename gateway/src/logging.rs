use crate::config::LoggingConf;
use crate::error::ConfigError;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSink {
    Stdout,
    Stderr,
    File(PathBuf),
}

pub fn resolve_sink(conf: &LoggingConf) -> Result<LogSink, ConfigError> {
    match (conf.destination.as_str(), conf.target.as_str()) {
        ("stream", "stdout") => Ok(LogSink::Stdout),
        ("stream", "stderr") => Ok(LogSink::Stderr),
        ("stream", other) => Err(ConfigError::UnsupportedLogDestination(format!("stream:{other}"))),
        ("file", path) if !path.is_empty() => Ok(LogSink::File(PathBuf::from(path))),
        (other, _) => Err(ConfigError::UnsupportedLogDestination(other.to_string())),
    }
}

/// Installs the global subscriber. `RUST_LOG` wins over `logging.level`.
pub fn init_logging(conf: &LoggingConf) -> Result<(), ConfigError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&conf.level));
    let registry = tracing_subscriber::registry().with(filter);

    // try_init: a second call (tests, reload) keeps the first subscriber
    let _ = match resolve_sink(conf)? {
        LogSink::Stdout => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogSink::Stderr => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogSink::File(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| ConfigError::Io { path, source })?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::sync::Mutex::new(file))
                        .with_ansi(false),
                )
                .try_init()
        }
    };
    Ok(())
}
