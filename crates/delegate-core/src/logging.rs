//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured filter. When a log
//! directory is configured, output goes to a daily rolling file through a
//! non-blocking writer whose guard must be held for the life of the process.

use anyhow::{Context, Result, anyhow};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "delegate.log";

/// Builds the filter: `RUST_LOG` if set, otherwise the configured directive.
///
/// # Errors
/// Returns an error if the configured directive does not parse.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.filter)
        .with_context(|| format!("Invalid logging filter '{}'", config.filter))
}

/// Installs the global subscriber.
///
/// Returns the appender guard when logging to a file; dropping it flushes and
/// stops the background writer.
///
/// # Errors
/// Returns an error if the filter is invalid, the log directory cannot be
/// created, or a global subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(config)?;

    match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_filter() {
        // RUST_LOG short-circuits the configured directive.
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            filter: "delegate=[".to_string(),
            dir: None,
        };
        assert!(build_filter(&config).is_err());
    }

    #[test]
    fn accepts_module_directives() {
        let config = LoggingConfig {
            filter: "info,delegate_core=debug".to_string(),
            dir: None,
        };
        assert!(build_filter(&config).is_ok());
    }
}
