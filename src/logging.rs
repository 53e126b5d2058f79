//! Diagnostics output
//!
//! stdout is the relayed data channel back to the calling domain, and
//! qrexec forwards stderr to the caller as well. Logs go to journald or to a
//! rolling file; stderr only when configured explicitly.

use anyhow::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, LogOutput, LoggingConfig};

const LOG_FILE_PREFIX: &str = "qrexec-proxy.log";
#[cfg(unix)]
const SYSLOG_IDENTIFIER: &str = "qrexec-proxy";

/// `RUST_LOG` wins over the configured level; `debug` raises the default
pub fn env_filter(config: &LoggingConfig, debug: bool) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = if debug { "debug" } else { config.level.as_str() };
    Ok(EnvFilter::try_new(format!("qrexec_proxy={level}"))?)
}

/// Directory of the rolling log file
pub fn log_directory(config: &LoggingConfig) -> PathBuf {
    config.directory.clone().unwrap_or_else(|| {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join("qrexec-proxy")
            .join("log")
    })
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process, or buffered file output is lost.
///
/// Journald output falls back to the rolling file when the journal socket
/// cannot be reached.
pub fn init(config: &LoggingConfig, debug: bool) -> Result<Option<WorkerGuard>> {
    let filter = env_filter(config, debug)?;

    #[cfg(unix)]
    if config.output == LogOutput::Journald {
        if let Ok(journald) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(filter)
                .with(journald.with_syslog_identifier(SYSLOG_IDENTIFIER.to_string()))
                .try_init()?;
            return Ok(None);
        }
    }

    let (writer, guard) = match config.output {
        LogOutput::Stderr => (BoxMakeWriter::new(std::io::stderr), None),
        LogOutput::Journald | LogOutput::File => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_FILE_PREFIX)
                .build(log_directory(config))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
    };

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Text => registry
            .with(fmt::layer().with_ansi(false).with_writer(writer))
            .try_init()?,
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(writer))
            .try_init()?,
    }

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_raises_level() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig::default();
        let filter = env_filter(&config, true).unwrap();
        assert_eq!(filter.to_string(), "qrexec_proxy=debug");
        let filter = env_filter(&config, false).unwrap();
        assert_eq!(filter.to_string(), "qrexec_proxy=info");
    }

    #[test]
    fn test_invalid_level() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "loud=[".into(),
            ..LoggingConfig::default()
        };
        assert!(env_filter(&config, false).is_err());
    }

    #[test]
    fn test_defaults_keep_stderr_quiet() {
        let config = LoggingConfig::default();
        assert_eq!(config.output, LogOutput::Journald);

        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            directory: Some(dir.path().to_path_buf()),
            ..LoggingConfig::default()
        };
        assert_eq!(log_directory(&config), dir.path());
        assert!(log_directory(&LoggingConfig::default()).ends_with("qrexec-proxy/log"));
    }
}
