//! Tracing infrastructure for the rig.
//!
//! Structured, async-aware logging built on `tracing` and
//! `tracing-subscriber`: environment-based filtering (`RUST_LOG` wins over
//! the configured level) and a choice of pretty or compact output. An
//! optional file layer can mirror everything into the session folder so
//! each acquisition carries its own log.

use crate::config::RigConfig;
use crate::error::{RigError, RigResult};
use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Pretty-printed with colors (development)
    Pretty,
    /// Compact, no colors (acquisition machines)
    Compact,
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub level: Level,
    pub format: OutputFormat,
    /// Mirror log output into this file as well
    pub log_file: Option<std::path::PathBuf>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            log_file: None,
        }
    }
}

impl TracingConfig {
    pub fn from_rig_config(config: &RigConfig) -> RigResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.hardware.log_level)?,
            ..Default::default()
        })
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_log_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.log_file = Some(path.as_ref().to_path_buf());
        self
    }
}

/// Initialize tracing from the rig configuration.
pub fn init_from_config(config: &RigConfig) -> RigResult<()> {
    init(TracingConfig::from_rig_config(config)?)
}

/// Initialize tracing with custom configuration.
///
/// Idempotent: if a global dispatcher is already set (common in tests),
/// this returns Ok(()) without error.
pub fn init(config: TracingConfig) -> RigResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string().to_lowercase()));

    let file_layer = match &config.log_file {
        Some(path) => {
            let file = File::create(path)?;
            Some(
                fmt::layer()
                    .compact()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    let fmt_layer = match config.format {
        OutputFormat::Pretty => fmt::layer().pretty().with_ansi(true).boxed(),
        OutputFormat::Compact => fmt::layer().compact().with_ansi(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.and_then(file_layer).with_filter(env_filter))
        .try_init()
        .or_else(|e| {
            if e.to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(RigError::Configuration(format!(
                    "failed to initialize tracing: {e}"
                )))
            }
        })
}

fn parse_log_level(level: &str) -> RigResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(RigError::Configuration(format!(
            "invalid log level '{other}', must be one of: trace, debug, info, warn, error"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_levels_case_insensitively() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("INFO"), Ok(Level::INFO)));
        assert!(matches!(parse_log_level("Warn"), Ok(Level::WARN)));
        assert!(parse_log_level("loud").is_err());
    }

    #[test]
    fn init_is_idempotent() {
        assert!(init(TracingConfig::default()).is_ok());
        assert!(init(TracingConfig::default()).is_ok());
    }

    #[test]
    fn file_layer_creates_the_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.log");
        assert!(init(TracingConfig::default().with_log_file(&path)).is_ok());
        assert!(path.exists());
    }
}
