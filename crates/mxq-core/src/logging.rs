//! Tracing initialisation.
//!
//! All crates log through `tracing`. Binaries install the subscriber once at
//! start-up with [`init`] or [`init_from_settings`]; `RUST_LOG`, when set,
//! overrides the configured level.
//!
//! # Example
//! ```no_run
//! use mxq_core::logging::{self, OutputFormat, TracingConfig};
//! use tracing::Level;
//!
//! logging::init(TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Json))?;
//! tracing::info!(queue = "demo", "Queue started");
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, Result};
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::Settings;

/// Log line layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Multi-line and coloured, for a terminal
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// JSON lines for log collectors
    Json,
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: Level,
    /// Line format.
    pub format: OutputFormat,
    /// Also log span entry and exit (centring sessions, queue runs).
    pub with_span_events: bool,
    /// Colour output.
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl TracingConfig {
    /// Compact, coloured output at `level`.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::default(),
            with_span_events: false,
            with_ansi: true,
        }
    }

    /// Level taken from `settings.log_level`.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self::new(parse_log_level(&settings.log_level)?))
    }

    /// Set the line format.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Log span entry and exit.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable colours.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str().to_lowercase()))
    }

    fn span_events(&self) -> FmtSpan {
        if self.with_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let base = fmt::layer().with_span_events(self.span_events());
        match self.format {
            OutputFormat::Pretty => base.pretty().with_ansi(self.with_ansi).boxed(),
            OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
            OutputFormat::Json => base.json().boxed(),
        }
    }
}

/// Install the global subscriber configured from `settings`.
pub fn init_from_settings(settings: &Settings) -> Result<()> {
    init(TracingConfig::from_settings(settings)?)
}

/// Install the global subscriber.
///
/// A subscriber installed earlier (tests, a host application) is kept and
/// this call succeeds.
pub fn init(config: TracingConfig) -> Result<()> {
    let installed = tracing_subscriber::registry()
        .with(config.layer().with_filter(config.filter()))
        .try_init();
    match installed {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("global default") => Ok(()),
        Err(e) => Err(anyhow!("Failed to initialize tracing: {}", e)),
    }
}

/// Parse `"trace"`, `"debug"`, `"info"`, `"warn"` or `"error"` (any case).
pub fn parse_log_level(level: &str) -> Result<Level> {
    level.parse::<Level>().map_err(|_| {
        anyhow!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_parse_in_any_case() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("Debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn config_takes_level_from_settings() {
        let settings = Settings {
            log_level: "debug".to_string(),
            ..Default::default()
        };
        let config = TracingConfig::from_settings(&settings).unwrap();
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, OutputFormat::Compact);
    }

    #[test]
    fn init_twice_is_harmless() {
        let config = TracingConfig::new(Level::WARN).with_ansi(false);
        assert!(init(config.clone()).is_ok());
        assert!(init(config.with_format(OutputFormat::Json)).is_ok());
    }
}
