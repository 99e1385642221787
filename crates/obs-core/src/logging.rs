//! Tracing subscriber setup.
//!
//! Daemons log through the `tracing` macros with structured fields; this module installs
//! the global subscriber once per process. `RUST_LOG` overrides the configured level.
//!
//! # Example
//! ```no_run
//! use obs_core::{config::ObsConfig, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ObsConfig::load_from("obs.toml")?;
//! logging::init_from_config(&config)?;
//! info!(daemon = "dome", "Daemon started");
//! # Ok(())
//! # }
//! ```

use crate::config::ObsConfig;
use crate::error::{ObsError, ObsResult};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line with colors (for development)
    Pretty,
    /// One line per event without colors (for daemons under a supervisor)
    Compact,
    /// JSON (for log aggregation)
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = ObsError;

    fn from_str(s: &str) -> ObsResult<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(ObsError::Config(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                other
            ))),
        }
    }
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    pub level: Level,
    pub format: OutputFormat,
    /// Log span open/close events
    pub with_span_events: bool,
    pub with_file_and_line: bool,
    /// ANSI colors (Pretty format only)
    pub with_ansi: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl LoggingOptions {
    pub fn from_config(config: &ObsConfig) -> ObsResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.logging.level)?,
            format: config.logging.format.parse()?,
            ..Default::default()
        })
    }

    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }
}

/// Initialize logging from the loaded configuration
pub fn init_from_config(config: &ObsConfig) -> ObsResult<()> {
    init(LoggingOptions::from_config(config)?)
}

/// Install the global subscriber
///
/// Idempotent: if a subscriber is already installed this returns `Ok(())`, so tests and
/// several daemons in one process may all call it.
pub fn init(options: LoggingOptions) -> ObsResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.level.as_str().to_lowercase()));

    let span_events = if options.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = match options.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(options.with_file_and_line)
            .with_line_number(options.with_file_and_line)
            .with_ansi(options.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(options.with_file_and_line)
            .with_line_number(options.with_file_and_line)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_file(options.with_file_and_line)
            .with_line_number(options.with_file_and_line)
            .with_filter(env_filter)
            .boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        // Another component already installed a subscriber
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(ObsError::Config(format!("Failed to initialize logging: {}", e))),
    }
}

/// Parse a log level name, case-insensitively
fn parse_log_level(level: &str) -> ObsResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(ObsError::Config(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))),
    }
}
