//! Logging Infrastructure
//!
//! Structured logging for the stream client, built on `tracing` and
//! `tracing-subscriber`:
//! - Structured events with fields (`device`, `generation`, `attempt`, `delay_ms`)
//! - Multiple output formats (pretty, compact, JSON)
//! - `RUST_LOG` filtering, falling back to the configured level
//!
//! # Example
//! ```no_run
//! use aquarium_stream::{config::AppConfig, logging};
//! use tracing::{info, warn};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load()?;
//! logging::init_from_config(&config)?;
//!
//! info!("Dashboard client started");
//! warn!(device = 0, "Camera stream interrupted");
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::AppConfig;
use crate::error::{AppResult, AquariumError};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-line, colored (for development)
    Pretty,
    /// Single-line (for terminals and services)
    #[default]
    Compact,
    /// JSON lines (for log aggregation)
    Json,
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: LogFormat,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to enable ANSI colors (ignored for JSON)
    pub with_ansi: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl LogSettings {
    /// Settings from the `[logging]` configuration section
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let level = parse_log_level(&config.logging.level).map_err(AquariumError::Logging)?;
        Ok(Self {
            level,
            format: config.logging.format,
            with_ansi: config.logging.ansi,
            ..Default::default()
        })
    }

    /// Settings with a custom level
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable ANSI colors
    #[must_use]
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }

    /// Raise the level for `-v` style verbosity flags
    #[must_use]
    pub fn with_verbosity(mut self, verbose: u8) -> Self {
        self.level = match verbose {
            0 => self.level,
            1 => self.level.max(Level::DEBUG),
            _ => Level::TRACE,
        };
        self
    }
}

/// Initialize logging from the application configuration
pub fn init_from_config(config: &AppConfig) -> AppResult<()> {
    init(LogSettings::from_config(config)?)
}

/// Initialize logging
///
/// Idempotent: if a global subscriber is already installed this returns `Ok(())`,
/// which keeps it safe to call from tests.
pub fn init(settings: LogSettings) -> AppResult<()> {
    // Already initialized; expected in tests
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(build_layer(&settings))
        .try_init()
        .map_err(|e| AquariumError::Logging(format!("Failed to initialize tracing: {e}")))
}

fn build_layer(settings: &LogSettings) -> Box<dyn Layer<Registry> + Send + Sync> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(settings.level)));

    match settings.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(settings.with_file_and_line)
            .with_line_number(settings.with_file_and_line)
            .with_ansi(settings.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(false)
            .with_file(settings.with_file_and_line)
            .with_line_number(settings.with_file_and_line)
            .with_ansi(settings.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_file(settings.with_file_and_line)
            .with_line_number(settings.with_file_and_line)
            .with_filter(env_filter)
            .boxed(),
    }
}

/// Parse log level string into tracing Level
fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        )),
    }
}

/// Convert Level to env filter string
fn level_to_filter_string(level: Level) -> String {
    match level {
        Level::TRACE => "trace",
        Level::DEBUG => "debug",
        Level::INFO => "info",
        Level::WARN => "warn",
        Level::ERROR => "error",
    }
    .to_string()
}
