//! Configuration System using Figment
//!
//! Strongly-typed configuration for the stream client. Values are layered:
//! 1. Built-in defaults (every field has one)
//! 2. `config/aquarium.toml` (or the file given with `--config`)
//! 3. Environment variables prefixed with `AQUARIUM_`, `__` separating sections
//!
//! # Example
//! ```no_run
//! use aquarium_stream::config::AppConfig;
//!
//! // AQUARIUM_RETRY__CEILING=5 overrides [retry] ceiling
//! let config = AppConfig::load()?;
//! println!("Retry ceiling: {}", config.retry.ceiling);
//! # Ok::<(), aquarium_stream::error::AquariumError>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::connection::ConnectionConfig;
use crate::error::{AppResult, AquariumError};
use crate::logging::LogFormat;
use crate::transport::{PayloadEncoding, TransportKind};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/aquarium.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "AQUARIUM_";

/// Allowed range for the retry ceiling.
pub const RETRY_CEILING_RANGE: std::ops::RangeInclusive<u32> = 1..=10;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Backend connection settings
    pub backend: BackendConfig,
    /// Live stream settings
    pub stream: StreamConfig,
    /// Reconnect policy
    pub retry: RetryConfig,
    /// Capture workflow settings
    pub capture: CaptureConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Backend connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend base URL; falls back to `AQUARIUM_BACKEND_URL`, then the default
    pub url: Option<String>,
    /// Timeout for REST requests and frame polls, in milliseconds
    pub request_timeout_ms: u64,
}

/// Live stream settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Frame transport (socket or polling)
    pub transport: TransportKind,
    /// Payload encoding of socket messages
    pub payload_encoding: PayloadEncoding,
    /// Poll interval for the polling transport, in milliseconds
    pub poll_interval_ms: u64,
    /// Report a transient error after this long without a frame (0 = never)
    pub frame_timeout_ms: u64,
    /// Report a transient error when a connect takes longer than this (0 = never)
    pub connect_timeout_ms: u64,
    /// How often the device list is refreshed, in seconds
    pub device_refresh_secs: u64,
}

/// Reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Consecutive failures after which the stream gives up
    pub ceiling: u32,
    /// Delay curve between attempts
    pub backoff: Backoff,
}

/// Capture workflow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Pause between stopping the streams and capturing, in milliseconds
    pub settle_ms: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level (trace, debug, info, warn, error); `RUST_LOG` wins when set
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Colored output
    pub ansi: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            request_timeout_ms: 10_000,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            payload_encoding: PayloadEncoding::default(),
            poll_interval_ms: 200,
            frame_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            device_refresh_secs: 30,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            ceiling: 3,
            backoff: Backoff::default(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { settle_ms: 500 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            ansi: true,
        }
    }
}

impl BackendConfig {
    /// REST request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl StreamConfig {
    /// Poll interval of the polling transport.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Frame inactivity timeout, if enabled.
    #[must_use]
    pub fn frame_timeout(&self) -> Option<Duration> {
        (self.frame_timeout_ms > 0).then(|| Duration::from_millis(self.frame_timeout_ms))
    }

    /// Connect timeout, if enabled.
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }

    /// Device list refresh period.
    #[must_use]
    pub fn device_refresh(&self) -> Duration {
        Duration::from_secs(self.device_refresh_secs)
    }
}

impl CaptureConfig {
    /// Settle delay before capturing.
    #[must_use]
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl AppConfig {
    /// Load configuration from `config/aquarium.toml` and environment variables
    ///
    /// Example: `AQUARIUM_STREAM__TRANSPORT=polling`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate().map_err(AquariumError::Configuration)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if !RETRY_CEILING_RANGE.contains(&self.retry.ceiling) {
            return Err(format!(
                "Invalid retry ceiling {}. Must be {}-{}",
                self.retry.ceiling,
                RETRY_CEILING_RANGE.start(),
                RETRY_CEILING_RANGE.end()
            ));
        }

        self.retry.backoff.validate()?;

        if self.stream.poll_interval_ms == 0 {
            return Err("stream.poll_interval_ms must be greater than 0".to_string());
        }

        if self.backend.request_timeout_ms == 0 {
            return Err("backend.request_timeout_ms must be greater than 0".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        Ok(())
    }

    /// Settings for each stream connection.
    #[must_use]
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            retry_ceiling: self.retry.ceiling,
            frame_timeout: self.stream.frame_timeout(),
            connect_timeout: self.stream.connect_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let config = AppConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.retry.ceiling, 3);
        assert_eq!(config.capture.settle(), Duration::from_millis(500));
        assert_eq!(config.stream.transport, TransportKind::Socket);
        assert_eq!(config.stream.device_refresh(), Duration::from_secs(30));
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let file = write_config(
            r#"
[backend]
url = "http://tank.local:8000"

[stream]
transport = "polling"
poll_interval_ms = 500
frame_timeout_ms = 0
connect_timeout_ms = 2500

[retry]
ceiling = 5

[retry.backoff]
kind = "fixed_step"
step_ms = 250
max_ms = 2000

[logging]
format = "json"
"#,
        );

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.backend.url.as_deref(), Some("http://tank.local:8000"));
        assert_eq!(config.stream.transport, TransportKind::Polling);
        assert_eq!(config.stream.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.stream.frame_timeout(), None);
        assert_eq!(config.stream.connect_timeout(), Some(Duration::from_millis(2_500)));
        assert_eq!(config.retry.ceiling, 5);
        assert_eq!(
            config.retry.backoff,
            Backoff::FixedStep {
                step_ms: 250,
                max_ms: 2_000
            }
        );
        assert_eq!(config.logging.format, LogFormat::Json);
        // Unset sections keep defaults
        assert_eq!(config.capture.settle_ms, 500);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("[retry]\nceiling = 5\n");
        std::env::set_var("AQUARIUM_RETRY__CEILING", "7");
        std::env::set_var("AQUARIUM_CAPTURE__SETTLE_MS", "50");
        let result = AppConfig::load_from(file.path());
        std::env::remove_var("AQUARIUM_RETRY__CEILING");
        std::env::remove_var("AQUARIUM_CAPTURE__SETTLE_MS");

        let config = result.unwrap();
        assert_eq!(config.retry.ceiling, 7);
        assert_eq!(config.capture.settle_ms, 50);
    }

    #[test]
    #[serial]
    fn test_rejects_out_of_range_ceiling() {
        let file = write_config("[retry]\nceiling = 0\n");
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, AquariumError::Configuration(_)));

        let file = write_config("[retry]\nceiling = 11\n");
        assert!(AppConfig::load_from(file.path()).is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.logging.level = "verbose".to_string();
        assert!(config.validate().unwrap_err().contains("verbose"));

        config.logging.level = "debug".to_string();
        config.stream.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_connection_settings() {
        let config = AppConfig::default();
        let connection = config.connection();
        assert_eq!(connection.retry_ceiling, 3);
        assert_eq!(connection.frame_timeout, Some(Duration::from_secs(10)));
        assert_eq!(connection.connect_timeout, Some(Duration::from_secs(10)));
    }
}
