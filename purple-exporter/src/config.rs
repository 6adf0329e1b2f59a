//! Configuration for the PurpleAir exporter.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("at least one sensor address is required")]
    NoSensors,
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete exporter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Sensor polling settings.
    #[serde(default)]
    pub sensors: SensorsConfig,

    /// Prometheus exporter settings.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sensor polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorsConfig {
    /// Sensor addresses as `host:port`.
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Seconds between scrape cycles (default: 5).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Per-request timeout in milliseconds (default: 4000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_timeout_ms() -> u64 {
    4_000
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            poll_interval_secs: default_poll_interval(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl SensorsConfig {
    /// Interval between scrape cycles.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Timeout applied to each sensor request.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Prometheus HTTP endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Path for metrics endpoint (default: "/metrics").
    #[serde(default = "default_path")]
    pub path: String,

    /// Metric name prefix (default: none).
    #[serde(default)]
    pub prefix: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

/// Paths served by the exporter itself.
const RESERVED_PATHS: &[&str] = &["/", "/health", "/ready"];

fn default_path() -> String {
    "/metrics".to_string()
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            prefix: String::new(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl ExporterConfig {
    /// Load configuration from a JSON5 file.
    ///
    /// The sensor list may still be empty here since the command line can
    /// supply it; call [`ExporterConfig::validate`] once overrides are applied.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: ExporterConfig = json5::from_str(content)?;
        config.validate_settings()?;
        Ok(config)
    }

    /// Apply command-line overrides.
    ///
    /// Sensor addresses given on the command line replace the configured ones.
    pub fn apply_overrides(&mut self, sensor_addrs: Vec<String>, listen: Option<String>) {
        if !sensor_addrs.is_empty() {
            self.sensors.addresses = sensor_addrs;
        }
        if let Some(listen) = listen {
            self.prometheus.listen = listen;
        }
    }

    /// Validate the full configuration, including the sensor list.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sensors.addresses.is_empty() {
            return Err(ConfigError::NoSensors);
        }
        self.validate_settings()
    }

    /// Validate everything except the presence of sensor addresses.
    pub fn validate_settings(&self) -> Result<(), ConfigError> {
        if self.sensors.poll_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "poll_interval_secs must be > 0".to_string(),
            ));
        }

        if self.sensors.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "timeout_ms must be > 0".to_string(),
            ));
        }

        let mut seen = HashSet::with_capacity(self.sensors.addresses.len());
        for address in &self.sensors.addresses {
            validate_sensor_address(address)?;
            if !seen.insert(address.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Sensor address listed more than once: {}",
                    address
                )));
            }
        }

        if self
            .prometheus
            .listen
            .parse::<std::net::SocketAddr>()
            .is_err()
        {
            return Err(ConfigError::Validation(format!(
                "Invalid listen address: {}",
                self.prometheus.listen
            )));
        }

        if !self.prometheus.path.starts_with('/') {
            return Err(ConfigError::Validation(
                "Metrics path must start with /".to_string(),
            ));
        }
        if RESERVED_PATHS.contains(&self.prometheus.path.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Metrics path {} is reserved",
                self.prometheus.path
            )));
        }

        let prefix = &self.prometheus.prefix;
        if !prefix.is_empty()
            && (prefix.starts_with(|c: char| c.is_ascii_digit())
                || !prefix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':'))
        {
            return Err(ConfigError::Validation(format!(
                "Invalid metric prefix: {}",
                prefix
            )));
        }

        Ok(())
    }
}

/// Check that a sensor address is a bare `host[:port]`.
fn validate_sensor_address(address: &str) -> Result<(), ConfigError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Validation(
            "Sensor address must not be empty".to_string(),
        ));
    }
    if trimmed.contains("://") || trimmed.contains('/') {
        return Err(ConfigError::Validation(format!(
            "Sensor address must be host:port without scheme or path: {}",
            address
        )));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(ConfigError::Validation(format!(
            "Sensor address contains whitespace: {}",
            address
        )));
    }
    Ok(())
}
