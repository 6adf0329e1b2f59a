//! Mapping from sensor status documents to Prometheus gauges.

use crate::registry::{MetricsRegistry, RegistryError};
use crate::sensor::SensorStatus;

/// PM2.5 AQI, labeled by host and channel.
pub const PM25_AQI: &str = "pm2_5_aqi";
/// Sensor identity marker, always 1.
pub const SENSOR_ID: &str = "sensor_id";
/// Firmware version marker, always 1.
pub const VERSION: &str = "version";
pub const TEMP_F: &str = "temp_f";
pub const HUMIDITY: &str = "humidity";
pub const DEWPOINT: &str = "dewpoint";
pub const PRESSURE: &str = "pressure";

/// 1 if the last fetch from an address succeeded, 0 otherwise.
pub const SENSOR_UP: &str = "sensor_up";
/// Unix time of the last successful fetch from an address.
pub const SENSOR_LAST_SUCCESS: &str = "sensor_last_success_timestamp_seconds";
/// Duration of the last fetch attempt for an address.
pub const SENSOR_SCRAPE_DURATION: &str = "sensor_scrape_duration_seconds";

/// Channel label values for the two particle counters.
pub const CHANNEL_A: &str = "a";
pub const CHANNEL_B: &str = "b";

/// Every gauge family the exporter publishes: (name, help, labels).
const FAMILIES: &[(&str, &str, &[&str])] = &[
    (PM25_AQI, "PM2.5 AQI", &["host", "channel"]),
    (SENSOR_ID, "The sensor device ID", &["host", "sensor_id"]),
    (VERSION, "Version", &["host", "version"]),
    (TEMP_F, "The current temperature (F)", &["host"]),
    (HUMIDITY, "The current humidity", &["host"]),
    (DEWPOINT, "The current dewpoint (F)", &["host"]),
    (PRESSURE, "The current pressure in millibars", &["host"]),
    (
        SENSOR_UP,
        "Whether the last fetch from the sensor succeeded",
        &["address"],
    ),
    (
        SENSOR_LAST_SUCCESS,
        "Unix time of the last successful fetch from the sensor",
        &["address"],
    ),
    (
        SENSOR_SCRAPE_DURATION,
        "Duration of the last fetch from the sensor in seconds",
        &["address"],
    ),
];

/// Sanitize a metric name to be Prometheus-compatible.
///
/// Prometheus metric names must match `[a-zA-Z_:][a-zA-Z0-9_:]*`.
/// Invalid characters become underscores, runs of underscores collapse, and
/// a leading digit gets an underscore prefix.
pub fn sanitize_metric_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len() + 1);
    let mut last_was_underscore = false;

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        result.push('_');
        last_was_underscore = true;
    }

    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == ':' {
            result.push(c);
            last_was_underscore = false;
        } else if !last_was_underscore {
            result.push('_');
            last_was_underscore = true;
        }
    }

    while result.ends_with('_') {
        result.pop();
    }

    if result.is_empty() {
        result.push_str("unnamed");
    }

    result
}

/// Build a full metric name: `{prefix}_{name}`, or just `name` without a prefix.
pub fn build_metric_name(prefix: &str, name: &str) -> String {
    let name = sanitize_metric_name(name);
    if prefix.is_empty() {
        name
    } else {
        format!("{}_{}", prefix, name)
    }
}

/// Register every gauge family with the registry.
pub fn register_metrics(registry: &MetricsRegistry, prefix: &str) -> Result<(), RegistryError> {
    for (name, help, labels) in FAMILIES {
        registry.register_gauge(&build_metric_name(prefix, name), help, labels)?;
    }
    Ok(())
}

/// The `host` label for a status document.
///
/// The sensor ID, or the address when the sensor did not report one.
pub fn host_label<'a>(address: &'a str, status: &'a SensorStatus) -> &'a str {
    if status.sensor_id.is_empty() {
        address
    } else {
        &status.sensor_id
    }
}

/// Write every field of one status document into the registry.
pub fn publish_status(
    registry: &MetricsRegistry,
    prefix: &str,
    address: &str,
    status: &SensorStatus,
) -> Result<(), RegistryError> {
    let host = host_label(address, status);
    let name = |n: &str| build_metric_name(prefix, n);

    registry.set_gauge(&name(SENSOR_ID), &[host, status.sensor_id.as_str()], 1.0)?;
    registry.set_gauge(&name(VERSION), &[host, status.version.as_str()], 1.0)?;
    registry.set_gauge(&name(TEMP_F), &[host], status.temperature_f)?;
    registry.set_gauge(&name(HUMIDITY), &[host], status.humidity)?;
    registry.set_gauge(&name(DEWPOINT), &[host], status.dewpoint_f)?;
    registry.set_gauge(&name(PRESSURE), &[host], status.pressure)?;
    registry.set_gauge(&name(PM25_AQI), &[host, CHANNEL_A], status.pm25_aqi_a)?;
    registry.set_gauge(&name(PM25_AQI), &[host, CHANNEL_B], status.pm25_aqi_b)?;

    Ok(())
}

/// Write the scrape-health gauges for one fetch attempt.
///
/// `last_success` is the Unix time of this fetch if it succeeded.
pub fn publish_scrape_result(
    registry: &MetricsRegistry,
    prefix: &str,
    address: &str,
    duration_secs: f64,
    last_success: Option<f64>,
) -> Result<(), RegistryError> {
    let name = |n: &str| build_metric_name(prefix, n);
    let up = if last_success.is_some() { 1.0 } else { 0.0 };

    registry.set_gauge(&name(SENSOR_UP), &[address], up)?;
    registry.set_gauge(&name(SENSOR_SCRAPE_DURATION), &[address], duration_secs)?;
    if let Some(timestamp) = last_success {
        registry.set_gauge(&name(SENSOR_LAST_SUCCESS), &[address], timestamp)?;
    }

    Ok(())
}
