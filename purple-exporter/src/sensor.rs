//! HTTP client for PurpleAir sensor status documents.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tracing::trace;

/// Error type for a single sensor fetch.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Sensor {address}: request timed out")]
    Timeout { address: String },
    #[error("Sensor {address}: request failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Sensor {address}: unexpected HTTP status {status}")]
    Status { address: String, status: u16 },
    #[error("Sensor {address}: failed to read body: {source}")]
    Body {
        address: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Sensor {address}: invalid JSON payload: {source}")]
    Decode {
        address: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl FetchError {
    fn request(address: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                address: address.to_string(),
            }
        } else {
            FetchError::Connect {
                address: address.to_string(),
                source: err,
            }
        }
    }

    fn body(address: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                address: address.to_string(),
            }
        } else {
            FetchError::Body {
                address: address.to_string(),
                source: err,
            }
        }
    }
}

/// Decoded `/json` status document of one sensor.
///
/// Missing fields decode to zero values, unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SensorStatus {
    #[serde(rename = "SensorId")]
    pub sensor_id: String,
    #[serde(rename = "place")]
    pub place: String,
    #[serde(rename = "version")]
    pub version: String,
    /// Temperature in degrees Fahrenheit.
    #[serde(rename = "current_temp_f")]
    pub temperature_f: f64,
    /// Relative humidity in percent.
    #[serde(rename = "current_humidity")]
    pub humidity: f64,
    /// Dewpoint in degrees Fahrenheit.
    #[serde(rename = "current_dewpoint_f")]
    pub dewpoint_f: f64,
    /// Barometric pressure in millibars.
    #[serde(rename = "pressure")]
    pub pressure: f64,
    #[serde(rename = "pm2.5_aqi")]
    pub pm25_aqi_a: f64,
    #[serde(rename = "pm2.5_aqi_b")]
    pub pm25_aqi_b: f64,
}

impl SensorStatus {
    /// Decode a status document from a raw response body.
    pub fn from_slice(address: &str, body: &[u8]) -> Result<Self, FetchError> {
        serde_json::from_slice(body).map_err(|source| FetchError::Decode {
            address: address.to_string(),
            source,
        })
    }
}

/// Something that can fetch a sensor's status by address.
pub trait SensorSource: Send + Sync + 'static {
    /// Fetch and decode the status of the sensor at `address`.
    fn fetch(
        &self,
        address: &str,
    ) -> impl Future<Output = Result<SensorStatus, FetchError>> + Send;
}

/// Build the status URL for a sensor address.
pub fn status_url(address: &str) -> String {
    format!("http://{}/json", address)
}

/// HTTP client for sensor status documents.
#[derive(Debug, Clone)]
pub struct SensorClient {
    client: reqwest::Client,
}

impl SensorClient {
    /// Create a client whose requests are bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(FetchError::Client)?;

        Ok(Self { client })
    }
}

impl SensorSource for SensorClient {
    async fn fetch(&self, address: &str) -> Result<SensorStatus, FetchError> {
        let url = status_url(address);
        trace!(address, url = %url, "Fetching sensor status");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::request(address, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                address: address.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::body(address, e))?;

        SensorStatus::from_slice(address, &body)
    }
}
