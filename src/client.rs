//! Backend REST client.
//!
//! Thin typed wrapper over the dashboard backend endpoints used around the live
//! streams: the device list, single-frame capture, status and health.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::address::BackendAddress;
use crate::error::ClientError;

/// Camera as reported by `GET /devices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device index, used in every per-camera URL.
    pub index: u32,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Whether the camera opened successfully on the backend.
    #[serde(default = "default_active", alias = "is_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Image record returned by `POST /capture/{index}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    /// Record identifier (ISO timestamp on the stock backend).
    pub id: String,
    /// Where the backend stored the image.
    pub filepath: String,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Size on disk in bytes.
    pub file_size: u64,
    /// Source device, when reported.
    #[serde(default)]
    pub device_id: Option<u32>,
    /// Capture time, when reported.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Accept RFC 3339 as well as the naive UTC timestamps the backend emits.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Some(naive.and_utc()))
        .map_err(serde::de::Error::custom)
}

/// Subset of `GET /status` relevant to the stream views.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AquariumStatus {
    /// Most recent capture.
    #[serde(default)]
    pub latest_image: Option<CaptureRecord>,
    /// Latest model descriptions keyed by model name.
    #[serde(default)]
    pub latest_descriptions: HashMap<String, String>,
    /// Active alerts.
    #[serde(default)]
    pub alerts: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<serde_json::Value>,
}

/// HTTP client for the aquarium backend.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    address: BackendAddress,
}

impl BackendClient {
    /// Create a client with a request timeout.
    pub fn new(address: BackendAddress, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("aquarium-stream/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, address })
    }

    /// Create a client around an existing `reqwest::Client`.
    pub fn with_http(address: BackendAddress, http: reqwest::Client) -> Self {
        Self { http, address }
    }

    /// The underlying HTTP client, for sharing its pool with the polling transport.
    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Backend address.
    #[must_use]
    pub fn address(&self) -> &BackendAddress {
        &self.address
    }

    /// `GET /devices`
    pub async fn list_devices(&self) -> Result<Vec<DeviceInfo>, ClientError> {
        self.get_json("devices").await
    }

    /// `POST /capture/{index}`
    pub async fn capture(&self, index: u32) -> Result<CaptureRecord, ClientError> {
        let url = self.address.join(&format!("capture/{index}"))?;
        debug!(device = index, url = %url, "Requesting capture");
        let response = self.http.post(url).send().await?;
        decode(response).await
    }

    /// `GET /status`
    pub async fn status(&self) -> Result<AquariumStatus, ClientError> {
        self.get_json("status").await
    }

    /// `GET /healthcheck`; true when the backend answers `{"status": "ok"}`.
    pub async fn healthcheck(&self) -> Result<bool, ClientError> {
        let health: HealthResponse = self.get_json("healthcheck").await?;
        Ok(health.status == "ok")
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.address.join(path)?;
        debug!(url = %url, "GET");
        let response = self.http.get(url).send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    let body = response.bytes().await?;

    if !status.is_success() {
        let detail = error_detail(&body)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown error").to_string());
        warn!(status = status.as_u16(), detail = %detail, "Backend returned error");
        return Err(ClientError::Status {
            status: status.as_u16(),
            detail,
        });
    }

    Ok(serde_json::from_slice(&body)?)
}

/// Extract FastAPI's `detail` field, which is either a string or a validation list.
fn error_detail(body: &[u8]) -> Option<String> {
    let parsed: ErrorBody = serde_json::from_slice(body).ok()?;
    match parsed.detail? {
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}
