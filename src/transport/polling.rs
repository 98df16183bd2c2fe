//! Pull transport: fetch the current frame over HTTP on a fixed interval.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};
use url::Url;

use super::{is_terminal_status, DeviceId, FrameSource, FrameTransport};
use crate::address::BackendAddress;
use crate::error::{ErrorDescriptor, TransportError};

/// Shortest accepted poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls `GET {backend}/camera/{device}/frame`.
#[derive(Debug, Clone)]
pub struct PollingTransport {
    http: reqwest::Client,
    address: BackendAddress,
    poll_interval: Duration,
}

impl PollingTransport {
    /// Create a polling transport sharing `http`'s connection pool.
    ///
    /// Intervals below [`MIN_POLL_INTERVAL`] are raised to it.
    pub fn new(http: reqwest::Client, address: BackendAddress, poll_interval: Duration) -> Self {
        Self {
            http,
            address,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        }
    }

    fn frame_url(&self, device: &DeviceId) -> Result<Url, TransportError> {
        self.address
            .join(&format!("camera/{device}/frame"))
            .map_err(|e| TransportError::terminal(format!("invalid frame URL: {e}")))
    }
}

#[async_trait]
impl FrameTransport for PollingTransport {
    async fn connect(&self, device: &DeviceId) -> Result<Box<dyn FrameSource>, TransportError> {
        let url = self.frame_url(device)?;
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(device = %device, url = %url, "Polling source ready");
        Ok(Box::new(PollingSource {
            http: self.http.clone(),
            url,
            ticker,
        }))
    }

    fn name(&self) -> &'static str {
        "polling"
    }
}

struct PollingSource {
    http: reqwest::Client,
    url: Url,
    ticker: Interval,
}

#[async_trait]
impl FrameSource for PollingSource {
    async fn next_frame(&mut self) -> Result<Bytes, TransportError> {
        // First tick completes immediately
        self.ticker.tick().await;

        let response = self
            .http
            .get(self.url.clone())
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(
                status.as_u16(),
                status.canonical_reason().unwrap_or("request failed"),
            ));
        }

        let body = response.bytes().await.map_err(classify_request_error)?;
        if body.is_empty() {
            return Err(TransportError::transient("empty frame"));
        }
        Ok(body)
    }
}

/// Classify a non-success HTTP status.
pub fn classify_status(status: u16, reason: &str) -> TransportError {
    let descriptor = ErrorDescriptor::with_code(reason, status);
    if is_terminal_status(status) {
        TransportError::Terminal(descriptor)
    } else {
        TransportError::Transient(descriptor)
    }
}

fn classify_request_error(err: reqwest::Error) -> TransportError {
    if let Some(status) = err.status() {
        return classify_status(status.as_u16(), &err.to_string());
    }
    if err.is_timeout() {
        return TransportError::transient("request timed out");
    }
    if err.is_connect() {
        return TransportError::transient(format!("connection failed: {err}"));
    }
    TransportError::transient(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressSource;

    #[test]
    fn status_classification() {
        assert!(!classify_status(404, "Not Found").is_retriable());
        assert!(!classify_status(410, "Gone").is_retriable());
        assert!(classify_status(503, "Service Unavailable").is_retriable());
        assert!(classify_status(429, "Too Many Requests").is_retriable());
        assert_eq!(classify_status(503, "x").descriptor().code, Some(503));
    }

    #[test]
    fn frame_url_under_backend_prefix() {
        let address = BackendAddress::parse("http://tank.local:8000/api", AddressSource::Default).unwrap();
        let transport =
            PollingTransport::new(reqwest::Client::new(), address, Duration::from_millis(100));
        assert_eq!(
            transport.frame_url(&DeviceId::from(1)).unwrap().as_str(),
            "http://tank.local:8000/api/camera/1/frame"
        );
    }

    #[tokio::test]
    async fn zero_interval_is_clamped() {
        let address = BackendAddress::parse("http://127.0.0.1:9", AddressSource::Default).unwrap();
        let transport = PollingTransport::new(reqwest::Client::new(), address, Duration::ZERO);
        assert_eq!(transport.poll_interval, MIN_POLL_INTERVAL);

        let mut source = transport.connect(&DeviceId::from(0)).await.unwrap();
        assert!(source.next_frame().await.unwrap_err().is_retriable());
    }

    #[tokio::test]
    async fn unreachable_backend_is_transient() {
        // Port 9 (discard) on loopback is closed in test environments
        let address = BackendAddress::parse("http://127.0.0.1:9", AddressSource::Default).unwrap();
        let transport =
            PollingTransport::new(reqwest::Client::new(), address, Duration::from_millis(10));
        let mut source = transport.connect(&DeviceId::from(0)).await.unwrap();
        let err = source.next_frame().await.unwrap_err();
        assert!(err.is_retriable(), "expected transient, got {err:?}");
    }
}
