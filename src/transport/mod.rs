//! Camera frame transports.
//!
//! A transport knows how to reach one device's frame feed; the connection state
//! machine only ever sees the two traits below:
//!
//! - [`FrameTransport::connect`] opens a feed for a device and returns a [`FrameSource`].
//! - [`FrameSource::next_frame`] waits for the next encoded frame.
//!
//! Both report failures as [`TransportError`], already classified as transient or
//! terminal, so retry policy never has to inspect transport-specific errors.
//!
//! Implementations:
//! - [`polling::PollingTransport`]: pull, one HTTP GET per frame
//! - [`socket::SocketTransport`]: push, binary WebSocket messages
//! - [`mock::MockTransport`]: scripted, in-memory

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

use crate::address::BackendAddress;
use crate::config::StreamConfig;
use crate::error::TransportError;

pub mod mock;
pub mod polling;
pub mod socket;

/// Opaque camera identifier. The backend addresses cameras by device index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap an identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as used in backend URLs.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u32> for DeviceId {
    fn from(index: u32) -> Self {
        Self(index.to_string())
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One decoded camera frame as handed to the display surface.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Device the frame came from.
    pub device: DeviceId,
    /// 1-based position within the attempt that delivered it.
    pub sequence: u64,
    /// Encoded image bytes (JPEG from the stock backend).
    pub data: Bytes,
    /// When the frame was received.
    pub received_at: Instant,
}

impl Frame {
    /// Displayable `data:` URL for hosts that render images from URLs.
    #[must_use]
    pub fn data_url(&self) -> String {
        format!("data:image/jpeg;base64,{}", BASE64.encode(&self.data))
    }
}

/// Opens frame feeds for devices.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Open a feed for `device`.
    async fn connect(&self, device: &DeviceId) -> Result<Box<dyn FrameSource>, TransportError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// A live feed of encoded frames. Dropping it releases the underlying connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame.
    async fn next_frame(&mut self) -> Result<Bytes, TransportError>;
}

/// Which transport the client uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Pull: poll the current frame over HTTP.
    Polling,
    /// Push: binary frames over a WebSocket.
    #[default]
    Socket,
}

/// How frame payloads are encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    /// Base64 text of the JPEG bytes (stock backend socket).
    #[default]
    Base64,
    /// Raw image bytes.
    Raw,
}

impl PayloadEncoding {
    /// Decode a payload into image bytes.
    pub fn decode(self, payload: &[u8]) -> Result<Bytes, base64::DecodeError> {
        match self {
            Self::Base64 => BASE64.decode(payload.trim_ascii()).map(Bytes::from),
            Self::Raw => Ok(Bytes::copy_from_slice(payload)),
        }
    }
}

/// HTTP statuses meaning "this camera cannot be streamed" rather than a hiccup.
#[must_use]
pub fn is_terminal_status(status: u16) -> bool {
    matches!(status, 403 | 404 | 410)
}

/// Build the configured transport for a backend.
pub fn build_transport(
    config: &StreamConfig,
    address: &BackendAddress,
    http: reqwest::Client,
) -> Arc<dyn FrameTransport> {
    match config.transport {
        TransportKind::Polling => Arc::new(polling::PollingTransport::new(
            http,
            address.clone(),
            config.poll_interval(),
        )),
        TransportKind::Socket => Arc::new(socket::SocketTransport::new(
            address.clone(),
            config.payload_encoding,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_from_index() {
        let id = DeviceId::from(2);
        assert_eq!(id.as_str(), "2");
        assert_eq!(id.to_string(), "2");
    }

    #[test]
    fn base64_payload_decodes_with_trailing_newline() {
        let decoded = PayloadEncoding::Base64.decode(b"/9j/4A==\n").unwrap();
        assert_eq!(&decoded[..], &[0xff, 0xd8, 0xff, 0xe0]);
        assert!(PayloadEncoding::Base64.decode(b"not base64!").is_err());
        assert_eq!(&PayloadEncoding::Raw.decode(b"abc").unwrap()[..], b"abc");
    }

    #[test]
    fn terminal_statuses() {
        assert!(is_terminal_status(404));
        assert!(is_terminal_status(403));
        assert!(!is_terminal_status(500));
        assert!(!is_terminal_status(429));
    }

    #[tokio::test]
    async fn frame_data_url() {
        let frame = Frame {
            device: DeviceId::from(0),
            sequence: 1,
            data: Bytes::from_static(&[0xff, 0xd8, 0xff, 0xe0]),
            received_at: Instant::now(),
        };
        assert_eq!(frame.data_url(), "data:image/jpeg;base64,/9j/4A==");
    }
}
