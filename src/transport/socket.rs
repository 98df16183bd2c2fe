//! Push transport: frames arrive as WebSocket messages.
//!
//! The backend accepts `ws(s)://{backend}/ws/camera/{device}` and then sends one
//! message per captured frame. When a camera cannot be streamed it closes the socket
//! with code 1008 (policy violation), which is the only close treated as terminal.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::polling::classify_status;
use super::{DeviceId, FrameSource, FrameTransport, PayloadEncoding};
use crate::address::BackendAddress;
use crate::error::{ErrorDescriptor, TransportError, CLOSE_CODE_POLICY_VIOLATION};

/// Subscribes to the backend's per-camera WebSocket.
#[derive(Debug, Clone)]
pub struct SocketTransport {
    address: BackendAddress,
    encoding: PayloadEncoding,
}

impl SocketTransport {
    /// Create a socket transport for `address`.
    pub fn new(address: BackendAddress, encoding: PayloadEncoding) -> Self {
        Self { address, encoding }
    }

    fn socket_url(&self, device: &DeviceId) -> Result<Url, TransportError> {
        self.address
            .socket_base()
            .join(&format!("ws/camera/{device}"))
            .map_err(|e| TransportError::terminal(format!("invalid socket URL: {e}")))
    }
}

#[async_trait]
impl FrameTransport for SocketTransport {
    async fn connect(&self, device: &DeviceId) -> Result<Box<dyn FrameSource>, TransportError> {
        let url = self.socket_url(device)?;
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(classify_ws_error)?;
        tracing::debug!(device = %device, url = %url, "Socket connected");
        Ok(Box::new(SocketSource {
            ws,
            encoding: self.encoding,
        }))
    }

    fn name(&self) -> &'static str {
        "socket"
    }
}

struct SocketSource {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    encoding: PayloadEncoding,
}

#[async_trait]
impl FrameSource for SocketSource {
    async fn next_frame(&mut self) -> Result<Bytes, TransportError> {
        loop {
            let payload = match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Close(frame))) => return Err(classify_close(frame.as_ref())),
                Some(Ok(_)) => continue, // Ping/pong handled by tungstenite
                Some(Err(e)) => return Err(classify_ws_error(e)),
                None => return Err(TransportError::transient("socket stream ended")),
            };

            match self.encoding.decode(&payload) {
                Ok(frame) if !frame.is_empty() => return Ok(frame),
                Ok(_) => tracing::trace!("Skipping empty frame payload"),
                Err(e) => tracing::warn!(error = %e, "Skipping undecodable frame payload"),
            }
        }
    }
}

/// Classify a close frame. Only policy violation (1008) is terminal.
pub fn classify_close(frame: Option<&CloseFrame<'_>>) -> TransportError {
    match frame {
        Some(frame) => {
            let code = u16::from(frame.code);
            let reason = if frame.reason.is_empty() {
                "socket closed".to_string()
            } else {
                frame.reason.to_string()
            };
            let descriptor = ErrorDescriptor::with_code(reason, code);
            if code == CLOSE_CODE_POLICY_VIOLATION {
                TransportError::Terminal(descriptor)
            } else {
                TransportError::Transient(descriptor)
            }
        }
        None => TransportError::transient("socket closed"),
    }
}

fn classify_ws_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            classify_status(
                status.as_u16(),
                status.canonical_reason().unwrap_or("handshake rejected"),
            )
        }
        WsError::Url(e) => TransportError::terminal(format!("invalid socket URL: {e}")),
        other => TransportError::transient(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressSource;
    use std::borrow::Cow;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    fn close(code: CloseCode, reason: &'static str) -> CloseFrame<'static> {
        CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        }
    }

    #[test]
    fn policy_close_is_terminal() {
        let err = classify_close(Some(&close(CloseCode::Policy, "camera not available")));
        assert!(!err.is_retriable());
        assert_eq!(err.descriptor().code, Some(1008));
        assert_eq!(err.descriptor().message, "camera not available");
    }

    #[test]
    fn other_closes_are_transient() {
        assert!(classify_close(Some(&close(CloseCode::Away, ""))).is_retriable());
        assert!(classify_close(Some(&close(CloseCode::Error, "boom"))).is_retriable());
        assert!(classify_close(None).is_retriable());
    }

    #[test]
    fn socket_url_uses_ws_scheme() {
        let address = BackendAddress::parse("https://tank.example.com", AddressSource::Default).unwrap();
        let transport = SocketTransport::new(address, PayloadEncoding::Base64);
        assert_eq!(
            transport.socket_url(&DeviceId::from(3)).unwrap().as_str(),
            "wss://tank.example.com/ws/camera/3"
        );
    }
}
