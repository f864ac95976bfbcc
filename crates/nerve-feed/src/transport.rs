//! Push-channel transport boundary.
//!
//! [`Connector`]/[`Connection`] abstract the physical socket so the
//! connection state machine can be driven by a scripted transport in tests.
//! [`WsConnector`] is the real WebSocket implementation.

use std::future::Future;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use nerve_core::TransportError;

/// Opens physical connections. One call = one connection attempt.
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    fn connect(&self) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;
}

/// One open, bidirectional text-message connection.
pub trait Connection: Send + 'static {
    /// Next inbound text message. `None` once the peer has closed the
    /// connection. Must be cancel-safe.
    fn recv(&mut self) -> impl Future<Output = Option<Result<String, TransportError>>> + Send;

    fn send_text(&mut self, text: String)
    -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Best-effort graceful close.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

// ─── WebSocket ──────────────────────────────────────────────────────

/// Connects to `<base_url><path>` over WebSocket (`ws://` or `wss://`).
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(base_url: &str, path: &str) -> Self {
        Self {
            url: join_ws_url(base_url, path),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WsConnector {
    type Conn = WsConnection;

    async fn connect(&self) -> Result<WsConnection, TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(url = %self.url, "feed: websocket handshake complete");
        Ok(WsConnection { stream })
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connection for WsConnection {
    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    tracing::debug!(?frame, "feed: peer sent close frame");
                    return None;
                }
                // Pings are answered by tungstenite; binary frames are not part of the feed.
                Ok(_) => continue,
                Err(e) => return Some(Err(map_ws_error(e))),
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(map_ws_error)
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "feed: close handshake failed");
        }
    }
}

fn map_ws_error(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match e {
        WsError::Io(io) => TransportError::Io(io.to_string()),
        other => TransportError::Protocol(other.to_string()),
    }
}

/// Turn an http(s) or ws(s) base URL plus a path into a websocket URL.
pub fn join_ws_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    if path.is_empty() {
        return base;
    }
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_base_becomes_ws() {
        assert_eq!(
            join_ws_url("http://localhost:8000", "/ws/feed"),
            "ws://localhost:8000/ws/feed"
        );
    }

    #[test]
    fn https_base_becomes_wss() {
        assert_eq!(
            join_ws_url("https://nerve.example.com/", "/ws/feed"),
            "wss://nerve.example.com/ws/feed"
        );
    }

    #[test]
    fn ws_base_is_kept_and_slash_inserted() {
        assert_eq!(
            join_ws_url("ws://127.0.0.1:9000", "ws/feed"),
            "ws://127.0.0.1:9000/ws/feed"
        );
    }

    #[test]
    fn empty_path_returns_base() {
        assert_eq!(join_ws_url("ws://host/", ""), "ws://host");
    }

    #[test]
    fn connector_reports_url() {
        let c = WsConnector::new("http://localhost:8000", "/ws/feed");
        assert_eq!(c.url(), "ws://localhost:8000/ws/feed");
    }
}
