//! Upstream WebSocket transport
//!
//! Thin wrapper over tokio-tungstenite for the feed connection:
//! - Handshake bounded by a connect timeout
//! - TCP_NODELAY on plain sockets
//! - Credentials carried as query parameters, never logged

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use url::Url;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Transport-level failures. All of them drive reconnection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
    #[error("Timeout")]
    Timeout,
    #[error("Not connected")]
    NotConnected,
    #[error("Connection closed")]
    ConnectionClosed,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TransportError>;

/// Build the feed URL with its credential query parameters
pub fn feed_url(base: &str, api_key: &str, access_token: &str) -> Result<Url> {
    let mut url = Url::parse(base).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
    if !api_key.is_empty() || !access_token.is_empty() {
        url.query_pairs_mut()
            .append_pair("api_key", api_key)
            .append_pair("access_token", access_token);
    }
    Ok(url)
}

/// Upstream WebSocket connection
pub struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    state: ConnectionState,
}

impl WebSocketConnection {
    /// Connect with a bounded handshake
    pub async fn connect(url: &Url, connect_timeout: Duration) -> Result<Self> {
        let (stream, _) = timeout(connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        if let MaybeTlsStream::Plain(tcp) = stream.get_ref() {
            tcp.set_nodelay(true)
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        }

        Ok(Self {
            stream,
            state: ConnectionState::Connected,
        })
    }

    /// Send a message
    pub async fn send(&mut self, msg: Message) -> Result<()> {
        if self.state != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.stream
            .send(msg)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// Send text message
    #[inline]
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.send(Message::text(text)).await
    }

    /// Receive a message. `None` on graceful end of stream.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        if self.state != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }

        match self.stream.next().await {
            Some(Ok(msg)) => {
                if let Message::Close(_) = msg {
                    self.state = ConnectionState::Disconnected;
                }
                Ok(Some(msg))
            }
            Some(Err(e)) => {
                self.state = ConnectionState::Disconnected;
                Err(TransportError::ReceiveFailed(e.to_string()))
            }
            None => {
                self.state = ConnectionState::Disconnected;
                Ok(None)
            }
        }
    }

    #[inline(always)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[inline(always)]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Close the connection gracefully
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Connected {
            let _ = self.stream.close(None).await;
            self.state = ConnectionState::Disconnected;
        }
    }
}


// Hot Path Checklist verified:
// ✓ Binary payloads surfaced as received (no copy)
// ✓ No logging in send/recv
// ✓ TCP_NODELAY enabled
