//! Downstream client connection
//!
//! A `Connection` holds one client's token filter and the bounded queue that
//! the hub pushes filtered frames into. The socket loop owns the transport:
//! a writer task drains the queue with a per-write timeout, the reader
//! applies the client's subscribe/unsubscribe requests.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::hot_path::filter::filter_frame_with;
use crate::hub::coordinator::Hub;

/// Unique connection identifier
pub type ConnectionId = Uuid;

/// Client request action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientAction {
    Subscribe,
    Unsubscribe,
}

/// Client control message: `{"a":"subscribe","v":[408065]}`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientRequest {
    #[serde(rename = "a")]
    pub action: ClientAction,
    #[serde(rename = "v")]
    pub tokens: Vec<u32>,
}

impl ClientRequest {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Why a frame could not be queued for a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Queue full, the client is not keeping up
    Full,
    /// Writer gone
    Closed,
}

/// One downstream subscriber
pub struct Connection {
    id: ConnectionId,
    tokens: RwLock<HashSet<u32>>,
    outbound: mpsc::Sender<Vec<u8>>,
    closed: CancellationToken,
}

impl Connection {
    /// New connection and the receiving end of its outbound queue
    pub fn new(queue_capacity: usize) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            tokens: RwLock::new(HashSet::new()),
            outbound: tx,
            closed: CancellationToken::new(),
        });
        (conn, rx)
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Add tokens to the filter. Returns how many were new.
    pub fn subscribe(&self, tokens: &[u32]) -> usize {
        let mut set = self.tokens.write();
        tokens.iter().filter(|&&t| set.insert(t)).count()
    }

    pub fn unsubscribe(&self, tokens: &[u32]) {
        let mut set = self.tokens.write();
        for token in tokens {
            set.remove(token);
        }
    }

    #[inline]
    pub fn is_subscribed(&self, token: u32) -> bool {
        self.tokens.read().contains(&token)
    }

    /// Sorted subscribed tokens
    pub fn tokens(&self) -> Vec<u32> {
        let mut tokens: Vec<u32> = self.tokens.read().iter().copied().collect();
        tokens.sort_unstable();
        tokens
    }

    /// Apply a client request to the local filter. Returns the tokens the
    /// upstream feed must carry (subscribe only).
    pub fn apply(&self, request: &ClientRequest) -> Option<Vec<u32>> {
        match request.action {
            ClientAction::Subscribe => {
                self.subscribe(&request.tokens);
                Some(request.tokens.clone())
            }
            ClientAction::Unsubscribe => {
                self.unsubscribe(&request.tokens);
                None
            }
        }
    }

    /// This client's view of `frame`: a zero-count frame when nothing
    /// survives the filter. Heartbeats pass unchanged.
    #[inline]
    pub fn filter(&self, frame: &[u8]) -> Vec<u8> {
        let set = self.tokens.read();
        filter_frame_with(frame, |t| set.contains(&t)).0
    }

    /// Queue a frame without waiting
    #[inline]
    pub fn try_send(&self, frame: Vec<u8>) -> Result<(), QueueError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Signal the socket loop to close the transport
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("tokens", &self.tokens.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Drive one accepted downstream socket until either side closes
pub async fn serve_socket(socket: WebSocket, hub: Hub) {
    let settings = hub.config().clone();
    let (conn, mut rx) = Connection::new(settings.client_queue_capacity);
    let conn_id = conn.id();

    if hub.register(conn.clone()).await.is_err() {
        tracing::warn!(target: "hub", %conn_id, "Hub closed, rejecting client");
        return;
    }
    tracing::info!(target: "hub", %conn_id, "Client connected");

    let (mut sink, mut stream) = socket.split();

    let writer_conn = conn.clone();
    let write_timeout: Duration = settings.write_timeout;
    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = writer_conn.closed() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            match timeout(write_timeout, sink.send(Message::Binary(frame))).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!(target: "hub", conn_id = %writer_conn.id(), "Write failed: {}", e);
                    break;
                }
                Err(_) => {
                    tracing::warn!(
                        target: "hub",
                        conn_id = %writer_conn.id(),
                        "Write timed out after {:?}",
                        write_timeout
                    );
                    break;
                }
            }
        }
        writer_conn.close();
        let _ = sink.close().await;
    });

    loop {
        let next = tokio::select! {
            _ = conn.closed() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => handle_text(&conn, &hub, &text).await,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(target: "hub", %conn_id, "Read failed: {}", e);
                break;
            }
        }
    }

    conn.close();
    let _ = hub.unregister(conn_id).await;
    let _ = writer.await;
    tracing::info!(target: "hub", %conn_id, "Client disconnected");
}

async fn handle_text(conn: &Connection, hub: &Hub, text: &str) {
    let request = match ClientRequest::parse(text) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(target: "hub", conn_id = %conn.id(), "Ignoring client message: {}", e);
            return;
        }
    };

    if let Some(tokens) = conn.apply(&request) {
        if let Err(e) = hub.subscribe_tokens(tokens).await {
            tracing::warn!(target: "hub", conn_id = %conn.id(), "Upstream subscribe failed: {}", e);
        }
    }
}
