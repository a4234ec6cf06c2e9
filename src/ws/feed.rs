//! Upstream feed client
//!
//! Owns the single upstream connection and its reconnect state machine:
//!
//! `Disconnected -> Connecting -> Connected -> Reconnecting -> ... -> Terminated`
//!
//! Each session runs the read loop and the liveness watchdog concurrently
//! under a child cancellation token; `serve` waits for both before deciding
//! whether to reconnect. Observers are invoked synchronously from the read
//! loop and must not block.

use std::time::Duration;

use bytes::Bytes;
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;

use crate::core::market_data::Tick;
use crate::hot_path::codec::{is_heartbeat, packets, parse_packet, CodecError, Mode};
use crate::ws::backoff::{ReconnectPolicy, ReconnectState};
use crate::ws::connection::{feed_url, TransportError, WebSocketConnection};
use crate::ws::ping::LivenessMonitor;
use crate::ws::subscription::{SubscriptionBook, DEFAULT_BATCH_SIZE};

/// Feed client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Terminated,
}

/// Feed errors reported to `on_error`
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeedError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("No data received for {0:?}")]
    Stale(Duration),

    #[error("Feed terminated")]
    Terminated,
}

/// Feed client configuration
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub api_key: String,
    pub access_token: String,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub auto_reconnect: bool,
    /// Max silence before the session is considered dead
    pub data_timeout: Duration,
    /// Watchdog check period
    pub check_interval: Duration,
    /// Tokens per control message when replaying subscriptions
    pub batch_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "wss://ws.kite.trade".to_string(),
            api_key: String::new(),
            access_token: String::new(),
            connect_timeout: Duration::from_secs(7),
            reconnect: ReconnectPolicy::default(),
            auto_reconnect: true,
            data_timeout: Duration::from_secs(5),
            check_interval: Duration::from_secs(2),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

type TickHandler = Box<dyn Fn(&Tick) + Send + Sync>;
type BinaryHandler = Box<dyn Fn(&Bytes) + Send + Sync>;
type ErrorHandler = Box<dyn Fn(&FeedError) + Send + Sync>;
type ConnectHandler = Box<dyn Fn() + Send + Sync>;
type CloseHandler = Box<dyn Fn(u16, &str) + Send + Sync>;
type ReconnectHandler = Box<dyn Fn(u32, Duration) + Send + Sync>;
type NoReconnectHandler = Box<dyn Fn(u32) + Send + Sync>;
type MessageHandler = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Observers {
    tick: Option<TickHandler>,
    binary: Option<BinaryHandler>,
    error: Option<ErrorHandler>,
    connect: Option<ConnectHandler>,
    close: Option<CloseHandler>,
    reconnect: Option<ReconnectHandler>,
    no_reconnect: Option<NoReconnectHandler>,
    message: Option<MessageHandler>,
}

/// How a session ended
enum SessionEnd {
    Cancelled,
    Closed { code: u16, reason: String },
    Failed(TransportError),
    Stale,
}

/// Text frame sent by the upstream feed
#[derive(Debug, Deserialize)]
struct UpstreamText {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Upstream feed client
pub struct FeedClient {
    config: FeedConfig,
    observers: Observers,
    state: AtomicCell<FeedState>,
    book: Mutex<SubscriptionBook>,
    /// Outbound control queue of the live session
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    cancel: CancellationToken,
}

impl FeedClient {
    pub fn new(config: FeedConfig) -> Self {
        Self::with_cancellation(config, CancellationToken::new())
    }

    /// Client observing an externally owned cancellation token
    pub fn with_cancellation(config: FeedConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            observers: Observers::default(),
            state: AtomicCell::new(FeedState::Disconnected),
            book: Mutex::new(SubscriptionBook::new()),
            outbound: Mutex::new(None),
            cancel,
        }
    }

    pub fn on_tick(&mut self, f: impl Fn(&Tick) + Send + Sync + 'static) -> &mut Self {
        self.observers.tick = Some(Box::new(f));
        self
    }

    pub fn on_binary_tick(&mut self, f: impl Fn(&Bytes) + Send + Sync + 'static) -> &mut Self {
        self.observers.binary = Some(Box::new(f));
        self
    }

    pub fn on_error(&mut self, f: impl Fn(&FeedError) + Send + Sync + 'static) -> &mut Self {
        self.observers.error = Some(Box::new(f));
        self
    }

    pub fn on_connect(&mut self, f: impl Fn() + Send + Sync + 'static) -> &mut Self {
        self.observers.connect = Some(Box::new(f));
        self
    }

    pub fn on_close(&mut self, f: impl Fn(u16, &str) + Send + Sync + 'static) -> &mut Self {
        self.observers.close = Some(Box::new(f));
        self
    }

    pub fn on_reconnect(&mut self, f: impl Fn(u32, Duration) + Send + Sync + 'static) -> &mut Self {
        self.observers.reconnect = Some(Box::new(f));
        self
    }

    pub fn on_no_reconnect(&mut self, f: impl Fn(u32) + Send + Sync + 'static) -> &mut Self {
        self.observers.no_reconnect = Some(Box::new(f));
        self
    }

    pub fn on_message(&mut self, f: impl Fn(&str) + Send + Sync + 'static) -> &mut Self {
        self.observers.message = Some(Box::new(f));
        self
    }

    #[inline]
    pub fn state(&self) -> FeedState {
        self.state.load()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state() == FeedState::Connected
    }

    /// Request shutdown; `serve` exits to `Terminated` promptly
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Booked tokens, sorted
    pub fn subscribed_tokens(&self) -> Vec<u32> {
        self.book.lock().tokens()
    }

    /// Subscribe tokens (quote mode unless already set)
    pub fn subscribe(&self, tokens: &[u32]) -> Result<(), FeedError> {
        if tokens.is_empty() {
            return Ok(());
        }
        let msg = self.book.lock().subscribe(tokens);
        self.send_control(msg)
    }

    pub fn unsubscribe(&self, tokens: &[u32]) -> Result<(), FeedError> {
        if tokens.is_empty() {
            return Ok(());
        }
        let msg = self.book.lock().unsubscribe(tokens);
        self.send_control(msg)
    }

    pub fn set_mode(&self, mode: Mode, tokens: &[u32]) -> Result<(), FeedError> {
        if tokens.is_empty() {
            return Ok(());
        }
        let msg = self.book.lock().set_mode(mode, tokens);
        self.send_control(msg)
    }

    #[inline]
    pub fn set_full_mode(&self, tokens: &[u32]) -> Result<(), FeedError> {
        self.set_mode(Mode::Full, tokens)
    }

    /// Queue a control message on the live session. While disconnected the
    /// book alone carries the request; it is replayed on connect.
    fn send_control(&self, msg: String) -> Result<(), FeedError> {
        if self.cancel.is_cancelled() {
            return Err(FeedError::Terminated);
        }
        if let Some(tx) = self.outbound.lock().as_ref() {
            // A closed queue means the session is ending; the book replays it
            let _ = tx.send(Message::text(msg));
        }
        Ok(())
    }

    /// Run the connection state machine until cancelled or retries run out
    pub async fn serve(&self) {
        let mut backoff = ReconnectState::new(self.config.reconnect);

        let url = match feed_url(&self.config.url, &self.config.api_key, &self.config.access_token) {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(target: "feed", "Invalid feed URL: {}", e);
                self.emit_error(&FeedError::Transport(e));
                self.terminate(Some(backoff.attempt()));
                return;
            }
        };

        loop {
            if self.cancel.is_cancelled() {
                self.terminate(None);
                return;
            }

            self.state.store(FeedState::Connecting);
            tracing::info!(target: "feed", "Connecting to {}", self.config.url);

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.terminate(None);
                    return;
                }
                result = WebSocketConnection::connect(&url, self.config.connect_timeout) => result,
            };

            match connected {
                Ok(conn) => {
                    let reconnected = backoff.on_connected();
                    self.state.store(FeedState::Connected);
                    tracing::info!(target: "feed", reconnected, "Feed connected");
                    if let Some(f) = &self.observers.connect {
                        f();
                    }

                    match self.run_session(conn).await {
                        SessionEnd::Cancelled => {
                            self.terminate(None);
                            return;
                        }
                        SessionEnd::Closed { code, reason } => {
                            tracing::warn!(target: "feed", code, %reason, "Feed closed by upstream");
                            if let Some(f) = &self.observers.close {
                                f(code, &reason);
                            }
                        }
                        SessionEnd::Failed(e) => {
                            tracing::warn!(target: "feed", "Feed read failed: {}", e);
                            self.emit_error(&FeedError::Transport(e));
                        }
                        SessionEnd::Stale => {
                            tracing::warn!(
                                target: "feed",
                                "No data for {:?}, reconnecting",
                                self.config.data_timeout
                            );
                            self.emit_error(&FeedError::Stale(self.config.data_timeout));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(target: "feed", "Feed connect failed: {}", e);
                    self.emit_error(&FeedError::Transport(e));
                }
            }

            if self.cancel.is_cancelled() {
                self.terminate(None);
                return;
            }
            if !self.config.auto_reconnect {
                self.terminate(Some(backoff.attempt()));
                return;
            }

            self.state.store(FeedState::Reconnecting);
            let Some(delay) = backoff.next_delay() else {
                tracing::error!(
                    target: "feed",
                    "Giving up after {} reconnect attempts",
                    backoff.attempt() - 1
                );
                self.terminate(Some(backoff.attempt()));
                return;
            };

            tracing::info!(target: "feed", attempt = backoff.attempt(), ?delay, "Reconnecting");
            if let Some(f) = &self.observers.reconnect {
                f(backoff.attempt(), delay);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.terminate(None);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Enter `Terminated`; `Some(attempt)` reports exhausted retries.
    fn terminate(&self, no_reconnect: Option<u32>) {
        self.outbound.lock().take();
        self.state.store(FeedState::Terminated);
        match no_reconnect {
            Some(attempt) => {
                if let Some(f) = &self.observers.no_reconnect {
                    f(attempt);
                }
            }
            None => tracing::info!(target: "feed", "Feed stopped"),
        }
    }

    /// One connected session: read loop + watchdog, joined
    async fn run_session(&self, mut conn: WebSocketConnection) -> SessionEnd {
        let session = self.cancel.child_token();
        let liveness = LivenessMonitor::new(self.config.data_timeout);

        let (tx, mut rx) = mpsc::unbounded_channel();
        // Install before replaying so concurrent subscribes are not lost
        *self.outbound.lock() = Some(tx.clone());
        let replay = self.book.lock().resubscribe_messages(self.config.batch_size);
        for msg in replay {
            let _ = tx.send(Message::text(msg));
        }
        drop(tx);

        let reader = async {
            let end = loop {
                tokio::select! {
                    biased;
                    _ = session.cancelled() => break SessionEnd::Cancelled,
                    Some(out) = rx.recv() => {
                        if let Err(e) = conn.send(out).await {
                            break SessionEnd::Failed(e);
                        }
                    }
                    inbound = conn.recv() => match inbound {
                        Ok(Some(msg)) => {
                            liveness.touch();
                            if let Some(end) = self.dispatch(msg) {
                                break end;
                            }
                        }
                        Ok(None) => break SessionEnd::Failed(TransportError::ConnectionClosed),
                        Err(e) => break SessionEnd::Failed(e),
                    },
                }
            };
            // Stop the watchdog
            session.cancel();
            end
        };
        let watchdog = liveness.watch(self.config.check_interval, &session);

        let (end, stale) = tokio::join!(reader, watchdog);

        self.outbound.lock().take();
        conn.close().await;

        if self.cancel.is_cancelled() {
            SessionEnd::Cancelled
        } else if stale {
            SessionEnd::Stale
        } else {
            end
        }
    }

    /// Handle one inbound message. Returns the session end on close.
    #[inline]
    fn dispatch(&self, msg: Message) -> Option<SessionEnd> {
        match msg {
            Message::Binary(frame) => {
                self.handle_frame(&frame);
                None
            }
            Message::Text(text) => {
                self.handle_text(text.as_str());
                None
            }
            Message::Close(frame) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                    .unwrap_or((1005, String::new()));
                Some(SessionEnd::Closed { code, reason })
            }
            // Pings are answered by tungstenite; they only count as activity
            _ => None,
        }
    }

    /// Forward the raw frame, then decode each packet
    #[inline]
    fn handle_frame(&self, frame: &Bytes) {
        if let Some(f) = &self.observers.binary {
            f(frame);
        }
        if is_heartbeat(frame) {
            return;
        }
        for packet in packets(frame) {
            match parse_packet(packet) {
                Ok(tick) => {
                    if let Some(f) = &self.observers.tick {
                        f(&tick);
                    }
                }
                Err(e) => self.emit_error(&FeedError::Codec(e)),
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match serde_json::from_str::<UpstreamText>(text) {
            Ok(parsed) if parsed.kind == "error" => {
                let detail = match parsed.data {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                self.emit_error(&FeedError::Upstream(detail));
            }
            _ => {
                if let Some(f) = &self.observers.message {
                    f(text);
                }
            }
        }
    }

    #[inline]
    fn emit_error(&self, err: &FeedError) {
        if let Some(f) = &self.observers.error {
            f(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hot_path::codec::{encode_frame, encode_packet};
    use futures_util::{SinkExt, StreamExt};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    fn test_config(url: String) -> FeedConfig {
        FeedConfig {
            url,
            connect_timeout: Duration::from_secs(2),
            reconnect: ReconnectPolicy {
                max_retries: 2,
                max_delay: Duration::from_millis(5),
            },
            data_timeout: Duration::from_secs(30),
            check_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    async fn closed_port_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_dispatches_frames_and_ticks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let a = encode_packet(&Tick::ltp(408_065, 1520.5));
        let b = encode_packet(&Tick::ltp(884_737, 98.25));
        let frame = encode_frame([a.as_slice(), b.as_slice(), [0u8; 12].as_slice()]);
        let server_frame = frame.clone();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            ws.send(Message::binary(vec![0u8])).await.unwrap();
            ws.send(Message::binary(server_frame)).await.unwrap();
            ws.send(Message::text(r#"{"type":"order","data":{"id":1}}"#)).await.unwrap();
            ws.send(Message::text(r#"{"type":"error","data":"bad token"}"#)).await.unwrap();
            // Hold the connection open
            while ws.next().await.is_some() {}
        });

        let (tick_tx, mut tick_rx) = mpsc::unbounded_channel();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();

        let mut client = FeedClient::new(test_config(url));
        client
            .on_tick(move |t| {
                let _ = tick_tx.send(*t);
            })
            .on_binary_tick(move |f| {
                let _ = frame_tx.send(f.clone());
            })
            .on_error(move |e| {
                let _ = err_tx.send(e.clone());
            })
            .on_message(move |m| {
                let _ = msg_tx.send(m.to_string());
            });
        let client = Arc::new(client);
        let serving = tokio::spawn({
            let client = client.clone();
            async move { client.serve().await }
        });

        let wait = Duration::from_secs(5);
        assert_eq!(timeout(wait, frame_rx.recv()).await.unwrap().unwrap().len(), 1);
        assert_eq!(timeout(wait, frame_rx.recv()).await.unwrap().unwrap(), Bytes::from(frame));

        let first = timeout(wait, tick_rx.recv()).await.unwrap().unwrap();
        let second = timeout(wait, tick_rx.recv()).await.unwrap().unwrap();
        assert_eq!((first.token, first.last_price), (408_065, 1520.5));
        assert_eq!(second.token, 884_737);

        // Malformed sibling reported, then the upstream error text
        assert_eq!(
            timeout(wait, err_rx.recv()).await.unwrap().unwrap(),
            FeedError::Codec(CodecError::MalformedPacket { len: 12 })
        );
        assert_eq!(
            timeout(wait, err_rx.recv()).await.unwrap().unwrap(),
            FeedError::Upstream("bad token".to_string())
        );
        assert!(timeout(wait, msg_rx.recv()).await.unwrap().unwrap().contains("order"));

        assert_eq!(client.state(), FeedState::Connected);
        client.stop();
        timeout(wait, serving).await.unwrap().unwrap();
        assert_eq!(client.state(), FeedState::Terminated);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let url = closed_port_url().await;
        let reconnects = Arc::new(AtomicU32::new(0));
        let gave_up = Arc::new(AtomicU32::new(0));

        let mut client = FeedClient::new(test_config(url));
        {
            let reconnects = reconnects.clone();
            client.on_reconnect(move |_, delay| {
                assert_eq!(delay, Duration::from_millis(5));
                reconnects.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let gave_up = gave_up.clone();
            client.on_no_reconnect(move |attempt| {
                assert_eq!(attempt, 3);
                gave_up.fetch_add(1, Ordering::SeqCst);
            });
        }

        timeout(Duration::from_secs(10), client.serve()).await.unwrap();
        assert_eq!(client.state(), FeedState::Terminated);
        assert_eq!(reconnects.load(Ordering::SeqCst), 2);
        assert_eq!(gave_up.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_is_clean_exit() {
        let url = closed_port_url().await;
        let gave_up = Arc::new(AtomicU32::new(0));

        let mut config = test_config(url);
        config.reconnect.max_delay = Duration::from_secs(60);
        let mut client = FeedClient::new(config);
        {
            let gave_up = gave_up.clone();
            client.on_no_reconnect(move |_| {
                gave_up.fetch_add(1, Ordering::SeqCst);
            });
        }
        let client = Arc::new(client);
        let serving = tokio::spawn({
            let client = client.clone();
            async move { client.serve().await }
        });

        // Let it fail once and enter the backoff sleep
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(client.state(), FeedState::Reconnecting);
        client.stop();

        timeout(Duration::from_secs(5), serving).await.unwrap().unwrap();
        assert_eq!(client.state(), FeedState::Terminated);
        assert_eq!(gave_up.load(Ordering::SeqCst), 0);
        assert_eq!(client.subscribe(&[1]), Err(FeedError::Terminated));
    }

    #[tokio::test]
    async fn test_resubscribes_after_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<(usize, String)>();

        tokio::spawn(async move {
            for session in 0..2usize {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = accept_async(stream).await.unwrap();
                if session == 0 {
                    // Read the live subscribe, then drop the connection
                    if let Some(Ok(Message::Text(t))) = ws.next().await {
                        let _ = seen_tx.send((session, t.as_str().to_string()));
                    }
                    drop(ws);
                    continue;
                }
                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Text(t) = msg {
                        let _ = seen_tx.send((session, t.as_str().to_string()));
                    }
                }
            }
        });

        let connects = Arc::new(AtomicU32::new(0));
        let mut client = FeedClient::new(test_config(url));
        {
            let connects = connects.clone();
            client.on_connect(move || {
                connects.fetch_add(1, Ordering::SeqCst);
            });
        }
        let client = Arc::new(client);
        let serving = tokio::spawn({
            let client = client.clone();
            async move { client.serve().await }
        });

        let wait = Duration::from_secs(5);
        while client.state() != FeedState::Connected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        client.subscribe(&[408_065]).unwrap();
        client.set_full_mode(&[408_065]).unwrap();

        let (session, first) = timeout(wait, seen_rx.recv()).await.unwrap().unwrap();
        assert_eq!(session, 0);
        assert_eq!(first, r#"{"a":"subscribe","v":[408065]}"#);

        // Second session replays the book
        let mut replayed = Vec::new();
        while replayed.len() < 2 {
            let (session, text) = timeout(wait, seen_rx.recv()).await.unwrap().unwrap();
            if session == 1 {
                replayed.push(text);
            }
        }
        assert_eq!(replayed[0], r#"{"a":"subscribe","v":[408065]}"#);
        assert_eq!(replayed[1], r#"{"a":"mode","v":["full",[408065]]}"#);
        assert_eq!(connects.load(Ordering::SeqCst), 2);

        client.stop();
        timeout(wait, serving).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_stale_session_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            // Silent server
            while ws.next().await.is_some() {}
        });

        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        let mut config = test_config(url);
        config.data_timeout = Duration::from_millis(60);
        config.reconnect.max_retries = 0;
        let mut client = FeedClient::new(config);
        client.on_error(move |e| {
            let _ = err_tx.send(e.clone());
        });

        timeout(Duration::from_secs(5), client.serve()).await.unwrap();
        assert_eq!(
            err_rx.recv().await.unwrap(),
            FeedError::Stale(Duration::from_millis(60))
        );
        assert_eq!(client.state(), FeedState::Terminated);
    }
}
