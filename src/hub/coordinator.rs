//! Fan-out hub coordinator
//!
//! One task owns the client registry and the upstream-subscribed token set.
//! Everything else talks to it through `Hub`:
//! - register / unregister / subscribe / stats go through a bounded control
//!   queue (callers await capacity and the coordinator's reply)
//! - frames go through a bounded drop-oldest ring, so `broadcast` never
//!   blocks the feed read loop
//!
//! Pending control commands are applied before pending frames, so a client
//! whose `register` has returned sees every frame broadcast after it.
//! Every client gets its filtered view of every frame, a zero-count frame
//! when nothing matches. The loop never awaits a client. Frames are `try_send`-ed into each
//! client's queue; a full or closed queue unregisters and closes that client.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::hot_path::codec::is_heartbeat;
use crate::hub::client::{Connection, ConnectionId, QueueError};
use crate::infrastructure::metrics::MetricsCollector;
use crate::ws::feed::FeedClient;

/// Hub errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("Hub coordinator stopped")]
    Closed,

    #[error("Upstream subscribe failed: {0}")]
    Upstream(String),
}

/// Upstream side of `subscribe_tokens`
pub trait UpstreamSubscriber: Send + Sync + 'static {
    /// Ask the feed to carry `tokens`. Must not block.
    fn subscribe_upstream(&self, tokens: &[u32]) -> Result<(), HubError>;
}

impl UpstreamSubscriber for FeedClient {
    fn subscribe_upstream(&self, tokens: &[u32]) -> Result<(), HubError> {
        self.subscribe(tokens)
            .and_then(|_| self.set_full_mode(tokens))
            .map_err(|e| HubError::Upstream(e.to_string()))
    }
}

/// Hub sizing and timeouts
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub broadcast_capacity: usize,
    pub control_capacity: usize,
    pub client_queue_capacity: usize,
    pub write_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1024,
            control_capacity: 256,
            client_queue_capacity: 256,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Diagnostic view of the coordinator state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub upstream_tokens: Vec<u32>,
}

enum Command {
    Register {
        conn: Arc<Connection>,
        reply: oneshot::Sender<()>,
    },
    Unregister {
        id: ConnectionId,
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        tokens: Vec<u32>,
        reply: oneshot::Sender<Result<Vec<u32>, HubError>>,
    },
    Stats(oneshot::Sender<HubStats>),
}

/// Handle to the hub coordinator. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    control: mpsc::Sender<Command>,
    ring: Arc<ArrayQueue<Bytes>>,
    wake: Arc<Notify>,
    metrics: Arc<MetricsCollector>,
    config: Arc<HubConfig>,
}

impl Hub {
    /// Start the coordinator task. Must be called inside a tokio runtime.
    pub fn spawn(
        config: HubConfig,
        upstream: Arc<dyn UpstreamSubscriber>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (control, control_rx) = mpsc::channel(config.control_capacity.max(1));
        let ring = Arc::new(ArrayQueue::new(config.broadcast_capacity.max(1)));
        let wake = Arc::new(Notify::new());

        let coordinator = Coordinator {
            clients: HashMap::new(),
            upstream_tokens: HashSet::new(),
            upstream,
            control: control_rx,
            ring: ring.clone(),
            wake: wake.clone(),
            metrics: metrics.clone(),
        };
        tokio::spawn(coordinator.run());

        Self {
            control,
            ring,
            wake,
            metrics,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Queue a frame for fan-out. Never blocks; when the ring is full the
    /// oldest pending frame is displaced. Returns the number displaced.
    #[inline]
    pub fn broadcast(&self, frame: Bytes) -> usize {
        let dropped = match self.ring.force_push(frame) {
            Some(_) => {
                self.metrics.record_dropped_frames(1);
                1
            }
            None => 0,
        };
        self.wake.notify_one();
        dropped
    }

    /// Add a client. Returns once the coordinator has it in the registry.
    pub async fn register(&self, conn: Arc<Connection>) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register { conn, reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Remove a client. Unknown ids are ignored.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unregister { id, reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Ensure the upstream feed carries `tokens`. Only tokens not already
    /// subscribed upstream are forwarded; they are returned sorted.
    pub async fn subscribe_tokens(&self, tokens: Vec<u32>) -> Result<Vec<u32>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe { tokens, reply }).await?;
        rx.await.map_err(|_| HubError::Closed)?
    }

    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats(reply)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn connection_count(&self) -> Result<usize, HubError> {
        Ok(self.stats().await?.connections)
    }

    /// Sorted tokens subscribed upstream through the hub
    pub async fn upstream_tokens(&self) -> Result<Vec<u32>, HubError> {
        Ok(self.stats().await?.upstream_tokens)
    }

    async fn send(&self, cmd: Command) -> Result<(), HubError> {
        self.control.send(cmd).await.map_err(|_| HubError::Closed)
    }
}

struct Coordinator {
    clients: HashMap<ConnectionId, Arc<Connection>>,
    upstream_tokens: HashSet<u32>,
    upstream: Arc<dyn UpstreamSubscriber>,
    control: mpsc::Receiver<Command>,
    ring: Arc<ArrayQueue<Bytes>>,
    wake: Arc<Notify>,
    metrics: Arc<MetricsCollector>,
}

impl Coordinator {
    async fn run(mut self) {
        tracing::debug!(target: "hub", "Hub coordinator started");
        'run: loop {
            loop {
                match self.control.try_recv() {
                    Ok(cmd) => self.handle(cmd),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'run,
                }
            }

            while let Some(frame) = self.ring.pop() {
                self.fan_out(&frame);
            }

            tokio::select! {
                biased;
                cmd = self.control.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break 'run,
                },
                _ = self.wake.notified() => {}
            }
        }

        for conn in self.clients.values() {
            conn.close();
        }
        tracing::debug!(target: "hub", "Hub coordinator stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Register { conn, reply } => {
                if self.clients.insert(conn.id(), conn).is_none() {
                    self.metrics.client_connected();
                }
                let _ = reply.send(());
            }
            Command::Unregister { id, reply } => {
                self.remove(id);
                let _ = reply.send(());
            }
            Command::Subscribe { tokens, reply } => {
                let _ = reply.send(self.subscribe(tokens));
            }
            Command::Stats(reply) => {
                let mut upstream_tokens: Vec<u32> = self.upstream_tokens.iter().copied().collect();
                upstream_tokens.sort_unstable();
                let _ = reply.send(HubStats {
                    connections: self.clients.len(),
                    upstream_tokens,
                });
            }
        }
    }

    /// Deliver one frame to every client's queue
    fn fan_out(&mut self, frame: &Bytes) {
        let heartbeat = is_heartbeat(frame);
        let mut failed = Vec::new();

        for (id, conn) in &self.clients {
            let view = if heartbeat {
                frame.to_vec()
            } else {
                conn.filter(frame)
            };
            if let Err(e) = conn.try_send(view) {
                failed.push((*id, e));
            }
        }

        for (id, reason) in failed {
            if reason == QueueError::Full {
                self.metrics.record_slow_client();
                tracing::warn!(target: "hub", conn_id = %id, "Client queue full, disconnecting");
            }
            self.remove(id);
        }
    }

    fn subscribe(&mut self, tokens: Vec<u32>) -> Result<Vec<u32>, HubError> {
        let mut fresh: Vec<u32> = tokens
            .into_iter()
            .filter(|t| !self.upstream_tokens.contains(t))
            .collect();
        fresh.sort_unstable();
        fresh.dedup();
        if fresh.is_empty() {
            return Ok(fresh);
        }

        self.upstream.subscribe_upstream(&fresh)?;
        self.upstream_tokens.extend(fresh.iter().copied());
        tracing::info!(target: "hub", count = fresh.len(), "Subscribed new tokens upstream");
        Ok(fresh)
    }

    fn remove(&mut self, id: ConnectionId) {
        if let Some(conn) = self.clients.remove(&id) {
            conn.close();
            self.metrics.client_disconnected();
        }
    }
}
