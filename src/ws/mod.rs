//! Upstream WebSocket feed for real-time market data

pub mod backoff;
pub mod connection;
pub mod feed;
pub mod ping;
pub mod subscription;

pub use backoff::{ReconnectPolicy, ReconnectState};
pub use connection::{feed_url, ConnectionState, TransportError, WebSocketConnection};
pub use feed::{FeedClient, FeedConfig, FeedError, FeedState};
pub use ping::LivenessMonitor;
pub use subscription::{batches, SubscriptionBook, DEFAULT_BATCH_SIZE};
