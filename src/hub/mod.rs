//! Fan-out hub: one upstream stream, many filtered downstream clients

pub mod client;
pub mod coordinator;

pub use client::{serve_socket, ClientAction, ClientRequest, Connection, ConnectionId, QueueError};
pub use coordinator::{Hub, HubConfig, HubError, HubStats, UpstreamSubscriber};
