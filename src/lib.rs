//! Low-latency market data relay
//!
//! Ingests one upstream binary tick feed, keeps the latest state per
//! instrument, computes option Greeks per tick, and fans the raw feed out to
//! many downstream websocket clients with per-client token filtering.

pub mod core;
pub mod hot_path;
pub mod hub;
pub mod infrastructure;
pub mod ws;
pub mod engine;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used types
pub use infrastructure::config::{ApiConfig, Config, FeedSettings, HubSettings};

use thiserror::Error;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Feed error: {0}")]
    Feed(#[from] ws::FeedError),

    #[error("Hub error: {0}")]
    Hub(#[from] hub::HubError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] core::CatalogError),

    #[error("Invalid filter: {0}")]
    Filter(#[from] core::FilterError),

    #[error("Parse error: {0}")]
    Parse(#[from] hot_path::CodecError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, RelayError>;
