//! Hot path operations - zero allocation where possible, zero panic
//!
//! This module contains latency-critical code:
//! - Binary frame codec
//! - Per-client frame filtering
//! - Latest-tick cache
//! - Black-Scholes / IV and per-tick analytics

pub mod analytics;
pub mod calculator;
pub mod codec;
pub mod filter;
pub mod price_cache;

pub use analytics::{GreeksSnapshot, OptionAnalytics, SkipReason};
pub use calculator::{Greeks, GreeksCalculator, IvEstimate};
pub use codec::{
    encode_frame, encode_mode, encode_packet, encode_subscribe, encode_unsubscribe, is_heartbeat,
    packet_token, parse_packet, split_frame, CodecError, Mode,
};
pub use filter::{filter_frame, filter_frame_with};
pub use price_cache::PriceCache;
