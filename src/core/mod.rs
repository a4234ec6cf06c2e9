//! Core domain types
//!
//! This module contains the fundamental types used throughout the system:
//! - Tick: decoded market state for one instrument
//! - Instrument: static catalog entry
//! - OptionChainIndex: option chains keyed by underlying and expiry
//! - FilterCriteria: option selection queries

pub mod catalog;
pub mod filter;
pub mod instrument;
pub mod market_data;
pub mod option_chain;

pub use catalog::{CatalogError, CatalogSource, HttpCatalogSource, StaticCatalogSource};
pub use filter::{FilterCriteria, FilterError};
pub use instrument::{Instrument, OptionType, RawInstrument};
pub use market_data::{Depth, DepthItem, Ohlc, PacketKind, Tick};
pub use option_chain::{
    normalize_expiry, CatalogSnapshot, LegQuote, OptionChain, OptionChainIndex, OptionLeg,
    StrikeData,
};
