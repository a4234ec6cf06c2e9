//! Market data types
//!
//! `Tick` is the single decoded shape produced by the packet codec. It is a
//! plain `Copy` value so it can be stored in atomic slots and handed to
//! observers without allocation.

/// Payload layout class of a feed packet, keyed by payload length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Token and last price only (8 bytes)
    Ltp,
    /// Index last price with OHLC and net change (28 bytes)
    IndexQuote,
    /// Index quote with exchange timestamp (32 bytes)
    IndexFull,
    /// Quote without depth (44 bytes)
    Quote,
    /// Quote with OI, timestamps and five-level depth (184 bytes)
    Full,
}

impl PacketKind {
    pub const LTP_LEN: usize = 8;
    pub const INDEX_QUOTE_LEN: usize = 28;
    pub const INDEX_FULL_LEN: usize = 32;
    pub const QUOTE_LEN: usize = 44;
    pub const FULL_LEN: usize = 184;

    /// Classify a payload by its length. Unknown lengths have no layout.
    #[inline]
    pub const fn from_len(len: usize) -> Option<Self> {
        match len {
            Self::LTP_LEN => Some(Self::Ltp),
            Self::INDEX_QUOTE_LEN => Some(Self::IndexQuote),
            Self::INDEX_FULL_LEN => Some(Self::IndexFull),
            Self::QUOTE_LEN => Some(Self::Quote),
            Self::FULL_LEN => Some(Self::Full),
            _ => None,
        }
    }

    /// Payload length of this layout
    #[inline]
    pub const fn len(&self) -> usize {
        match self {
            Self::Ltp => Self::LTP_LEN,
            Self::IndexQuote => Self::INDEX_QUOTE_LEN,
            Self::IndexFull => Self::INDEX_FULL_LEN,
            Self::Quote => Self::QUOTE_LEN,
            Self::Full => Self::FULL_LEN,
        }
    }

    #[inline]
    pub const fn is_index(&self) -> bool {
        matches!(self, Self::IndexQuote | Self::IndexFull)
    }
}

/// Open/high/low/close for the session
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Ohlc {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// One price level of market depth
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DepthItem {
    pub price: f64,
    pub quantity: u32,
    pub orders: u16,
}

/// Number of levels per side carried by full-mode packets
pub const DEPTH_LEVELS: usize = 5;

/// Five levels of bids and asks
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Depth {
    pub buy: [DepthItem; DEPTH_LEVELS],
    pub sell: [DepthItem; DEPTH_LEVELS],
}

/// Snapshot of market state for one instrument
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    /// Instrument token
    pub token: u32,
    /// Layout the tick was decoded from
    pub kind: PacketKind,
    /// False for index instruments
    pub tradable: bool,
    pub last_price: f64,
    pub last_quantity: u32,
    pub average_price: f64,
    pub volume: u32,
    pub total_buy_quantity: u32,
    pub total_sell_quantity: u32,
    pub ohlc: Ohlc,
    pub net_change: f64,
    /// Last trade time (unix seconds)
    pub last_trade_time: Option<i64>,
    pub oi: u32,
    pub oi_day_high: u32,
    pub oi_day_low: u32,
    /// Exchange timestamp (unix seconds)
    pub timestamp: Option<i64>,
    pub depth: Depth,
}

impl Tick {
    /// Create an LTP-only tick
    pub fn ltp(token: u32, last_price: f64) -> Self {
        Self {
            token,
            kind: PacketKind::Ltp,
            tradable: true,
            last_price,
            last_quantity: 0,
            average_price: 0.0,
            volume: 0,
            total_buy_quantity: 0,
            total_sell_quantity: 0,
            ohlc: Ohlc::default(),
            net_change: 0.0,
            last_trade_time: None,
            oi: 0,
            oi_day_high: 0,
            oi_day_low: 0,
            timestamp: None,
            depth: Depth::default(),
        }
    }

    /// Best bid price, zero when there is no depth
    #[inline]
    pub fn best_bid(&self) -> f64 {
        self.depth.buy[0].price
    }

    /// Best ask price, zero when there is no depth
    #[inline]
    pub fn best_ask(&self) -> f64 {
        self.depth.sell[0].price
    }

    /// Bid/ask midpoint when both sides are quoted
    #[inline]
    pub fn mid_price(&self) -> Option<f64> {
        let (bid, ask) = (self.best_bid(), self.best_ask());
        if bid > 0.0 && ask > 0.0 {
            Some((bid + ask) / 2.0)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_kind_from_len() {
        assert_eq!(PacketKind::from_len(8), Some(PacketKind::Ltp));
        assert_eq!(PacketKind::from_len(28), Some(PacketKind::IndexQuote));
        assert_eq!(PacketKind::from_len(32), Some(PacketKind::IndexFull));
        assert_eq!(PacketKind::from_len(44), Some(PacketKind::Quote));
        assert_eq!(PacketKind::from_len(184), Some(PacketKind::Full));
        assert_eq!(PacketKind::from_len(16), None);
        assert_eq!(PacketKind::from_len(0), None);
    }

    #[test]
    fn test_packet_kind_len_matches() {
        for kind in [
            PacketKind::Ltp,
            PacketKind::IndexQuote,
            PacketKind::IndexFull,
            PacketKind::Quote,
            PacketKind::Full,
        ] {
            assert_eq!(PacketKind::from_len(kind.len()), Some(kind));
        }
    }

    #[test]
    fn test_mid_price_requires_both_sides() {
        let mut tick = Tick::ltp(1, 100.0);
        assert_eq!(tick.mid_price(), None);

        tick.depth.buy[0].price = 99.0;
        assert_eq!(tick.mid_price(), None);

        tick.depth.sell[0].price = 101.0;
        assert_eq!(tick.mid_price(), Some(100.0));
    }
}

// Hot Path Checklist verified:
// ✓ Copy types only (fits AtomicCell slots)
// ✓ No heap allocations
// ✓ Fixed-size depth arrays
