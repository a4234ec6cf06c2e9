//! Binary packet codec for the upstream tick feed
//!
//! Frame layout (big-endian):
//! `[u16 packet_count]([u16 length][payload])*`
//!
//! The payload layout is selected by its length (`PacketKind`). The token is
//! always the first 4 bytes, so filtering never needs a full decode.
//!
//! Control messages sent upstream are small JSON text frames.

use crate::core::market_data::{Depth, DepthItem, Ohlc, PacketKind, Tick, DEPTH_LEVELS};

/// Length of the heartbeat frame
pub const HEARTBEAT_LEN: usize = 1;

/// Size of the count and length prefixes
const PREFIX_LEN: usize = 2;

/// Exchange segment carrying indices (not tradable)
const SEGMENT_INDICES: u32 = 9;
const SEGMENT_CDS: u32 = 3;
const SEGMENT_BCD: u32 = 6;

/// Depth entry size on the wire: qty u32, price i32, orders u16, 2 padding
const DEPTH_ENTRY_LEN: usize = 12;
const DEPTH_OFFSET: usize = 64;

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed packet: unsupported payload length {len}")]
    MalformedPacket { len: usize },

    #[error("Invalid control message: {0}")]
    InvalidControl(String),
}

/// Subscription mode requested from the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Ltp,
    Quote,
    Full,
}

impl Mode {
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Mode::Ltp => "ltp",
            Mode::Quote => "quote",
            Mode::Full => "full",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ltp" => Some(Mode::Ltp),
            "quote" => Some(Mode::Quote),
            "full" => Some(Mode::Full),
            _ => None,
        }
    }
}

/// Price divisor for a token's exchange segment
#[inline(always)]
pub const fn price_divisor(token: u32) -> f64 {
    match token & 0xFF {
        SEGMENT_CDS => 10_000_000.0,
        SEGMENT_BCD => 10_000.0,
        _ => 100.0,
    }
}

/// True for the single-byte keep-alive frame
#[inline(always)]
pub fn is_heartbeat(frame: &[u8]) -> bool {
    frame.len() == HEARTBEAT_LEN
}

/// Zero-copy iterator over the packets of one frame
///
/// Stops early (without panicking) when a declared count or length runs past
/// the end of the frame.
#[derive(Debug, Clone)]
pub struct Packets<'a> {
    frame: &'a [u8],
    pos: usize,
    remaining: usize,
}

impl<'a> Packets<'a> {
    /// Packet count declared in the frame header
    #[inline]
    pub fn declared(&self) -> usize {
        self.remaining
    }
}

impl<'a> Iterator for Packets<'a> {
    type Item = &'a [u8];

    #[inline]
    fn next(&mut self) -> Option<&'a [u8]> {
        if self.remaining == 0 {
            return None;
        }
        let header_end = self.pos + PREFIX_LEN;
        let header = self.frame.get(self.pos..header_end)?;
        let len = u16::from_be_bytes([header[0], header[1]]) as usize;
        let payload = self.frame.get(header_end..header_end + len);
        match payload {
            Some(payload) => {
                self.pos = header_end + len;
                self.remaining -= 1;
                Some(payload)
            }
            None => {
                self.remaining = 0;
                None
            }
        }
    }
}

/// Iterate the packets of a frame without allocating
#[inline]
pub fn packets(frame: &[u8]) -> Packets<'_> {
    let remaining = match frame {
        [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]) as usize,
        _ => 0,
    };
    Packets {
        frame,
        pos: PREFIX_LEN,
        remaining,
    }
}

/// Split a frame into packet payloads. Frames shorter than 2 bytes are not
/// data frames and yield nothing.
pub fn split_frame(frame: &[u8]) -> Vec<&[u8]> {
    packets(frame).collect()
}

/// Token of a packet (first 4 bytes), if present
#[inline(always)]
pub fn packet_token(packet: &[u8]) -> Option<u32> {
    match packet {
        [a, b, c, d, ..] => Some(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => None,
    }
}

#[inline(always)]
fn read_u32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

#[inline(always)]
fn read_price(b: &[u8], at: usize, divisor: f64) -> f64 {
    i32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]]) as f64 / divisor
}

#[inline(always)]
fn read_timestamp(b: &[u8], at: usize) -> Option<i64> {
    match read_u32(b, at) {
        0 => None,
        ts => Some(ts as i64),
    }
}

/// Decode one packet payload into a `Tick`
pub fn parse_packet(packet: &[u8]) -> Result<Tick, CodecError> {
    let kind = PacketKind::from_len(packet.len())
        .ok_or(CodecError::MalformedPacket { len: packet.len() })?;

    let token = read_u32(packet, 0);
    let div = price_divisor(token);
    let mut tick = Tick::ltp(token, read_price(packet, 4, div));
    tick.kind = kind;
    tick.tradable = token & 0xFF != SEGMENT_INDICES;

    match kind {
        PacketKind::Ltp => {}
        PacketKind::IndexQuote | PacketKind::IndexFull => {
            tick.ohlc = Ohlc {
                high: read_price(packet, 8, div),
                low: read_price(packet, 12, div),
                open: read_price(packet, 16, div),
                close: read_price(packet, 20, div),
            };
            tick.net_change = read_price(packet, 24, div);
            if kind == PacketKind::IndexFull {
                tick.timestamp = read_timestamp(packet, 28);
            }
        }
        PacketKind::Quote | PacketKind::Full => {
            tick.last_quantity = read_u32(packet, 8);
            tick.average_price = read_price(packet, 12, div);
            tick.volume = read_u32(packet, 16);
            tick.total_buy_quantity = read_u32(packet, 20);
            tick.total_sell_quantity = read_u32(packet, 24);
            tick.ohlc = Ohlc {
                open: read_price(packet, 28, div),
                high: read_price(packet, 32, div),
                low: read_price(packet, 36, div),
                close: read_price(packet, 40, div),
            };
            tick.net_change = tick.last_price - tick.ohlc.close;

            if kind == PacketKind::Full {
                tick.last_trade_time = read_timestamp(packet, 44);
                tick.oi = read_u32(packet, 48);
                tick.oi_day_high = read_u32(packet, 52);
                tick.oi_day_low = read_u32(packet, 56);
                tick.timestamp = read_timestamp(packet, 60);
                tick.depth = read_depth(packet, div);
            }
        }
    }

    Ok(tick)
}

fn read_depth(packet: &[u8], div: f64) -> Depth {
    let mut depth = Depth::default();
    for i in 0..DEPTH_LEVELS * 2 {
        let at = DEPTH_OFFSET + i * DEPTH_ENTRY_LEN;
        let item = DepthItem {
            quantity: read_u32(packet, at),
            price: read_price(packet, at + 4, div),
            orders: u16::from_be_bytes([packet[at + 8], packet[at + 9]]),
        };
        if i < DEPTH_LEVELS {
            depth.buy[i] = item;
        } else {
            depth.sell[i - DEPTH_LEVELS] = item;
        }
    }
    depth
}

#[inline(always)]
fn put_price(out: &mut Vec<u8>, price: f64, div: f64) {
    out.extend_from_slice(&((price * div).round() as i32).to_be_bytes());
}

#[inline(always)]
fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

#[inline(always)]
fn put_timestamp(out: &mut Vec<u8>, ts: Option<i64>) {
    put_u32(out, ts.unwrap_or(0) as u32);
}

/// Encode a `Tick` into the payload layout named by its `kind`
pub fn encode_packet(tick: &Tick) -> Vec<u8> {
    let div = price_divisor(tick.token);
    let mut out = Vec::with_capacity(tick.kind.len());
    put_u32(&mut out, tick.token);
    put_price(&mut out, tick.last_price, div);

    match tick.kind {
        PacketKind::Ltp => {}
        PacketKind::IndexQuote | PacketKind::IndexFull => {
            for price in [tick.ohlc.high, tick.ohlc.low, tick.ohlc.open, tick.ohlc.close, tick.net_change] {
                put_price(&mut out, price, div);
            }
            if tick.kind == PacketKind::IndexFull {
                put_timestamp(&mut out, tick.timestamp);
            }
        }
        PacketKind::Quote | PacketKind::Full => {
            put_u32(&mut out, tick.last_quantity);
            put_price(&mut out, tick.average_price, div);
            put_u32(&mut out, tick.volume);
            put_u32(&mut out, tick.total_buy_quantity);
            put_u32(&mut out, tick.total_sell_quantity);
            for price in [tick.ohlc.open, tick.ohlc.high, tick.ohlc.low, tick.ohlc.close] {
                put_price(&mut out, price, div);
            }
            if tick.kind == PacketKind::Full {
                put_timestamp(&mut out, tick.last_trade_time);
                put_u32(&mut out, tick.oi);
                put_u32(&mut out, tick.oi_day_high);
                put_u32(&mut out, tick.oi_day_low);
                put_timestamp(&mut out, tick.timestamp);
                for item in tick.depth.buy.iter().chain(tick.depth.sell.iter()) {
                    put_u32(&mut out, item.quantity);
                    put_price(&mut out, item.price, div);
                    out.extend_from_slice(&item.orders.to_be_bytes());
                    out.extend_from_slice(&[0, 0]);
                }
            }
        }
    }

    out
}

/// Build a frame from packet payloads: `[u16 count]([u16 len][payload])*`
pub fn encode_frame<'a, I>(packets: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut out = vec![0u8; PREFIX_LEN];
    let mut count: u16 = 0;
    for packet in packets {
        out.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        out.extend_from_slice(packet);
        count += 1;
    }
    out[..PREFIX_LEN].copy_from_slice(&count.to_be_bytes());
    out
}

/// `{"a":"subscribe","v":[tokens]}`
pub fn encode_subscribe(tokens: &[u32]) -> String {
    serde_json::json!({ "a": "subscribe", "v": tokens }).to_string()
}

/// `{"a":"unsubscribe","v":[tokens]}`
pub fn encode_unsubscribe(tokens: &[u32]) -> String {
    serde_json::json!({ "a": "unsubscribe", "v": tokens }).to_string()
}

/// `{"a":"mode","v":[mode,[tokens]]}`
pub fn encode_mode(mode: Mode, tokens: &[u32]) -> String {
    serde_json::json!({ "a": "mode", "v": [mode.as_str(), tokens] }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{full_tick, index_tick, quote_tick};
    use proptest::prelude::*;

    #[test]
    fn test_split_frame_basic() {
        let a = encode_packet(&Tick::ltp(408_065, 1520.5));
        let b = encode_packet(&Tick::ltp(884_737, 98.25));
        let frame = encode_frame([a.as_slice(), b.as_slice()]);

        let parts = split_frame(&frame);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], a.as_slice());
        assert_eq!(parts[1], b.as_slice());
    }

    #[test]
    fn test_split_short_frames() {
        assert!(split_frame(&[]).is_empty());
        assert!(split_frame(&[0x01]).is_empty());
        assert!(split_frame(&[0, 0]).is_empty());
    }

    #[test]
    fn test_split_truncated_frame() {
        let a = encode_packet(&Tick::ltp(408_065, 1520.5));
        let b = encode_packet(&Tick::ltp(884_737, 98.25));
        let mut frame = encode_frame([a.as_slice(), b.as_slice()]);
        frame.truncate(frame.len() - 3);

        // Second packet runs past the end: partial result
        let parts = split_frame(&frame);
        assert_eq!(parts, vec![a.as_slice()]);

        // Count claims more packets than present
        let mut overclaimed = encode_frame([a.as_slice()]);
        overclaimed[1] = 5;
        assert_eq!(split_frame(&overclaimed).len(), 1);
    }

    #[test]
    fn test_parse_ltp_packet() {
        let mut packet = Vec::new();
        packet.extend_from_slice(&408_065u32.to_be_bytes());
        packet.extend_from_slice(&152_050i32.to_be_bytes());

        let tick = parse_packet(&packet).unwrap();
        assert_eq!(tick.token, 408_065);
        assert_eq!(tick.kind, PacketKind::Ltp);
        assert_eq!(tick.last_price, 1520.5);
        assert!(tick.tradable);
    }

    #[test]
    fn test_parse_index_packet() {
        // NIFTY 50 index token: segment 9
        let tick = index_tick(256_265, 24_400.0);
        let parsed = parse_packet(&encode_packet(&tick)).unwrap();
        assert_eq!(parsed.kind, PacketKind::IndexFull);
        assert!(!parsed.tradable);
        assert_eq!(parsed.last_price, 24_400.0);
        assert_eq!(parsed.ohlc, tick.ohlc);
        assert_eq!(parsed.net_change, tick.net_change);
        assert_eq!(parsed.timestamp, tick.timestamp);
    }

    #[test]
    fn test_parse_quote_packet() {
        let tick = quote_tick(408_065, 1520.5);
        let packet = encode_packet(&tick);
        assert_eq!(packet.len(), PacketKind::QUOTE_LEN);

        let parsed = parse_packet(&packet).unwrap();
        assert_eq!(parsed.volume, tick.volume);
        assert_eq!(parsed.ohlc.close, tick.ohlc.close);
        assert!((parsed.net_change - (1520.5 - tick.ohlc.close)).abs() < 1e-9);
        assert_eq!(parsed.depth, Depth::default());
    }

    #[test]
    fn test_parse_full_packet_depth() {
        let tick = full_tick(12_345_678, 120.0, 119.5, 120.5);
        let packet = encode_packet(&tick);
        assert_eq!(packet.len(), PacketKind::FULL_LEN);

        let parsed = parse_packet(&packet).unwrap();
        assert_eq!(parsed.kind, PacketKind::Full);
        assert_eq!(parsed.best_bid(), 119.5);
        assert_eq!(parsed.best_ask(), 120.5);
        assert_eq!(parsed.depth.buy[0].quantity, tick.depth.buy[0].quantity);
        assert_eq!(parsed.depth.sell[4].orders, tick.depth.sell[4].orders);
        assert_eq!(parsed.oi, tick.oi);
        assert_eq!(parsed.last_trade_time, tick.last_trade_time);
    }

    #[test]
    fn test_currency_segment_divisor() {
        // Segment 3 (cds): 4 decimal places of precision scaled by 1e7
        let token: u32 = (1234 << 8) | 3;
        let mut packet = Vec::new();
        packet.extend_from_slice(&token.to_be_bytes());
        packet.extend_from_slice(&832_512_500i32.to_be_bytes());
        assert_eq!(parse_packet(&packet).unwrap().last_price, 83.25125);

        assert_eq!(price_divisor((1234 << 8) | 6), 10_000.0);
        assert_eq!(price_divisor((1234 << 8) | 1), 100.0);
    }

    #[test]
    fn test_parse_malformed_packet() {
        let err = parse_packet(&[0u8; 16]).unwrap_err();
        assert_eq!(err, CodecError::MalformedPacket { len: 16 });
        assert!(parse_packet(&[]).is_err());
    }

    #[test]
    fn test_malformed_sibling_does_not_abort() {
        let good = encode_packet(&Tick::ltp(408_065, 10.0));
        let bad = [0u8; 12];
        let frame = encode_frame([bad.as_slice(), good.as_slice()]);

        let ticks: Vec<_> = split_frame(&frame)
            .into_iter()
            .filter_map(|p| parse_packet(p).ok())
            .collect();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].token, 408_065);
    }

    #[test]
    fn test_packet_token() {
        assert_eq!(packet_token(&[0, 0, 1, 0, 9]), Some(256));
        assert_eq!(packet_token(&[0, 1]), None);
    }

    #[test]
    fn test_control_messages() {
        assert_eq!(
            encode_subscribe(&[408_065, 884_737]),
            r#"{"a":"subscribe","v":[408065,884737]}"#
        );
        assert_eq!(encode_unsubscribe(&[1]), r#"{"a":"unsubscribe","v":[1]}"#);
        assert_eq!(
            encode_mode(Mode::Full, &[408_065]),
            r#"{"a":"mode","v":["full",[408065]]}"#
        );
    }

    #[test]
    fn test_mode_parse() {
        for mode in [Mode::Ltp, Mode::Quote, Mode::Full] {
            assert_eq!(Mode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(Mode::parse("depth"), None);
    }

    proptest! {
        #[test]
        fn prop_split_returns_every_packet(tokens in prop::collection::vec(any::<u32>(), 0..64)) {
            let payloads: Vec<Vec<u8>> = tokens
                .iter()
                .map(|&t| encode_packet(&Tick::ltp(t, 1.0)))
                .collect();
            let frame = encode_frame(payloads.iter().map(Vec::as_slice));

            let parts = split_frame(&frame);
            prop_assert_eq!(parts.len(), tokens.len());
            for (part, token) in parts.iter().zip(&tokens) {
                prop_assert_eq!(packet_token(part), Some(*token));
            }
        }

        #[test]
        fn prop_split_never_panics(frame in prop::collection::vec(any::<u8>(), 0..512)) {
            let _ = split_frame(&frame);
        }
    }
}

// Hot Path Checklist verified:
// ✓ Packet iteration borrows the frame (no copies)
// ✓ Token read without decoding the payload
// ✓ No panics on truncated frames
// ✓ Length-tagged layouts, one match per packet
