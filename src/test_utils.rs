//! Test fixtures for catalog records and ticks

use crate::core::instrument::RawInstrument;
use crate::core::market_data::{DepthItem, Ohlc, PacketKind, Tick};

/// NSE spot/index record (`EQ` on NSE)
pub fn spot_record(token: u32, tradingsymbol: &str) -> RawInstrument {
    RawInstrument {
        instrument_token: token,
        tradingsymbol: tradingsymbol.to_string(),
        name: tradingsymbol.to_string(),
        instrument_type: "EQ".to_string(),
        segment: "INDICES".to_string(),
        exchange: "NSE".to_string(),
        ..Default::default()
    }
}

/// NFO option record
pub fn option_record(token: u32, name: &str, strike: f64, kind: &str, expiry: &str) -> RawInstrument {
    RawInstrument {
        instrument_token: token,
        exchange_token: token >> 8,
        tradingsymbol: format!("{}{}{}", name, strike as u64, kind),
        name: name.to_string(),
        expiry: expiry.to_string(),
        strike,
        tick_size: 0.05,
        lot_size: 75,
        instrument_type: kind.to_string(),
        segment: "NFO-OPT".to_string(),
        exchange: "NFO".to_string(),
        ..Default::default()
    }
}

/// Index tick with OHLC, net change and exchange timestamp
pub fn index_tick(token: u32, last_price: f64) -> Tick {
    let mut tick = Tick::ltp(token, last_price);
    tick.kind = PacketKind::IndexFull;
    tick.tradable = false;
    tick.ohlc = Ohlc {
        open: last_price - 50.0,
        high: last_price + 25.5,
        low: last_price - 80.25,
        close: last_price - 150.25,
    };
    tick.net_change = 150.25;
    tick.timestamp = Some(1_766_998_800);
    tick
}

/// Quote-mode tick without depth
pub fn quote_tick(token: u32, last_price: f64) -> Tick {
    let mut tick = Tick::ltp(token, last_price);
    tick.kind = PacketKind::Quote;
    tick.last_quantity = 25;
    tick.average_price = last_price - 0.5;
    tick.volume = 1_204_500;
    tick.total_buy_quantity = 50_000;
    tick.total_sell_quantity = 62_000;
    tick.ohlc = Ohlc {
        open: last_price - 10.0,
        high: last_price + 5.0,
        low: last_price - 12.5,
        close: last_price - 7.25,
    };
    tick.net_change = 7.25;
    tick
}

/// Full-mode tick with five levels each side, best bid/ask as given
pub fn full_tick(token: u32, last_price: f64, bid: f64, ask: f64) -> Tick {
    let mut tick = quote_tick(token, last_price);
    tick.kind = PacketKind::Full;
    tick.last_trade_time = Some(1_766_998_790);
    tick.oi = 4_500_000;
    tick.oi_day_high = 4_800_000;
    tick.oi_day_low = 4_100_000;
    tick.timestamp = Some(1_766_998_800);
    for level in 0..5 {
        let step = level as f64 * 0.05;
        tick.depth.buy[level] = DepthItem {
            price: bid - step,
            quantity: 75 * (level as u32 + 1),
            orders: level as u16 + 1,
        };
        tick.depth.sell[level] = DepthItem {
            price: ask + step,
            quantity: 150 * (level as u32 + 1),
            orders: level as u16 + 2,
        };
    }
    tick
}
