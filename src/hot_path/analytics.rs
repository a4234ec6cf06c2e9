//! Per-tick option analytics
//!
//! For each tick on an option leg: update the leg's market fields, then
//! solve IV and Greeks against the underlying's cached price. Every failure
//! is a skip; the leg keeps its last good analytics.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use crate::core::market_data::Tick;
use crate::core::option_chain::OptionChainIndex;
use crate::hot_path::calculator::{intrinsic_value, time_value, Greeks, GreeksCalculator, IvEstimate};
use crate::hot_path::price_cache::PriceCache;

const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0;

/// Why a tick produced no Greeks
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    #[error("token not in catalog")]
    UnknownToken,
    #[error("instrument is not an option")]
    NotAnOption,
    #[error("no chain for underlying/expiry")]
    ChainMissing,
    #[error("no leg at strike")]
    LegMissing,
    #[error("underlying price unavailable")]
    NoUnderlyingPrice,
    #[error("option expired")]
    Expired,
    #[error("no positive market price")]
    NoMarketPrice,
    #[error("implied volatility unavailable")]
    NoVolatility,
}

/// Result of one successful analytics pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GreeksSnapshot {
    pub token: u32,
    pub underlying_price: f64,
    /// Years
    pub time_to_expiry: f64,
    pub market_price: f64,
    pub iv: IvEstimate,
    pub greeks: Greeks,
    pub intrinsic_value: f64,
    pub time_value: f64,
}

/// Analytics engine over the option-chain index and price cache
pub struct OptionAnalytics {
    index: Arc<OptionChainIndex>,
    cache: Arc<PriceCache>,
    calculator: GreeksCalculator,
}

impl OptionAnalytics {
    pub fn new(index: Arc<OptionChainIndex>, cache: Arc<PriceCache>, calculator: GreeksCalculator) -> Self {
        Self {
            index,
            cache,
            calculator,
        }
    }

    pub fn calculator(&self) -> &GreeksCalculator {
        &self.calculator
    }

    /// Process a live tick against the wall clock
    #[inline]
    pub fn on_tick(&self, tick: &Tick) -> Option<GreeksSnapshot> {
        match self.process_at(tick, OffsetDateTime::now_utc()) {
            Ok(snapshot) => Some(snapshot),
            Err(reason) => {
                tracing::trace!(target: "analytics", token = tick.token, %reason, "Skipped tick");
                None
            }
        }
    }

    /// Process a tick as of `now`
    pub fn process_at(&self, tick: &Tick, now: OffsetDateTime) -> Result<GreeksSnapshot, SkipReason> {
        let snapshot = self.index.snapshot();
        let inst = match snapshot.lookup(tick.token) {
            Some(inst) => inst,
            None if snapshot.is_underlying_token(tick.token) => return Err(SkipReason::NotAnOption),
            None => return Err(SkipReason::UnknownToken),
        };
        let (option_type, expiry) = match (inst.option_type, inst.expiry) {
            (Some(option_type), Some(expiry)) => (option_type, expiry),
            _ => return Err(SkipReason::NotAnOption),
        };

        let chain = snapshot
            .chain(&inst.name, expiry)
            .ok_or(SkipReason::ChainMissing)?;
        let leg = chain
            .strike(inst.strike)
            .and_then(|strike| strike.leg(option_type))
            .ok_or(SkipReason::LegMissing)?;

        leg.update(|q| {
            q.last_price = tick.last_price;
            q.bid = tick.best_bid();
            q.ask = tick.best_ask();
            q.volume = tick.volume;
            q.oi = tick.oi;
            q.updated_at = Some(now);
        });

        let underlying_price = snapshot
            .underlying_token(&inst.name)
            .and_then(|token| self.cache.last_price(token))
            .filter(|price| *price > 0.0)
            .ok_or(SkipReason::NoUnderlyingPrice)?;
        chain.set_underlying_price(underlying_price);

        let remaining = (expiry - now).max(Duration::ZERO);
        let time_to_expiry = remaining.as_seconds_f64() / SECONDS_PER_YEAR;
        if time_to_expiry <= 0.0 {
            return Err(SkipReason::Expired);
        }

        let market_price = tick.mid_price().unwrap_or(tick.last_price);
        if market_price <= 0.0 {
            return Err(SkipReason::NoMarketPrice);
        }

        let iv = self
            .calculator
            .implied_volatility(market_price, underlying_price, inst.strike, time_to_expiry, option_type)
            .filter(|iv| iv.vol > 0.0)
            .ok_or(SkipReason::NoVolatility)?;

        let greeks = self
            .calculator
            .greeks(underlying_price, inst.strike, time_to_expiry, iv.vol, option_type);
        let intrinsic = intrinsic_value(underlying_price, inst.strike, option_type);
        let extrinsic = time_value(market_price, intrinsic);

        leg.update(|q| {
            q.iv = iv.vol;
            q.delta = greeks.delta;
            q.gamma = greeks.gamma;
            q.theta = greeks.theta;
            q.vega = greeks.vega;
            q.intrinsic_value = intrinsic;
            q.time_value = extrinsic;
        });

        if !iv.converged {
            tracing::debug!(
                target: "analytics",
                token = tick.token,
                iterations = iv.iterations,
                "IV solver did not converge, using best estimate"
            );
        }

        Ok(GreeksSnapshot {
            token: tick.token,
            underlying_price,
            time_to_expiry,
            market_price,
            iv,
            greeks,
            intrinsic_value: intrinsic,
            time_value: extrinsic,
        })
    }
}
