//! Instrument catalog entries
//!
//! `RawInstrument` mirrors one row of the broker's instrument dump.
//! `Instrument` is the validated, immutable form held by the option-chain index.

use serde::Deserialize;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};

use crate::core::catalog::CatalogError;
use crate::core::option_chain::normalize_expiry;

/// Option right
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionType {
    /// Call
    Ce,
    /// Put
    Pe,
}

impl OptionType {
    /// Parse the catalog's instrument type code
    #[inline]
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "CE" => Some(Self::Ce),
            "PE" => Some(Self::Pe),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ce => "CE",
            Self::Pe => "PE",
        }
    }
}

/// One row of the instrument dump, as delivered
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawInstrument {
    pub instrument_token: u32,
    #[serde(default)]
    pub exchange_token: u32,
    pub tradingsymbol: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub last_price: f64,
    /// `YYYY-MM-DD` or empty
    #[serde(default)]
    pub expiry: String,
    #[serde(default)]
    pub strike: f64,
    #[serde(default)]
    pub tick_size: f64,
    #[serde(default)]
    pub lot_size: u32,
    pub instrument_type: String,
    #[serde(default)]
    pub segment: String,
    pub exchange: String,
}

/// Static catalog entry
#[derive(Debug, Clone, PartialEq)]
pub struct Instrument {
    pub token: u32,
    pub exchange_token: u32,
    pub tradingsymbol: String,
    /// Underlying name (empty for instruments without one)
    pub name: String,
    pub exchange: String,
    pub segment: String,
    /// Raw instrument type code (`CE`, `PE`, `FUT`, `EQ`, ...)
    pub instrument_type: String,
    /// Set only for option legs
    pub option_type: Option<OptionType>,
    pub strike: f64,
    /// Expiry normalized to local midnight
    pub expiry: Option<OffsetDateTime>,
    pub lot_size: u32,
    pub tick_size: f64,
}

impl Instrument {
    /// Validate a raw record, normalizing its expiry in `offset`
    pub fn from_raw(raw: &RawInstrument, offset: UtcOffset) -> Result<Self, CatalogError> {
        let expiry = parse_expiry(&raw.expiry, offset).map_err(|e| {
            CatalogError::Parse(format!(
                "token {}: bad expiry {:?}: {}",
                raw.instrument_token, raw.expiry, e
            ))
        })?;

        Ok(Self {
            token: raw.instrument_token,
            exchange_token: raw.exchange_token,
            tradingsymbol: raw.tradingsymbol.clone(),
            name: raw.name.clone(),
            exchange: raw.exchange.clone(),
            segment: raw.segment.clone(),
            instrument_type: raw.instrument_type.clone(),
            option_type: OptionType::parse(&raw.instrument_type),
            strike: raw.strike,
            expiry,
            lot_size: raw.lot_size,
            tick_size: raw.tick_size,
        })
    }

    #[inline]
    pub fn is_option(&self) -> bool {
        self.option_type.is_some()
    }

    /// Whole days until expiry, truncated toward zero
    pub fn days_to_expiry(&self, now: OffsetDateTime) -> Option<i64> {
        self.expiry.map(|expiry| (expiry - now).whole_days())
    }
}

/// Parse a `YYYY-MM-DD` expiry into local midnight. Empty means no expiry.
pub fn parse_expiry(
    value: &str,
    offset: UtcOffset,
) -> Result<Option<OffsetDateTime>, time::error::Parse> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    let date = parse_date(value)?;
    Ok(Some(normalize_expiry(
        date.midnight().assume_offset(offset),
        offset,
    )))
}

/// Parse a `YYYY-MM-DD` calendar date
pub fn parse_date(value: &str) -> Result<Date, time::error::Parse> {
    Date::parse(value, format_description!("[year]-[month]-[day]"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{datetime, offset};

    fn raw_option() -> RawInstrument {
        RawInstrument {
            instrument_token: 12_345_678,
            exchange_token: 48_225,
            tradingsymbol: "NIFTY25DEC24500CE".to_string(),
            name: "NIFTY".to_string(),
            expiry: "2025-12-30".to_string(),
            strike: 24_500.0,
            tick_size: 0.05,
            lot_size: 75,
            instrument_type: "CE".to_string(),
            segment: "NFO-OPT".to_string(),
            exchange: "NFO".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_option_type_parse() {
        assert_eq!(OptionType::parse("CE"), Some(OptionType::Ce));
        assert_eq!(OptionType::parse("PE"), Some(OptionType::Pe));
        assert_eq!(OptionType::parse("FUT"), None);
        assert_eq!(OptionType::parse("ce"), None);
        assert_eq!(OptionType::Pe.as_str(), "PE");
    }

    #[test]
    fn test_from_raw_option() {
        let inst = Instrument::from_raw(&raw_option(), offset!(+5:30)).unwrap();
        assert!(inst.is_option());
        assert_eq!(inst.option_type, Some(OptionType::Ce));
        assert_eq!(inst.expiry, Some(datetime!(2025-12-30 0:00 +5:30)));
        assert_eq!(inst.lot_size, 75);
    }

    #[test]
    fn test_from_raw_without_expiry() {
        let raw = RawInstrument {
            instrument_token: 256_265,
            tradingsymbol: "NIFTY 50".to_string(),
            instrument_type: "EQ".to_string(),
            exchange: "NSE".to_string(),
            ..Default::default()
        };
        let inst = Instrument::from_raw(&raw, offset!(+5:30)).unwrap();
        assert!(!inst.is_option());
        assert_eq!(inst.expiry, None);
        assert_eq!(inst.days_to_expiry(OffsetDateTime::now_utc()), None);
    }

    #[test]
    fn test_from_raw_bad_expiry() {
        let mut raw = raw_option();
        raw.expiry = "30-12-2025".to_string();
        assert!(matches!(
            Instrument::from_raw(&raw, offset!(+5:30)),
            Err(CatalogError::Parse(_))
        ));
    }

    #[test]
    fn test_days_to_expiry_truncates() {
        let inst = Instrument::from_raw(&raw_option(), offset!(+5:30)).unwrap();
        let now = datetime!(2025-12-27 15:30 +5:30);
        // 2 days 8.5 hours
        assert_eq!(inst.days_to_expiry(now), Some(2));
        let after = datetime!(2025-12-30 10:00 +5:30);
        assert_eq!(inst.days_to_expiry(after), Some(0));
    }
}
