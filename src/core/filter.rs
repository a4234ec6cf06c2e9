//! Option selection criteria
//!
//! `FilterCriteria` is the query value object used both by configuration
//! (one entry per underlying to subscribe) and by direct index queries.
//! Validation happens once in `compile`, matching is then branch-only.

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

use crate::core::instrument::{parse_date, Instrument, OptionType};

/// Option filter query
///
/// Every field is optional. An empty `underlying` matches all underlyings.
/// Day bounds use `None` for "unbounded". Days to expiry count whole days
/// from `now` to expiry midnight, truncated toward zero, so `Some(0)` as the
/// upper bound matches anything less than 24h before that midnight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterCriteria {
    #[serde(default)]
    pub underlying: String,
    /// `CE` or `PE`
    #[serde(default)]
    pub option_type: Option<String>,
    /// `YYYY-MM-DD`
    #[serde(default)]
    pub expiry: Option<String>,
    #[serde(default)]
    pub min_strike: Option<f64>,
    #[serde(default)]
    pub max_strike: Option<f64>,
    #[serde(default)]
    pub min_days_to_expiry: Option<i64>,
    #[serde(default)]
    pub max_days_to_expiry: Option<i64>,
}

impl FilterCriteria {
    /// Criteria selecting every option on `underlying`
    pub fn for_underlying(underlying: impl Into<String>) -> Self {
        Self {
            underlying: underlying.into(),
            ..Default::default()
        }
    }

    pub fn with_option_type(mut self, option_type: OptionType) -> Self {
        self.option_type = Some(option_type.as_str().to_string());
        self
    }

    pub fn with_expiry(mut self, expiry: &str) -> Self {
        self.expiry = Some(expiry.to_string());
        self
    }

    pub fn with_strike_range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_strike = min;
        self.max_strike = max;
        self
    }

    pub fn with_days_range(mut self, min: Option<i64>, max: Option<i64>) -> Self {
        self.min_days_to_expiry = min;
        self.max_days_to_expiry = max;
        self
    }

    /// Check the criteria without building a matcher
    pub fn validate(&self) -> Result<(), FilterError> {
        self.compile(UtcOffset::UTC).map(|_| ())
    }

    /// Validate and resolve the criteria into a matcher. Expiry dates are
    /// normalized to local midnight in `offset`.
    pub fn compile(&self, offset: UtcOffset) -> Result<CompiledFilter, FilterError> {
        let option_type = match non_empty(&self.option_type) {
            Some(code) => Some(OptionType::parse(code).ok_or_else(|| {
                FilterError::InvalidFilterCriteria(format!(
                    "option_type must be CE or PE, got {:?}",
                    code
                ))
            })?),
            None => None,
        };

        let expiry = match non_empty(&self.expiry) {
            Some(text) => {
                let date = parse_date(text).map_err(|e| {
                    FilterError::InvalidFilterCriteria(format!(
                        "expiry must be YYYY-MM-DD, got {:?}: {}",
                        text, e
                    ))
                })?;
                Some(date.midnight().assume_offset(offset))
            }
            None => None,
        };

        if let (Some(min), Some(max)) = (self.min_strike, self.max_strike) {
            if min > max {
                return Err(FilterError::InvalidFilterCriteria(format!(
                    "min_strike {} exceeds max_strike {}",
                    min, max
                )));
            }
        }

        for (field, value) in [
            ("min_days_to_expiry", self.min_days_to_expiry),
            ("max_days_to_expiry", self.max_days_to_expiry),
        ] {
            if let Some(days) = value {
                if days < 0 {
                    return Err(FilterError::InvalidFilterCriteria(format!(
                        "{} must not be negative, got {}",
                        field, days
                    )));
                }
            }
        }

        if let (Some(min), Some(max)) = (self.min_days_to_expiry, self.max_days_to_expiry) {
            if min > max {
                return Err(FilterError::InvalidFilterCriteria(format!(
                    "min_days_to_expiry {} exceeds max_days_to_expiry {}",
                    min, max
                )));
            }
        }

        Ok(CompiledFilter {
            underlying: Some(self.underlying.trim().to_string()).filter(|u| !u.is_empty()),
            expiry,
            option_type,
            min_strike: self.min_strike,
            max_strike: self.max_strike,
            min_days: self.min_days_to_expiry,
            max_days: self.max_days_to_expiry,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Validated criteria, ready for matching
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    pub underlying: Option<String>,
    pub expiry: Option<OffsetDateTime>,
    pub option_type: Option<OptionType>,
    pub min_strike: Option<f64>,
    pub max_strike: Option<f64>,
    pub min_days: Option<i64>,
    pub max_days: Option<i64>,
}

impl CompiledFilter {
    /// Test one instrument against every bound
    pub fn matches(&self, inst: &Instrument, now: OffsetDateTime) -> bool {
        if let Some(underlying) = &self.underlying {
            if inst.name != *underlying {
                return false;
            }
        }
        if let Some(expiry) = self.expiry {
            if inst.expiry != Some(expiry) {
                return false;
            }
        }
        if let Some(min) = self.min_strike {
            if inst.strike < min {
                return false;
            }
        }
        if let Some(max) = self.max_strike {
            if inst.strike > max {
                return false;
            }
        }
        if let Some(option_type) = self.option_type {
            if inst.option_type != Some(option_type) {
                return false;
            }
        }
        if self.min_days.is_some() || self.max_days.is_some() {
            let Some(days) = inst.days_to_expiry(now) else {
                return false;
            };
            if self.min_days.is_some_and(|min| days < min) {
                return false;
            }
            if self.max_days.is_some_and(|max| days > max) {
                return false;
            }
        }
        true
    }
}

/// Filter validation errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterError {
    #[error("Invalid filter criteria: {0}")]
    InvalidFilterCriteria(String),

    #[error("Unknown underlying: {0}")]
    UnknownUnderlying(String),
}
