//! Option-chain index
//!
//! Built from the instrument catalog, rebuilt wholesale on refresh.
//! Readers take an `Arc<CatalogSnapshot>` and keep a consistent view for as
//! long as they hold it. Live leg fields are updated in place without the
//! structural lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use time::{OffsetDateTime, UtcOffset};

use crate::core::catalog::{CatalogError, CatalogSource};
use crate::core::filter::{FilterCriteria, FilterError};
use crate::core::instrument::{Instrument, OptionType, RawInstrument};

/// Pin an expiry to local midnight of its calendar date in `offset`.
///
/// Two timestamps on the same local date always normalize to the same value.
#[inline]
pub fn normalize_expiry(ts: OffsetDateTime, offset: UtcOffset) -> OffsetDateTime {
    ts.to_offset(offset).date().midnight().assume_offset(offset)
}

/// Live market and analytics fields of one option leg
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LegQuote {
    pub last_price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume: u32,
    pub oi: u32,
    pub iv: f64,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub intrinsic_value: f64,
    pub time_value: f64,
    pub updated_at: Option<OffsetDateTime>,
}

/// One call or put leg. Created once per catalog build; only its quote mutates.
#[derive(Debug)]
pub struct OptionLeg {
    instrument: Arc<Instrument>,
    quote: RwLock<LegQuote>,
}

impl OptionLeg {
    pub fn new(instrument: Arc<Instrument>) -> Self {
        Self {
            instrument,
            quote: RwLock::new(LegQuote::default()),
        }
    }

    #[inline]
    pub fn token(&self) -> u32 {
        self.instrument.token
    }

    #[inline]
    pub fn instrument(&self) -> &Arc<Instrument> {
        &self.instrument
    }

    /// Copy of the current live fields
    #[inline]
    pub fn quote(&self) -> LegQuote {
        *self.quote.read()
    }

    /// Mutate the live fields under the leg's own lock
    #[inline]
    pub fn update<F: FnOnce(&mut LegQuote)>(&self, f: F) {
        f(&mut self.quote.write());
    }
}

/// Call and put legs sharing one strike
#[derive(Debug)]
pub struct StrikeData {
    pub strike: f64,
    pub call: Option<Arc<OptionLeg>>,
    pub put: Option<Arc<OptionLeg>>,
}

impl StrikeData {
    fn new(strike: f64) -> Self {
        Self {
            strike,
            call: None,
            put: None,
        }
    }

    #[inline]
    pub fn leg(&self, option_type: OptionType) -> Option<&Arc<OptionLeg>> {
        match option_type {
            OptionType::Ce => self.call.as_ref(),
            OptionType::Pe => self.put.as_ref(),
        }
    }
}

/// All strikes of one underlying for one expiry
#[derive(Debug)]
pub struct OptionChain {
    pub underlying: String,
    pub expiry: OffsetDateTime,
    strikes: BTreeMap<OrderedFloat<f64>, StrikeData>,
    /// f64 bits of the latest underlying price used (0 = unknown)
    underlying_price: AtomicU64,
}

impl OptionChain {
    fn new(underlying: String, expiry: OffsetDateTime) -> Self {
        Self {
            underlying,
            expiry,
            strikes: BTreeMap::new(),
            underlying_price: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn strike(&self, strike: f64) -> Option<&StrikeData> {
        self.strikes.get(&OrderedFloat(strike))
    }

    /// Strikes in ascending order
    pub fn strikes(&self) -> impl Iterator<Item = &StrikeData> {
        self.strikes.values()
    }

    pub fn strike_prices(&self) -> Vec<f64> {
        self.strikes.keys().map(|k| k.0).collect()
    }

    pub fn len(&self) -> usize {
        self.strikes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strikes.is_empty()
    }

    /// Every leg token in strike order, calls before puts
    pub fn tokens(&self) -> Vec<u32> {
        self.strikes
            .values()
            .flat_map(|s| s.call.iter().chain(s.put.iter()))
            .map(|leg| leg.token())
            .collect()
    }

    #[inline]
    pub fn underlying_price(&self) -> Option<f64> {
        let price = f64::from_bits(self.underlying_price.load(Ordering::Acquire));
        (price > 0.0).then_some(price)
    }

    #[inline]
    pub fn set_underlying_price(&self, price: f64) {
        self.underlying_price.store(price.to_bits(), Ordering::Release);
    }
}

/// Default canonical timezone for expiries
pub const IST: UtcOffset = time::macros::offset!(+5:30);

/// How raw records map onto chains and underlying spot tokens
#[derive(Debug, Clone)]
pub struct ChainIndexConfig {
    /// Canonical timezone for expiry normalization
    pub offset: UtcOffset,
    /// Exchange carrying the underlying spot instruments
    pub spot_exchange: String,
    /// Underlying name -> spot tradingsymbol (e.g. NIFTY -> "NIFTY 50")
    pub underlying_aliases: HashMap<String, String>,
    /// Explicit underlying name -> spot token pins
    pub underlying_tokens: HashMap<String, u32>,
}

impl Default for ChainIndexConfig {
    fn default() -> Self {
        Self {
            offset: IST,
            spot_exchange: "NSE".to_string(),
            underlying_aliases: default_aliases(),
            underlying_tokens: HashMap::new(),
        }
    }
}

fn default_aliases() -> HashMap<String, String> {
    [
        ("NIFTY", "NIFTY 50"),
        ("BANKNIFTY", "NIFTY BANK"),
        ("FINNIFTY", "NIFTY FIN SERVICE"),
        ("MIDCPNIFTY", "NIFTY MID SELECT"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Immutable result of one catalog build
#[derive(Debug)]
pub struct CatalogSnapshot {
    instruments: HashMap<u32, Arc<Instrument>>,
    chains: HashMap<String, BTreeMap<OffsetDateTime, Arc<OptionChain>>>,
    underlying_tokens: HashMap<String, u32>,
    spot_tokens: HashSet<u32>,
    built_at: OffsetDateTime,
}

impl CatalogSnapshot {
    /// A snapshot with no instruments
    pub fn empty() -> Self {
        Self {
            instruments: HashMap::new(),
            chains: HashMap::new(),
            underlying_tokens: HashMap::new(),
            spot_tokens: HashSet::new(),
            built_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    /// Build token map, chains and underlying tokens from raw records.
    ///
    /// Only option records enter the token map; spot records feed the
    /// underlying-token map. Records that fail validation are skipped. When
    /// two records claim the same leg the later one wins.
    pub fn build(records: &[RawInstrument], config: &ChainIndexConfig) -> Self {
        let mut instruments = HashMap::with_capacity(records.len());
        let mut spot_by_symbol: HashMap<&str, u32> = HashMap::new();
        let mut building: HashMap<String, BTreeMap<OffsetDateTime, OptionChain>> = HashMap::new();
        let mut rejected = 0usize;

        for raw in records {
            let inst = match Instrument::from_raw(raw, config.offset) {
                Ok(inst) => Arc::new(inst),
                Err(e) => {
                    rejected += 1;
                    tracing::debug!(target: "catalog", "Skipping record: {}", e);
                    continue;
                }
            };

            if !inst.is_option() {
                if inst.instrument_type == "EQ" && inst.exchange == config.spot_exchange {
                    spot_by_symbol.insert(raw.tradingsymbol.as_str(), inst.token);
                }
                continue;
            }

            if let (Some(option_type), Some(expiry), false) =
                (inst.option_type, inst.expiry, inst.name.is_empty())
            {
                let chain = building
                    .entry(inst.name.clone())
                    .or_default()
                    .entry(expiry)
                    .or_insert_with(|| OptionChain::new(inst.name.clone(), expiry));
                let strike = chain
                    .strikes
                    .entry(OrderedFloat(inst.strike))
                    .or_insert_with(|| StrikeData::new(inst.strike));
                let slot = match option_type {
                    OptionType::Ce => &mut strike.call,
                    OptionType::Pe => &mut strike.put,
                };
                if let Some(previous) = slot.replace(Arc::new(OptionLeg::new(inst.clone()))) {
                    if previous.token() != inst.token {
                        instruments.remove(&previous.token());
                    }
                    tracing::debug!(
                        target: "catalog",
                        "Leg {} replaced by token {}",
                        previous.token(),
                        inst.token
                    );
                }
            }
            instruments.insert(inst.token, inst);
        }

        if rejected > 0 {
            tracing::warn!(target: "catalog", "Rejected {} catalog records", rejected);
        }

        let mut underlying_tokens = HashMap::new();
        for name in building.keys() {
            let symbol = config
                .underlying_aliases
                .get(name)
                .map(String::as_str)
                .unwrap_or(name.as_str());
            if let Some(&token) = spot_by_symbol.get(symbol) {
                underlying_tokens.insert(name.clone(), token);
            }
        }
        underlying_tokens.extend(config.underlying_tokens.iter().map(|(k, v)| (k.clone(), *v)));
        let spot_tokens = underlying_tokens.values().copied().collect();

        let chains = building
            .into_iter()
            .map(|(name, by_expiry)| {
                let by_expiry = by_expiry
                    .into_iter()
                    .map(|(expiry, chain)| (expiry, Arc::new(chain)))
                    .collect();
                (name, by_expiry)
            })
            .collect();

        Self {
            instruments,
            chains,
            underlying_tokens,
            spot_tokens,
            built_at: OffsetDateTime::now_utc(),
        }
    }

    #[inline]
    pub fn lookup(&self, token: u32) -> Option<&Arc<Instrument>> {
        self.instruments.get(&token)
    }

    /// Chain for an already-normalized expiry
    #[inline]
    pub fn chain(&self, underlying: &str, expiry: OffsetDateTime) -> Option<&Arc<OptionChain>> {
        self.chains.get(underlying)?.get(&expiry)
    }

    pub fn underlying_token(&self, underlying: &str) -> Option<u32> {
        self.underlying_tokens.get(underlying).copied()
    }

    /// True for a token resolved as some underlying's spot instrument
    #[inline]
    pub fn is_underlying_token(&self, token: u32) -> bool {
        self.spot_tokens.contains(&token)
    }

    pub fn has_underlying(&self, underlying: &str) -> bool {
        self.chains.contains_key(underlying)
    }

    pub fn instrument_count(&self) -> usize {
        self.instruments.len()
    }

    pub fn built_at(&self) -> OffsetDateTime {
        self.built_at
    }
}

/// Option-chain index over the current catalog snapshot
pub struct OptionChainIndex {
    config: ChainIndexConfig,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
}

impl OptionChainIndex {
    pub fn new(config: ChainIndexConfig) -> Self {
        Self {
            config,
            snapshot: RwLock::new(Arc::new(CatalogSnapshot::empty())),
        }
    }

    pub fn config(&self) -> &ChainIndexConfig {
        &self.config
    }

    /// Current snapshot. Holding it pins a consistent pre-refresh view.
    #[inline]
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.read().clone()
    }

    /// Fetch the catalog and swap in a freshly built snapshot.
    ///
    /// On fetch failure or an empty catalog the previous snapshot stays.
    pub async fn refresh<S: CatalogSource>(&self, source: &S) -> Result<usize, CatalogError> {
        let records = source.fetch_all_instruments().await.map_err(|e| {
            tracing::error!(target: "catalog", "Catalog fetch failed, keeping previous snapshot: {}", e);
            e
        })?;
        if records.is_empty() {
            tracing::warn!(target: "catalog", "Catalog fetch returned no instruments, keeping previous snapshot");
            return Err(CatalogError::Empty);
        }
        Ok(self.load(&records))
    }

    /// Build from records and swap. Returns the number of instruments.
    pub fn load(&self, records: &[RawInstrument]) -> usize {
        let snapshot = Arc::new(CatalogSnapshot::build(records, &self.config));
        let count = snapshot.instrument_count();
        let chains: usize = snapshot.chains.values().map(BTreeMap::len).sum();
        *self.snapshot.write() = snapshot;
        tracing::info!(target: "catalog", "Catalog loaded: {} instruments, {} chains", count, chains);
        count
    }

    #[inline]
    pub fn lookup(&self, token: u32) -> Option<Arc<Instrument>> {
        self.snapshot().lookup(token).cloned()
    }

    /// Chain for `expiry`, which is normalized before lookup
    pub fn get_chain(&self, underlying: &str, expiry: OffsetDateTime) -> Option<Arc<OptionChain>> {
        let expiry = normalize_expiry(expiry, self.config.offset);
        self.snapshot().chain(underlying, expiry).cloned()
    }

    pub fn underlying_token(&self, underlying: &str) -> Option<u32> {
        self.snapshot().underlying_token(underlying)
    }

    /// Sorted underlying names with at least one chain
    pub fn underlyings(&self) -> Vec<String> {
        let snapshot = self.snapshot();
        let mut names: Vec<String> = snapshot.chains.keys().cloned().collect();
        names.sort();
        names
    }

    /// Sorted expiries listed for `underlying`
    pub fn expiries(&self, underlying: &str) -> Vec<OffsetDateTime> {
        self.snapshot()
            .chains
            .get(underlying)
            .map(|by_expiry| by_expiry.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Every option token on `underlying`, across all expiries
    pub fn tokens_for_underlying(&self, underlying: &str) -> Vec<u32> {
        self.snapshot()
            .chains
            .get(underlying)
            .map(|by_expiry| by_expiry.values().flat_map(|c| c.tokens()).collect())
            .unwrap_or_default()
    }

    /// Option tokens on `underlying` for one expiry
    pub fn tokens_for_expiry(&self, underlying: &str, expiry: OffsetDateTime) -> Vec<u32> {
        self.get_chain(underlying, expiry)
            .map(|chain| chain.tokens())
            .unwrap_or_default()
    }

    pub fn all_tokens(&self) -> Vec<u32> {
        let mut tokens: Vec<u32> = self.snapshot().instruments.keys().copied().collect();
        tokens.sort_unstable();
        tokens
    }

    pub fn instrument_count(&self) -> usize {
        self.snapshot().instrument_count()
    }

    /// Reject criteria naming an underlying absent from the catalog
    pub fn check_underlying(&self, criteria: &FilterCriteria) -> Result<(), FilterError> {
        let name = criteria.underlying.trim();
        if name.is_empty() || self.snapshot().has_underlying(name) {
            Ok(())
        } else {
            Err(FilterError::UnknownUnderlying(name.to_string()))
        }
    }

    /// Option tokens matching `criteria`, sorted ascending
    pub fn filter_options(&self, criteria: &FilterCriteria) -> Result<Vec<u32>, FilterError> {
        self.filter_options_at(criteria, OffsetDateTime::now_utc())
    }

    /// `filter_options` with an explicit clock
    pub fn filter_options_at(
        &self,
        criteria: &FilterCriteria,
        now: OffsetDateTime,
    ) -> Result<Vec<u32>, FilterError> {
        let matcher = criteria.compile(self.config.offset)?;
        let snapshot = self.snapshot();
        let mut tokens: Vec<u32> = snapshot
            .instruments
            .values()
            .filter(|inst| inst.is_option() && matcher.matches(inst, now))
            .map(|inst| inst.token)
            .collect();
        tokens.sort_unstable();
        Ok(tokens)
    }
}

impl Default for OptionChainIndex {
    fn default() -> Self {
        Self::new(ChainIndexConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::StaticCatalogSource;
    use crate::test_utils::{option_record, spot_record};
    use time::macros::{datetime, offset};

    fn sample_records() -> Vec<RawInstrument> {
        vec![
            spot_record(256_265, "NIFTY 50"),
            option_record(1001, "NIFTY", 24_500.0, "CE", "2025-12-30"),
            option_record(1002, "NIFTY", 24_500.0, "PE", "2025-12-30"),
            option_record(1003, "NIFTY", 24_600.0, "CE", "2025-12-30"),
            option_record(1004, "NIFTY", 24_500.0, "CE", "2026-01-27"),
            option_record(2001, "BANKNIFTY", 52_000.0, "CE", "2025-12-30"),
        ]
    }

    fn loaded_index() -> OptionChainIndex {
        let index = OptionChainIndex::default();
        index.load(&sample_records());
        index
    }

    #[test]
    fn test_normalize_expiry_same_date() {
        let a = normalize_expiry(datetime!(2025-12-30 09:15 +5:30), offset!(+5:30));
        let b = normalize_expiry(datetime!(2025-12-30 15:29:59 +5:30), offset!(+5:30));
        assert_eq!(a, b);
        assert_eq!(a, datetime!(2025-12-30 0:00 +5:30));

        // 20:00 UTC on the 29th is already the 30th in +05:30
        let c = normalize_expiry(datetime!(2025-12-29 20:00 UTC), offset!(+5:30));
        assert_eq!(c, a);
    }

    #[test]
    fn test_build_chains() {
        let index = loaded_index();
        assert_eq!(index.instrument_count(), 5);
        assert_eq!(index.underlyings(), vec!["BANKNIFTY", "NIFTY"]);
        assert_eq!(index.expiries("NIFTY").len(), 2);

        let chain = index
            .get_chain("NIFTY", datetime!(2025-12-30 12:00 +5:30))
            .unwrap();
        assert_eq!(chain.strike_prices(), vec![24_500.0, 24_600.0]);

        let strike = chain.strike(24_500.0).unwrap();
        assert_eq!(strike.leg(OptionType::Ce).unwrap().token(), 1001);
        assert_eq!(strike.leg(OptionType::Pe).unwrap().token(), 1002);
        assert!(chain.strike(24_600.0).unwrap().put.is_none());
    }

    #[test]
    fn test_underlying_token_resolution() {
        let index = loaded_index();
        assert_eq!(index.underlying_token("NIFTY"), Some(256_265));
        assert_eq!(index.underlying_token("BANKNIFTY"), None);

        let mut config = ChainIndexConfig::default();
        config.underlying_tokens.insert("BANKNIFTY".to_string(), 260_105);
        let pinned = OptionChainIndex::new(config);
        pinned.load(&sample_records());
        assert_eq!(pinned.underlying_token("BANKNIFTY"), Some(260_105));
    }

    #[test]
    fn test_spot_records_stay_out_of_token_map() {
        let index = OptionChainIndex::default();
        let count = index.load(&[
            spot_record(256_265, "NIFTY 50"),
            option_record(1001, "NIFTY", 24_500.0, "CE", "2025-12-30"),
        ]);
        assert_eq!(count, 1);
        assert_eq!(index.all_tokens(), vec![1001]);
        assert!(index.lookup(256_265).is_none());
        assert_eq!(index.underlying_token("NIFTY"), Some(256_265));

        let snapshot = index.snapshot();
        assert!(snapshot.is_underlying_token(256_265));
        assert!(!snapshot.is_underlying_token(1001));
    }

    #[test]
    fn test_duplicate_leg_last_record_wins() {
        let index = OptionChainIndex::default();
        index.load(&[
            option_record(1001, "NIFTY", 24_500.0, "CE", "2025-12-30"),
            option_record(1009, "NIFTY", 24_500.0, "CE", "2025-12-30"),
        ]);
        let chain = index
            .get_chain("NIFTY", datetime!(2025-12-30 0:00 +5:30))
            .unwrap();
        assert_eq!(chain.strike(24_500.0).unwrap().leg(OptionType::Ce).unwrap().token(), 1009);
        assert_eq!(chain.tokens(), vec![1009]);
        assert_eq!(index.all_tokens(), vec![1009]);
    }

    #[test]
    fn test_token_views() {
        let index = loaded_index();
        let mut nifty = index.tokens_for_underlying("NIFTY");
        nifty.sort_unstable();
        assert_eq!(nifty, vec![1001, 1002, 1003, 1004]);

        let dec = index.tokens_for_expiry("NIFTY", datetime!(2025-12-30 0:00 +5:30));
        assert_eq!(dec, vec![1001, 1002, 1003]);

        assert!(index.tokens_for_underlying("SENSEX").is_empty());
        assert_eq!(index.all_tokens(), vec![1001, 1002, 1003, 1004, 2001]);
        assert_eq!(index.lookup(1004).unwrap().strike, 24_500.0);
        assert!(index.lookup(9999).is_none());
    }

    #[test]
    fn test_filter_options() {
        let index = loaded_index();
        let now = datetime!(2025-12-20 10:00 +5:30);

        let calls = FilterCriteria::for_underlying("NIFTY").with_option_type(OptionType::Ce);
        assert_eq!(
            index.filter_options_at(&calls, now).unwrap(),
            vec![1001, 1003, 1004]
        );

        let near = FilterCriteria::for_underlying("NIFTY").with_days_range(None, Some(15));
        assert_eq!(
            index.filter_options_at(&near, now).unwrap(),
            vec![1001, 1002, 1003]
        );

        // Spot instruments never match
        let everything = FilterCriteria::default();
        assert_eq!(index.filter_options_at(&everything, now).unwrap().len(), 5);

        let bad = FilterCriteria::default().with_expiry("soon");
        assert!(index.filter_options_at(&bad, now).is_err());
    }

    #[test]
    fn test_check_underlying() {
        let index = loaded_index();
        assert!(index.check_underlying(&FilterCriteria::for_underlying("NIFTY")).is_ok());
        assert!(index.check_underlying(&FilterCriteria::default()).is_ok());
        assert_eq!(
            index.check_underlying(&FilterCriteria::for_underlying("SENSEX")),
            Err(FilterError::UnknownUnderlying("SENSEX".to_string()))
        );
    }

    #[test]
    fn test_refresh_is_atomic_for_readers() {
        let index = loaded_index();
        let expiry = datetime!(2025-12-30 0:00 +5:30);
        let before = index.get_chain("NIFTY", expiry).unwrap();
        before
            .strike(24_500.0)
            .unwrap()
            .call
            .as_ref()
            .unwrap()
            .update(|q| q.last_price = 120.0);

        let refreshed = vec![
            spot_record(256_265, "NIFTY 50"),
            option_record(1101, "NIFTY", 25_000.0, "CE", "2025-12-30"),
        ];
        index.load(&refreshed);

        // Old reference still sees the old structure and its live fields
        assert_eq!(before.strike_prices(), vec![24_500.0, 24_600.0]);
        let old_leg = before.strike(24_500.0).unwrap().call.as_ref().unwrap();
        assert_eq!(old_leg.quote().last_price, 120.0);

        // New lookups see only the rebuilt structure
        let after = index.get_chain("NIFTY", expiry).unwrap();
        assert_eq!(after.strike_prices(), vec![25_000.0]);
        assert!(index.lookup(1001).is_none());
        assert!(index.get_chain("BANKNIFTY", expiry).is_none());
    }

    #[tokio::test]
    async fn test_refresh_keeps_snapshot_on_empty_fetch() {
        let index = OptionChainIndex::default();
        let count = index
            .refresh(&StaticCatalogSource::new(sample_records()))
            .await
            .unwrap();
        assert_eq!(count, 5);

        let result = index.refresh(&StaticCatalogSource::default()).await;
        assert_eq!(result, Err(CatalogError::Empty));
        assert_eq!(index.instrument_count(), 5);
    }

    #[test]
    fn test_chain_underlying_price() {
        let index = loaded_index();
        let chain = index
            .get_chain("NIFTY", datetime!(2025-12-30 0:00 +5:30))
            .unwrap();
        assert_eq!(chain.underlying_price(), None);
        chain.set_underlying_price(24_400.0);
        assert_eq!(chain.underlying_price(), Some(24_400.0));
    }
}
