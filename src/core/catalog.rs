//! Instrument catalog sources (Cold Path)
//!
//! Fetches the full instrument universe from the broker's CSV dump.
//! Called at startup and on periodic refresh - NOT in hot path.

use std::future::Future;
use std::time::Duration;

use crate::core::instrument::RawInstrument;

/// Default broker instrument dump endpoint
pub const DEFAULT_CATALOG_URL: &str = "https://api.kite.trade/instruments";

/// Source of raw instrument records
pub trait CatalogSource: Send + Sync {
    /// Fetch every instrument the broker knows about
    fn fetch_all_instruments(
        &self,
    ) -> impl Future<Output = Result<Vec<RawInstrument>, CatalogError>> + Send;
}

/// Catalog source backed by the broker's HTTP CSV dump
pub struct HttpCatalogSource {
    client: reqwest::Client,
    url: String,
    api_key: String,
    access_token: String,
}

impl HttpCatalogSource {
    /// Create new catalog client
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .user_agent("tick-relay/0.1")
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            url: url.into(),
            api_key: api_key.into(),
            access_token: access_token.into(),
        }
    }

    /// Endpoint this source reads from
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl CatalogSource for HttpCatalogSource {
    /// API: GET {url}
    /// Returns the gzip-transparent CSV dump of every listed instrument
    async fn fetch_all_instruments(&self) -> Result<Vec<RawInstrument>, CatalogError> {
        tracing::info!(target: "catalog", "Fetching instrument dump from {}", self.url);

        let mut request = self.client.get(&self.url).header("X-Kite-Version", "3");
        if !self.api_key.is_empty() && !self.access_token.is_empty() {
            request = request.header(
                "Authorization",
                format!("token {}:{}", self.api_key, self.access_token),
            );
        }

        let response = request
            .send()
            .await
            .map_err(|e| CatalogError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CatalogError::Http(response.status().as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| CatalogError::Network(e.to_string()))?;

        let records = parse_instrument_csv(&body)?;
        tracing::info!(target: "catalog", "Received {} instruments", records.len());
        Ok(records)
    }
}

/// In-memory catalog source for tests and offline runs
#[derive(Debug, Clone, Default)]
pub struct StaticCatalogSource {
    records: Vec<RawInstrument>,
}

impl StaticCatalogSource {
    pub fn new(records: Vec<RawInstrument>) -> Self {
        Self { records }
    }
}

impl CatalogSource for StaticCatalogSource {
    async fn fetch_all_instruments(&self) -> Result<Vec<RawInstrument>, CatalogError> {
        Ok(self.records.clone())
    }
}

/// Parse the broker's CSV instrument dump
///
/// Rows that fail to deserialize are skipped and counted; a dump with a
/// header but no valid rows is `CatalogError::Empty`.
pub fn parse_instrument_csv(data: &[u8]) -> Result<Vec<RawInstrument>, CatalogError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(data);

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for row in reader.deserialize::<RawInstrument>() {
        match row {
            Ok(record) => records.push(record),
            Err(e) => {
                if e.is_io_error() {
                    return Err(CatalogError::Parse(e.to_string()));
                }
                skipped += 1;
            }
        }
    }

    if skipped > 0 {
        tracing::warn!(target: "catalog", "Skipped {} malformed catalog rows", skipped);
    }
    if records.is_empty() {
        return Err(CatalogError::Empty);
    }
    Ok(records)
}

/// Catalog fetch errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CatalogError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error: {0}")]
    Http(u16),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Catalog is empty")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "\
instrument_token,exchange_token,tradingsymbol,name,last_price,expiry,strike,tick_size,lot_size,instrument_type,segment,exchange
256265,1001,NIFTY 50,NIFTY 50,0,,0,0,0,EQ,INDICES,NSE
12345678,48225,NIFTY25DEC24500CE,NIFTY,0,2025-12-30,24500,0.05,75,CE,NFO-OPT,NFO
12345679,48226,NIFTY25DEC24500PE,NIFTY,0,2025-12-30,24500,0.05,75,PE,NFO-OPT,NFO
";

    #[test]
    fn test_parse_instrument_csv() {
        let records = parse_instrument_csv(DUMP.as_bytes()).unwrap();
        assert_eq!(records.len(), 3);

        assert_eq!(records[0].instrument_token, 256_265);
        assert_eq!(records[0].expiry, "");
        assert_eq!(records[0].instrument_type, "EQ");

        assert_eq!(records[1].tradingsymbol, "NIFTY25DEC24500CE");
        assert_eq!(records[1].strike, 24_500.0);
        assert_eq!(records[1].lot_size, 75);
        assert_eq!(records[2].instrument_type, "PE");
    }

    #[test]
    fn test_parse_skips_bad_rows() {
        let dump = format!("{}not-a-token,1,X,X,0,,0,0,0,EQ,NSE,NSE\n", DUMP);
        let records = parse_instrument_csv(dump.as_bytes()).unwrap();
        assert_eq!(records.len(), 3);
    }

    #[test]
    fn test_parse_header_only_is_empty() {
        let header = DUMP.lines().next().unwrap();
        assert!(matches!(
            parse_instrument_csv(header.as_bytes()),
            Err(CatalogError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_static_source() {
        let records = parse_instrument_csv(DUMP.as_bytes()).unwrap();
        let source = StaticCatalogSource::new(records);
        let fetched = source.fetch_all_instruments().await.unwrap();
        assert_eq!(fetched.len(), 3);
    }

    #[test]
    fn test_catalog_error_display() {
        assert_eq!(CatalogError::Http(503).to_string(), "HTTP error: 503");
        assert_eq!(CatalogError::Empty.to_string(), "Catalog is empty");
    }
}
