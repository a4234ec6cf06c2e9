//! Configuration management for the relay
//!
//! Loads configuration from config.toml at startup.
//! All values are configurable to avoid hardcoded constants.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::UtcOffset;

use crate::core::catalog::DEFAULT_CATALOG_URL;
use crate::core::filter::FilterCriteria;
use crate::core::option_chain::ChainIndexConfig;
use crate::hub::HubConfig;
use crate::ws::{FeedConfig, ReconnectPolicy};

/// Relay configuration
///
/// Loaded from config.toml at startup. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// HTTP / downstream websocket server
    #[serde(default)]
    pub api: ApiConfig,

    /// Upstream feed connection
    #[serde(default)]
    pub feed: FeedSettings,

    /// Fan-out hub sizing
    #[serde(default)]
    pub hub: HubSettings,

    /// Instrument catalog source and chain index
    #[serde(default)]
    pub catalog: CatalogSettings,

    #[serde(default)]
    pub analytics: AnalyticsSettings,

    /// Batching of configured subscriptions
    #[serde(default)]
    pub subscription: SubscriptionSettings,

    /// Option universes to subscribe at startup
    #[serde(default)]
    pub underlyings: Vec<FilterCriteria>,
}

/// API server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,

    /// Port for HTTP API server
    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// Upstream feed configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedSettings {
    #[serde(default = "default_feed_url")]
    pub url: String,

    #[serde(default)]
    pub api_key: String,

    /// Sent as a query parameter, never logged
    #[serde(default, skip_serializing)]
    pub access_token: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_reconnect_max_retries")]
    pub reconnect_max_retries: u32,

    #[serde(default = "default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: u64,

    #[serde(default = "default_data_timeout_secs")]
    pub data_timeout_secs: u64,

    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

/// Fan-out hub configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HubSettings {
    /// Pending broadcast frames before the oldest is dropped
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    #[serde(default = "default_control_capacity")]
    pub control_capacity: usize,

    /// Per-client outbound queue; overflow disconnects the client
    #[serde(default = "default_client_queue_capacity")]
    pub client_queue_capacity: usize,

    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

/// Catalog configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogSettings {
    #[serde(default = "default_catalog_url")]
    pub url: String,

    /// Periodic refresh, 0 = load once at startup
    #[serde(default)]
    pub refresh_interval_secs: u64,

    /// Canonical exchange timezone, `+HH:MM`
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,

    #[serde(default = "default_spot_exchange")]
    pub spot_exchange: String,

    /// Underlying name -> spot tradingsymbol, merged over the built-in aliases
    #[serde(default)]
    pub underlying_aliases: HashMap<String, String>,

    /// Underlying name -> spot token, takes precedence over aliases
    #[serde(default)]
    pub underlying_tokens: HashMap<String, u32>,
}

/// Greeks engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalyticsSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Annual rate; 0 selects the built-in default
    #[serde(default)]
    pub risk_free_rate: f64,
}

/// Subscription batching
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            api_key: String::new(),
            access_token: String::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            reconnect_max_retries: default_reconnect_max_retries(),
            reconnect_max_delay_secs: default_reconnect_max_delay_secs(),
            data_timeout_secs: default_data_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
            auto_reconnect: true,
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            broadcast_capacity: default_broadcast_capacity(),
            control_capacity: default_control_capacity(),
            client_queue_capacity: default_client_queue_capacity(),
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            url: default_catalog_url(),
            refresh_interval_secs: 0,
            utc_offset: default_utc_offset(),
            spot_exchange: default_spot_exchange(),
            underlying_aliases: HashMap::new(),
            underlying_tokens: HashMap::new(),
        }
    }
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            risk_free_rate: 0.0,
        }
    }
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
        }
    }
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    5000
}

fn default_feed_url() -> String {
    "wss://ws.kite.trade".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    7
}

fn default_reconnect_max_retries() -> u32 {
    300
}

fn default_reconnect_max_delay_secs() -> u64 {
    60
}

fn default_data_timeout_secs() -> u64 {
    5
}

fn default_check_interval_secs() -> u64 {
    2
}

fn default_true() -> bool {
    true
}

fn default_broadcast_capacity() -> usize {
    1024
}

fn default_control_capacity() -> usize {
    256
}

fn default_client_queue_capacity() -> usize {
    256
}

fn default_write_timeout_secs() -> u64 {
    5
}

fn default_catalog_url() -> String {
    DEFAULT_CATALOG_URL.to_string()
}

fn default_utc_offset() -> String {
    "+05:30".to_string()
}

fn default_spot_exchange() -> String {
    "NSE".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_delay_ms() -> u64 {
    100
}

impl Config {
    /// Load configuration from config.toml file
    ///
    /// If the file doesn't exist, returns default configuration.
    /// # Errors
    /// Returns error if file exists but cannot be parsed or fails validation.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => Self::from_toml(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File not found - use defaults
                Ok(Config::default())
            }
            Err(e) => Err(ConfigError::IoError(e)),
        }
    }

    /// Parse and validate TOML contents
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the relay cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        for criteria in &self.underlyings {
            criteria
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        self.catalog.offset()?;
        if self.subscription.batch_size == 0 {
            return Err(ConfigError::Invalid("subscription.batch_size must be > 0".into()));
        }
        let periods = [
            ("feed.connect_timeout_secs", self.feed.connect_timeout_secs),
            ("feed.data_timeout_secs", self.feed.data_timeout_secs),
            ("feed.check_interval_secs", self.feed.check_interval_secs),
        ];
        if let Some((field, _)) = periods.into_iter().find(|&(_, secs)| secs == 0) {
            return Err(ConfigError::ZeroDuration(field));
        }
        Ok(())
    }
}

impl FeedSettings {
    pub fn to_feed_config(&self, batch_size: usize) -> FeedConfig {
        FeedConfig {
            url: self.url.clone(),
            api_key: self.api_key.clone(),
            access_token: self.access_token.clone(),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            reconnect: ReconnectPolicy {
                max_retries: self.reconnect_max_retries,
                max_delay: Duration::from_secs(self.reconnect_max_delay_secs),
            },
            auto_reconnect: self.auto_reconnect,
            data_timeout: Duration::from_secs(self.data_timeout_secs),
            check_interval: Duration::from_secs(self.check_interval_secs),
            batch_size,
        }
    }
}

impl From<&HubSettings> for HubConfig {
    fn from(settings: &HubSettings) -> Self {
        HubConfig {
            broadcast_capacity: settings.broadcast_capacity,
            control_capacity: settings.control_capacity,
            client_queue_capacity: settings.client_queue_capacity,
            write_timeout: Duration::from_secs(settings.write_timeout_secs),
        }
    }
}

impl CatalogSettings {
    /// Parsed exchange timezone
    pub fn offset(&self) -> Result<UtcOffset, ConfigError> {
        let format = format_description!("[offset_hour sign:mandatory]:[offset_minute]");
        UtcOffset::parse(&self.utc_offset, &format).map_err(|e| {
            ConfigError::Invalid(format!("catalog.utc_offset {:?}: {}", self.utc_offset, e))
        })
    }

    pub fn to_chain_config(&self) -> Result<ChainIndexConfig, ConfigError> {
        let mut config = ChainIndexConfig {
            offset: self.offset()?,
            spot_exchange: self.spot_exchange.clone(),
            ..Default::default()
        };
        config
            .underlying_aliases
            .extend(self.underlying_aliases.iter().map(|(k, v)| (k.clone(), v.clone())));
        config
            .underlying_tokens
            .extend(self.underlying_tokens.iter().map(|(k, v)| (k.clone(), *v)));
        Ok(config)
    }
}

impl SubscriptionSettings {
    #[inline(always)]
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading file
    IoError(std::io::Error),
    /// Parse error (invalid TOML)
    ParseError(String),
    /// Parsed but unusable
    Invalid(String),
    /// A timeout or period that must be positive is zero
    ZeroDuration(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::ParseError(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid config: {}", e),
            ConfigError::ZeroDuration(field) => write!(f, "Invalid config: {} must be > 0", field),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(e) => Some(e),
            ConfigError::ParseError(_) | ConfigError::Invalid(_) | ConfigError::ZeroDuration(_) => None,
        }
    }
}
