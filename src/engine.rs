//! Relay Engine
//!
//! Wires the upstream feed to the hub (raw frames), the price cache and the
//! option analytics (parsed ticks), and drives the configured subscriptions.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::catalog::{CatalogSource, HttpCatalogSource};
use crate::core::filter::{FilterCriteria, FilterError};
use crate::core::option_chain::OptionChainIndex;
use crate::hot_path::analytics::OptionAnalytics;
use crate::hot_path::calculator::GreeksCalculator;
use crate::hot_path::price_cache::PriceCache;
use crate::hub::{Hub, HubConfig, HubError};
use crate::infrastructure::api::{start_server, AppState};
use crate::infrastructure::config::{Config, SubscriptionSettings};
use crate::infrastructure::metrics::MetricsCollector;
use crate::ws::{batches, FeedClient, FeedError};
use crate::{RelayError, Result};

/// Tokens to subscribe for a set of filters: every matching option plus the
/// spot instrument of each named underlying. Sorted, deduplicated.
pub fn resolve_tokens(
    index: &OptionChainIndex,
    filters: &[FilterCriteria],
) -> std::result::Result<Vec<u32>, FilterError> {
    let mut tokens = BTreeSet::new();
    for criteria in filters {
        index.check_underlying(criteria)?;
        tokens.extend(index.filter_options(criteria)?);

        match index.underlying_token(criteria.underlying.trim()) {
            Some(spot) => {
                tokens.insert(spot);
            }
            None if !criteria.underlying.trim().is_empty() => {
                tracing::warn!(
                    target: "analytics",
                    underlying = %criteria.underlying,
                    "No spot instrument for underlying, Greeks will be skipped"
                );
            }
            None => {}
        }
    }
    Ok(tokens.into_iter().collect())
}

/// Subscribe `tokens` through the hub in batches, pausing between batches.
/// Returns the number of tokens newly subscribed upstream.
pub async fn subscribe_in_batches(
    hub: &Hub,
    tokens: &[u32],
    settings: &SubscriptionSettings,
) -> std::result::Result<usize, HubError> {
    let mut fresh = 0;
    for (i, batch) in batches(tokens, settings.batch_size).enumerate() {
        if i > 0 {
            tokio::time::sleep(settings.batch_delay()).await;
        }
        fresh += hub.subscribe_tokens(batch.to_vec()).await?.len();
    }
    Ok(fresh)
}

/// Main engine owning the relay components
pub struct RelayEngine {
    config: Config,
    metrics: Arc<MetricsCollector>,
    cache: Arc<PriceCache>,
    index: Arc<OptionChainIndex>,
    feed: Arc<FeedClient>,
    hub: Hub,
    cancel: CancellationToken,
}

impl RelayEngine {
    /// Build and wire every component. Must be called inside a tokio runtime.
    pub fn new(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        let chain_config = config
            .catalog
            .to_chain_config()
            .map_err(|e| RelayError::Config(e.to_string()))?;

        let metrics = Arc::new(MetricsCollector::new());
        let cache = Arc::new(PriceCache::new());
        let index = Arc::new(OptionChainIndex::new(chain_config));
        let analytics = config.analytics.enabled.then(|| {
            Arc::new(OptionAnalytics::new(
                index.clone(),
                cache.clone(),
                GreeksCalculator::new(config.analytics.risk_free_rate),
            ))
        });

        let cancel = CancellationToken::new();
        let hub_slot: Arc<OnceLock<Hub>> = Arc::new(OnceLock::new());

        let feed_config = config.feed.to_feed_config(config.subscription.batch_size);
        let mut feed = FeedClient::with_cancellation(feed_config, cancel.child_token());
        Self::wire_feed(&mut feed, &metrics, &cache, analytics, hub_slot.clone());
        let feed = Arc::new(feed);

        let hub = Hub::spawn(HubConfig::from(&config.hub), feed.clone(), metrics.clone());
        // Set before the feed can run, so no frame sees an empty slot
        let _ = hub_slot.set(hub.clone());

        Ok(Self {
            config,
            metrics,
            cache,
            index,
            feed,
            hub,
            cancel,
        })
    }

    fn wire_feed(
        feed: &mut FeedClient,
        metrics: &Arc<MetricsCollector>,
        cache: &Arc<PriceCache>,
        analytics: Option<Arc<OptionAnalytics>>,
        hub_slot: Arc<OnceLock<Hub>>,
    ) {
        {
            let metrics = metrics.clone();
            feed.on_binary_tick(move |frame| {
                metrics.record_frame();
                if let Some(hub) = hub_slot.get() {
                    hub.broadcast(frame.clone());
                }
            });
        }
        {
            let metrics = metrics.clone();
            let cache = cache.clone();
            feed.on_tick(move |tick| {
                metrics.record_tick();
                cache.update(*tick);
                if let Some(analytics) = &analytics {
                    analytics.on_tick(tick);
                }
            });
        }
        {
            let metrics = metrics.clone();
            feed.on_error(move |err| match err {
                FeedError::Codec(e) => {
                    metrics.record_malformed();
                    tracing::debug!(target: "feed", "Dropped packet: {}", e);
                }
                other => tracing::warn!(target: "feed", "Feed error: {}", other),
            });
        }
        {
            let metrics = metrics.clone();
            feed.on_connect(move || metrics.set_connected(true));
        }
        {
            let metrics = metrics.clone();
            feed.on_close(move |code, _| {
                metrics.set_connected(false);
                tracing::debug!(target: "feed", code, "Upstream closed");
            });
        }
        {
            let metrics = metrics.clone();
            feed.on_reconnect(move |_, _| {
                metrics.set_connected(false);
                metrics.record_reconnect();
            });
        }
        {
            let metrics = metrics.clone();
            feed.on_no_reconnect(move |attempt| {
                metrics.set_connected(false);
                tracing::error!(target: "feed", attempt, "Feed terminated, no further reconnects");
            });
        }
        feed.on_message(|text| tracing::debug!(target: "feed", "Upstream message: {}", text));
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    pub fn cache(&self) -> Arc<PriceCache> {
        self.cache.clone()
    }

    pub fn index(&self) -> Arc<OptionChainIndex> {
        self.index.clone()
    }

    pub fn feed(&self) -> Arc<FeedClient> {
        self.feed.clone()
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            hub: self.hub.clone(),
            cache: self.cache.clone(),
            index: self.index.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Load the catalog from `source` into the index
    pub async fn refresh_catalog<S: CatalogSource>(&self, source: &S) -> Result<usize> {
        Ok(self.index.refresh(source).await?)
    }

    /// Subscribe every configured underlying filter upstream
    pub async fn subscribe_configured(&self) -> Result<usize> {
        let tokens = resolve_tokens(&self.index, &self.config.underlyings)?;
        let fresh = subscribe_in_batches(&self.hub, &tokens, &self.config.subscription).await?;
        tracing::info!(
            target: "feed",
            "Configured subscriptions: {} tokens resolved, {} new",
            tokens.len(),
            fresh
        );
        Ok(fresh)
    }

    /// Stop the feed and background tasks
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run until Ctrl-C or feed termination
    pub async fn run(self) -> Result<()> {
        let source = HttpCatalogSource::new(
            self.config.catalog.url.clone(),
            self.config.feed.api_key.clone(),
            self.config.feed.access_token.clone(),
        );
        self.refresh_catalog(&source).await?;
        self.subscribe_configured().await?;

        let state = self.app_state();
        let api_config = self.config.api.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = start_server(state, &api_config).await {
                tracing::error!(target: "api", "API Server failed: {}", e);
            }
        });

        let refresh_every = Duration::from_secs(self.config.catalog.refresh_interval_secs);
        if !refresh_every.is_zero() {
            self.spawn_catalog_refresh(source, refresh_every);
        }

        let feed = self.feed.clone();
        let mut serving = tokio::spawn(async move { feed.serve().await });

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown requested");
                self.shutdown();
                let _ = (&mut serving).await;
            }
            _ = &mut serving => {
                tracing::warn!(target: "feed", "Feed terminated, shutting down");
                self.shutdown();
            }
        }

        server.abort();
        Ok(())
    }

    /// Periodically rebuild the catalog and subscribe any new tokens
    fn spawn_catalog_refresh(&self, source: HttpCatalogSource, every: Duration) {
        let index = self.index.clone();
        let hub = self.hub.clone();
        let filters = self.config.underlyings.clone();
        let settings = self.config.subscription.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
                if index.refresh(&source).await.is_err() {
                    // Logged by the index; previous snapshot still serves
                    continue;
                }
                match resolve_tokens(&index, &filters) {
                    Ok(tokens) => {
                        if let Err(e) = subscribe_in_batches(&hub, &tokens, &settings).await {
                            tracing::warn!(target: "catalog", "Resubscribe after refresh failed: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!(target: "catalog", "Filters no longer resolve: {}", e),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::StaticCatalogSource;
    use crate::core::instrument::OptionType;
    use crate::core::market_data::Tick;
    use crate::hot_path::codec::{encode_frame, encode_packet, split_frame};
    use crate::hub::{Connection, UpstreamSubscriber};
    use crate::test_utils::{option_record, spot_record};
    use futures_util::{SinkExt, StreamExt};
    use parking_lot::Mutex;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::{accept_async, tungstenite::protocol::Message};

    #[derive(Default)]
    struct RecordingUpstream {
        calls: Mutex<Vec<Vec<u32>>>,
    }

    impl UpstreamSubscriber for RecordingUpstream {
        fn subscribe_upstream(&self, tokens: &[u32]) -> std::result::Result<(), HubError> {
            self.calls.lock().push(tokens.to_vec());
            Ok(())
        }
    }

    fn loaded_index() -> OptionChainIndex {
        let index = OptionChainIndex::default();
        index.load(&[
            spot_record(256_265, "NIFTY 50"),
            option_record(1001, "NIFTY", 24_500.0, "CE", "2099-12-30"),
            option_record(1002, "NIFTY", 24_500.0, "PE", "2099-12-30"),
            option_record(2001, "BANKNIFTY", 52_000.0, "CE", "2099-12-30"),
        ]);
        index
    }

    #[test]
    fn test_resolve_tokens_adds_spot() {
        let index = loaded_index();
        let nifty = FilterCriteria::for_underlying("NIFTY");
        let tokens = resolve_tokens(&index, &[nifty.clone(), nifty]).unwrap();
        assert_eq!(tokens, vec![1001, 1002, 256_265]);

        let calls = FilterCriteria::for_underlying("NIFTY").with_option_type(OptionType::Ce);
        assert_eq!(resolve_tokens(&index, &[calls]).unwrap(), vec![1001, 256_265]);
    }

    #[test]
    fn test_resolve_tokens_without_spot() {
        let index = loaded_index();
        let bank = FilterCriteria::for_underlying("BANKNIFTY");
        assert_eq!(resolve_tokens(&index, &[bank]).unwrap(), vec![2001]);
    }

    #[test]
    fn test_resolve_unknown_underlying() {
        let index = loaded_index();
        let err = resolve_tokens(&index, &[FilterCriteria::for_underlying("SENSEX")]).unwrap_err();
        assert_eq!(err, FilterError::UnknownUnderlying("SENSEX".to_string()));
    }

    #[tokio::test]
    async fn test_subscribe_in_batches() {
        let upstream = Arc::new(RecordingUpstream::default());
        let hub = Hub::spawn(
            HubConfig::default(),
            upstream.clone(),
            Arc::new(MetricsCollector::new()),
        );
        let tokens: Vec<u32> = (1..=250).collect();
        let settings = SubscriptionSettings {
            batch_size: 100,
            batch_delay_ms: 1,
        };

        assert_eq!(subscribe_in_batches(&hub, &tokens, &settings).await.unwrap(), 250);
        let sizes: Vec<usize> = upstream.calls.lock().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![100, 100, 50]);

        // Second pass is a no-op upstream
        assert_eq!(subscribe_in_batches(&hub, &tokens, &settings).await.unwrap(), 0);
        assert_eq!(upstream.calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.catalog.utc_offset = "nowhere".to_string();
        assert!(matches!(RelayEngine::new(config), Err(RelayError::Config(_))));
    }

    #[tokio::test]
    async fn test_feed_frames_reach_cache_and_clients() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let a = encode_packet(&Tick::ltp(256_265, 24_400.0));
        let b = encode_packet(&Tick::ltp(1001, 120.0));
        let frame = encode_frame([a.as_slice(), b.as_slice()]);

        let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let _ = go_rx.await;
            ws.send(Message::binary(frame)).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let mut config = Config::default();
        config.feed.url = format!("ws://{}", addr);
        config.feed.data_timeout_secs = 30;
        config.underlyings = vec![FilterCriteria::for_underlying("NIFTY")];
        let engine = RelayEngine::new(config).unwrap();

        let source = StaticCatalogSource::new(vec![
            spot_record(256_265, "NIFTY 50"),
            option_record(1001, "NIFTY", 24_500.0, "CE", "2099-12-30"),
        ]);
        assert_eq!(engine.refresh_catalog(&source).await.unwrap(), 1);
        assert_eq!(engine.subscribe_configured().await.unwrap(), 2);
        assert_eq!(engine.feed().subscribed_tokens(), vec![1001, 256_265]);

        let (client, mut client_rx) = Connection::new(8);
        client.subscribe(&[1001]);
        engine.hub().register(client).await.unwrap();

        let feed = engine.feed();
        let serving = tokio::spawn(async move { feed.serve().await });
        let _ = go_tx.send(());

        let wait = Duration::from_secs(5);
        let got = timeout(wait, client_rx.recv()).await.unwrap().unwrap();
        let packets = split_frame(&got);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0], b.as_slice());

        let cache = engine.cache();
        timeout(wait, async {
            while cache.last_price(1001).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(cache.last_price(256_265), Some(24_400.0));

        let snapshot = engine.metrics().snapshot();
        assert_eq!(snapshot.frames, 1);
        assert_eq!(snapshot.ticks, 2);
        assert!(snapshot.connected);

        engine.shutdown();
        timeout(wait, serving).await.unwrap().unwrap();
    }
}
