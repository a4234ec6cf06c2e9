//! API Server (Cold Path)
//!
//! Accepts downstream websocket clients on `/ws` and serves read-only views
//! of the price cache and relay stats.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::core::market_data::{DepthItem, Tick};
use crate::core::option_chain::OptionChainIndex;
use crate::hot_path::price_cache::PriceCache;
use crate::hub::{serve_socket, Hub};
use crate::infrastructure::config::ApiConfig;
use crate::infrastructure::metrics::{MetricsCollector, MetricsSnapshot};
use crate::RelayError;

/// Last traded price DTO
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LtpDto {
    pub token: u32,
    pub last_price: f64,
}

#[derive(Debug, Serialize)]
pub struct OhlcDto {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

#[derive(Debug, Serialize)]
pub struct DepthLevelDto {
    pub price: f64,
    pub quantity: u32,
    pub orders: u16,
}

/// Full quote DTO
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteDto {
    pub token: u32,
    pub tradable: bool,
    pub last_price: f64,
    pub last_quantity: u32,
    pub average_price: f64,
    pub volume: u32,
    pub buy_quantity: u32,
    pub sell_quantity: u32,
    pub ohlc: OhlcDto,
    pub net_change: f64,
    pub oi: u32,
    pub last_trade_time: Option<i64>,
    pub timestamp: Option<i64>,
    pub bids: Vec<DepthLevelDto>,
    pub asks: Vec<DepthLevelDto>,
}

/// Relay stats DTO
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsDto {
    pub metrics: MetricsSnapshot,
    pub feed_lag_ms: u64,
    pub hub_connections: usize,
    pub upstream_tokens: usize,
    pub cached_instruments: usize,
    pub catalog_instruments: usize,
    pub underlyings: Vec<String>,
}

fn depth_levels(levels: &[DepthItem]) -> Vec<DepthLevelDto> {
    levels
        .iter()
        .filter(|l| l.quantity > 0)
        .map(|l| DepthLevelDto {
            price: l.price,
            quantity: l.quantity,
            orders: l.orders,
        })
        .collect()
}

impl From<Tick> for QuoteDto {
    fn from(tick: Tick) -> Self {
        Self {
            token: tick.token,
            tradable: tick.tradable,
            last_price: tick.last_price,
            last_quantity: tick.last_quantity,
            average_price: tick.average_price,
            volume: tick.volume,
            buy_quantity: tick.total_buy_quantity,
            sell_quantity: tick.total_sell_quantity,
            ohlc: OhlcDto {
                open: tick.ohlc.open,
                high: tick.ohlc.high,
                low: tick.ohlc.low,
                close: tick.ohlc.close,
            },
            net_change: tick.net_change,
            oi: tick.oi,
            last_trade_time: tick.last_trade_time,
            timestamp: tick.timestamp,
            bids: depth_levels(&tick.depth.buy),
            asks: depth_levels(&tick.depth.sell),
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub cache: Arc<PriceCache>,
    pub index: Arc<OptionChainIndex>,
    pub metrics: Arc<MetricsCollector>,
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/quote/:token", get(get_quote))
        .route("/ltp/:token", get(get_ltp))
        .route("/api/stats", get(get_stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the API server
pub async fn start_server(state: AppState, config: &ApiConfig) -> Result<(), RelayError> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| RelayError::Config(format!("Invalid API address: {}", e)))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(target: "api", "API Server listening on {}", addr);

    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| serve_socket(socket, hub))
}

/// Handler for /quote/:token
async fn get_quote(
    Path(token): Path<u32>,
    State(state): State<AppState>,
) -> Result<Json<QuoteDto>, StatusCode> {
    state
        .cache
        .get(token)
        .map(|tick| Json(QuoteDto::from(tick)))
        .ok_or(StatusCode::NOT_FOUND)
}

/// Handler for /ltp/:token
async fn get_ltp(
    Path(token): Path<u32>,
    State(state): State<AppState>,
) -> Result<Json<LtpDto>, StatusCode> {
    state
        .cache
        .last_price(token)
        .map(|last_price| Json(LtpDto { token, last_price }))
        .ok_or(StatusCode::NOT_FOUND)
}

/// Handler for /api/stats
async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsDto>, StatusCode> {
    let hub_stats = state.hub.stats().await.map_err(|e| {
        tracing::error!(target: "api", "Hub stats unavailable: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(Json(StatsDto {
        metrics: state.metrics.snapshot(),
        feed_lag_ms: state.metrics.feed_lag_ms(),
        hub_connections: hub_stats.connections,
        upstream_tokens: hub_stats.upstream_tokens.len(),
        cached_instruments: state.cache.len(),
        catalog_instruments: state.index.instrument_count(),
        underlyings: state.index.underlyings(),
    }))
}
