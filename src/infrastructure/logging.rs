//! Centralized file-based logging system
//!
//! Writes logs to files in logs/ directory, separated by subsystem:
//! - logs/main - all events, JSON
//! - logs/error - warnings and errors only
//! - logs/feed - upstream connection lifecycle
//! - logs/hub - downstream clients and fan-out
//! - logs/api - HTTP server
//! - logs/analytics - catalog refreshes and Greeks engine

use std::fs;
use std::io;
use std::path::Path;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

const FEED_TARGETS: &[&str] = &["feed"];
const HUB_TARGETS: &[&str] = &["hub"];
const API_TARGETS: &[&str] = &["api"];
const ANALYTICS_TARGETS: &[&str] = &["analytics", "catalog"];

/// Initialize centralized file logging
///
/// Creates logs/ directory and sets up file appenders for each subsystem.
/// The returned guards must be kept alive for the duration of the program.
pub fn init_logging() -> io::Result<Vec<WorkerGuard>> {
    let logs_dir = Path::new("logs");
    for log_type in ["main", "error", "feed", "hub", "api", "analytics"] {
        fs::create_dir_all(logs_dir.join(log_type))?;
    }

    let mut guards = Vec::new();

    let (main_appender, guard) = create_appender("logs/main", "main");
    guards.push(guard);
    let (error_appender, guard) = create_appender("logs/error", "error");
    guards.push(guard);
    let (feed_appender, guard) = create_appender("logs/feed", "feed");
    guards.push(guard);
    let (hub_appender, guard) = create_appender("logs/hub", "hub");
    guards.push(guard);
    let (api_appender, guard) = create_appender("logs/api", "api");
    guards.push(guard);
    let (analytics_appender, guard) = create_appender("logs/analytics", "analytics");
    guards.push(guard);

    let main_layer = tracing_subscriber::fmt::layer()
        .with_writer(main_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .json();

    let error_layer = tracing_subscriber::fmt::layer()
        .with_writer(error_appender)
        .with_ansi(false)
        .with_target(true)
        .with_level(true)
        .with_filter(tracing_subscriber::filter::LevelFilter::WARN);

    let feed_layer = tracing_subscriber::fmt::layer()
        .with_writer(feed_appender)
        .with_ansi(false)
        .with_target(true)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            routes_to(metadata.target(), FEED_TARGETS)
        }));

    let hub_layer = tracing_subscriber::fmt::layer()
        .with_writer(hub_appender)
        .with_ansi(false)
        .with_target(true)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            routes_to(metadata.target(), HUB_TARGETS)
        }));

    let api_layer = tracing_subscriber::fmt::layer()
        .with_writer(api_appender)
        .with_ansi(false)
        .with_target(true)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            routes_to(metadata.target(), API_TARGETS)
        }));

    let analytics_layer = tracing_subscriber::fmt::layer()
        .with_writer(analytics_appender)
        .with_ansi(false)
        .with_target(true)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            routes_to(metadata.target(), ANALYTICS_TARGETS)
        }));

    // Console layer for development
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(main_layer)
        .with(error_layer)
        .with(feed_layer)
        .with(hub_layer)
        .with(api_layer)
        .with(analytics_layer)
        .with(console_layer)
        .init();

    tracing::info!("Logging system initialized. Log files in logs/ directory");

    Ok(guards)
}

/// Create a daily rolling file appender
fn create_appender(dir: &str, name: &str) -> (NonBlocking, WorkerGuard) {
    let appender = RollingFileAppender::new(Rotation::DAILY, dir, name);
    tracing_appender::non_blocking(appender)
}

/// Whether an event target belongs to one of the given subsystems.
/// Matches the exact target or a `name::` prefix.
#[inline]
fn routes_to(target: &str, names: &[&str]) -> bool {
    names.iter().any(|name| {
        target == *name
            || target
                .strip_prefix(name)
                .is_some_and(|rest| rest.starts_with("::"))
    })
}
