//! Metrics collection for relay monitoring
//!
//! Lock-free metrics counters using atomic operations.
//! Collected in hot path, exported via API in cold path.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

use serde::Serialize;

/// Relay metrics collector
///
/// Thread-safe counters updated from the feed read loop and the hub.
/// Snapshots taken for API export.
pub struct MetricsCollector {
    /// Binary frames received from upstream (heartbeats included)
    frames: AtomicU64,
    /// Ticks decoded from those frames
    ticks: AtomicU64,
    /// Packets rejected by the codec
    malformed: AtomicU64,
    /// Reconnect attempts scheduled
    reconnects: AtomicU64,
    /// Upstream connection status
    connected: AtomicBool,
    /// Live downstream clients
    clients: AtomicU64,
    /// Frames displaced from the broadcast ring
    dropped_frames: AtomicU64,
    /// Clients disconnected for being too slow
    slow_clients: AtomicU64,
    /// Last frame timestamp (Unix millis)
    last_frame_time: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

/// Metrics snapshot for API export
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub frames: u64,
    pub ticks: u64,
    pub malformed_packets: u64,
    pub reconnects: u64,
    pub connected: bool,
    pub clients: u64,
    pub dropped_frames: u64,
    pub slow_clients: u64,
    pub tick_rate: f64, // ticks per second
    pub uptime_seconds: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            frames: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            clients: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            slow_clients: AtomicU64::new(0),
            last_frame_time: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record an upstream binary frame
    #[inline]
    pub fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        let now = unix_millis();
        self.last_frame_time.store(now, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn client_connected(&self) {
        self.clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        // Saturating: a stray double decrement must not wrap
        let _ = self
            .clients
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    #[inline]
    pub fn record_dropped_frames(&self, count: u64) {
        self.dropped_frames.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_slow_client(&self) {
        self.slow_clients.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let ticks = self.ticks.load(Ordering::Relaxed);
        let uptime = self.start_time.elapsed().as_secs();
        let rate = if uptime > 0 {
            ticks as f64 / uptime as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            ticks,
            malformed_packets: self.malformed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connected: self.is_connected(),
            clients: self.clients.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            slow_clients: self.slow_clients.load(Ordering::Relaxed),
            tick_rate: rate,
            uptime_seconds: uptime,
        }
    }

    /// Time since the last upstream frame in milliseconds, capped at 10000ms
    pub fn feed_lag_ms(&self) -> u64 {
        let last = self.last_frame_time.load(Ordering::Relaxed);
        if last == 0 {
            return 10000; // No frames yet
        }
        unix_millis().saturating_sub(last).min(10000)
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
