//! Feed liveness watchdog
//!
//! The read loop records every inbound message (data, ping, pong, text).
//! The watchdog checks at a fixed interval and flags the session stale when
//! nothing arrived within the data timeout. Runs alongside the read loop,
//! never blocks it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::time::interval;
use tokio_util::sync::CancellationToken;

/// Floor for the watchdog period; `interval` rejects zero
const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Inbound-activity tracker for one feed session
pub struct LivenessMonitor {
    /// Session start, reference point for `last_seen`
    started: Instant,
    /// Millis since `started` of the last inbound message
    last_seen: AtomicU64,
    data_timeout: Duration,
}

impl LivenessMonitor {
    pub fn new(data_timeout: Duration) -> Self {
        Self {
            started: Instant::now(),
            last_seen: AtomicU64::new(0),
            data_timeout,
        }
    }

    /// Record inbound activity
    #[inline]
    pub fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_seen.store(now, Ordering::Relaxed);
    }

    /// Time since the last inbound message (or session start)
    #[inline]
    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    #[inline]
    pub fn is_stale(&self) -> bool {
        self.idle() > self.data_timeout
    }

    pub fn data_timeout(&self) -> Duration {
        self.data_timeout
    }

    /// Check every `check_interval` until stale or cancelled.
    ///
    /// Returns true when the session went stale. On staleness the session
    /// token is cancelled so the read loop exits too.
    pub async fn watch(&self, check_interval: Duration, session: &CancellationToken) -> bool {
        let mut ticker = interval(check_interval.max(MIN_CHECK_INTERVAL));
        loop {
            tokio::select! {
                _ = session.cancelled() => return false,
                _ = ticker.tick() => {
                    if self.is_stale() {
                        session.cancel();
                        return true;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_monitor_not_stale() {
        let monitor = LivenessMonitor::new(Duration::from_secs(5));
        assert!(!monitor.is_stale());
        assert!(monitor.idle() < Duration::from_secs(1));
    }

    #[test]
    fn test_touch_resets_idle() {
        let monitor = LivenessMonitor::new(Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(40));
        assert!(monitor.is_stale());

        monitor.touch();
        assert!(!monitor.is_stale());
    }

    #[tokio::test]
    async fn test_watch_flags_stale_and_cancels() {
        let monitor = LivenessMonitor::new(Duration::from_millis(30));
        let session = CancellationToken::new();

        let stale = monitor.watch(Duration::from_millis(10), &session).await;
        assert!(stale);
        assert!(session.is_cancelled());
    }

    #[tokio::test]
    async fn test_watch_zero_interval_still_ticks() {
        let monitor = LivenessMonitor::new(Duration::from_millis(20));
        let session = CancellationToken::new();

        let stale = tokio::time::timeout(
            Duration::from_secs(2),
            monitor.watch(Duration::ZERO, &session),
        )
        .await
        .unwrap();
        assert!(stale);
    }

    #[tokio::test]
    async fn test_watch_stops_on_cancel() {
        let monitor = LivenessMonitor::new(Duration::from_secs(60));
        let session = CancellationToken::new();
        session.cancel();

        assert!(!monitor.watch(Duration::from_millis(10), &session).await);
    }
}
