//! Sliding-window rate limiting at the transport boundary.
//!
//! Two independent windows protect the server:
//!
//! - a process-global per-IP window over connection attempts, consulted
//!   before the websocket upgrade (reject with HTTP 429), and
//! - a per-socket window over inbound messages, consulted on every frame
//!   (silent drop, then close 1008 once the violation budget is exhausted).
//!
//! Both are sliding-window logs over timestamp vectors. A periodic sweep
//! evicts IP entries whose window has fully drained so the map does not grow
//! without bound.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::metrics::METRICS_ID_COLLAB_CONNECTIONS_REJECTED;

/// Process-global connection rate limiter, keyed by source IP.
#[derive(Clone)]
pub(crate) struct ConnectionRateLimiter {
    windows: Arc<Mutex<HashMap<IpAddr, Vec<Instant>>>>,
    limit: usize,
    window: Duration,
}

impl ConnectionRateLimiter {
    pub(crate) fn new(limit: usize, window: Duration) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            limit,
            window,
        }
    }

    /// Records a connection attempt from `ip` and decides whether it may
    /// proceed.
    pub(crate) fn check_connection(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let stamps = windows.entry(ip).or_default();
        stamps.retain(|stamp| now.duration_since(*stamp) < self.window);
        if stamps.len() >= self.limit {
            ::metrics::counter!(METRICS_ID_COLLAB_CONNECTIONS_REJECTED).increment(1);
            return false;
        }
        stamps.push(now);
        true
    }

    /// Evicts IP entries whose window has fully drained.
    pub(crate) fn sweep(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        windows.retain(|_, stamps| {
            stamps.retain(|stamp| now.duration_since(*stamp) < self.window);
            !stamps.is_empty()
        });
    }

    /// Spawns the periodic sweep task. Runs until the token is cancelled.
    pub(crate) fn spawn_sweeper(
        &self,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            // first tick triggers instantly
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    _ = interval.tick() => limiter.sweep(),
                }
            }
        })
    }
}

/// The outcome of admitting one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageVerdict {
    /// The message is within the window.
    Allowed,
    /// The message exceeds the window and is silently dropped.
    Dropped,
    /// The violation budget is exhausted; the socket must be closed.
    Exhausted,
}

/// Per-socket sliding window over inbound messages.
///
/// Owned by the socket's read loop; no locking involved.
pub(crate) struct MessageWindow {
    stamps: Vec<Instant>,
    violations: u32,
    limit: usize,
    window: Duration,
    max_violations: u32,
}

impl MessageWindow {
    pub(crate) fn new(limit: usize, window: Duration, max_violations: u32) -> Self {
        Self {
            stamps: Vec::new(),
            violations: 0,
            limit,
            window,
            max_violations,
        }
    }

    /// Records one inbound message and decides its fate.
    pub(crate) fn admit(&mut self) -> MessageVerdict {
        self.admit_at(Instant::now())
    }

    fn admit_at(&mut self, now: Instant) -> MessageVerdict {
        self.stamps
            .retain(|stamp| now.duration_since(*stamp) < self.window);
        if self.stamps.len() < self.limit {
            self.stamps.push(now);
            return MessageVerdict::Allowed;
        }
        self.violations += 1;
        if self.violations >= self.max_violations {
            MessageVerdict::Exhausted
        } else {
            MessageVerdict::Dropped
        }
    }
}

/// Extracts the source IP: the first comma-separated value of the
/// forwarded-for header if present, else the peer address.
pub(crate) fn source_ip(
    headers: &http::HeaderMap,
    peer_addr: Option<std::net::SocketAddr>,
) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse().ok())
        .or(peer_addr.map(|addr| addr.ip()))
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_connection_limit() {
        let limiter = ConnectionRateLimiter::new(3, Duration::from_secs(60));
        let ip = IpAddr::from([10, 0, 0, 1]);
        for _ in 0..3 {
            assert!(limiter.check_connection(ip));
        }
        assert!(!limiter.check_connection(ip));
        // a different source is unaffected
        assert!(limiter.check_connection(IpAddr::from([10, 0, 0, 2])));
    }

    #[test]
    fn sweep_evicts_drained_windows() {
        let limiter = ConnectionRateLimiter::new(3, Duration::from_millis(0));
        let ip = IpAddr::from([10, 0, 0, 1]);
        assert!(limiter.check_connection(ip));
        limiter.sweep();
        assert!(limiter.windows.lock().is_empty());
    }

    #[test]
    fn message_window_drops_then_exhausts() {
        let mut window = MessageWindow::new(2, Duration::from_secs(1), 3);
        let now = Instant::now();
        assert_eq!(window.admit_at(now), MessageVerdict::Allowed);
        assert_eq!(window.admit_at(now), MessageVerdict::Allowed);
        assert_eq!(window.admit_at(now), MessageVerdict::Dropped);
        assert_eq!(window.admit_at(now), MessageVerdict::Dropped);
        assert_eq!(window.admit_at(now), MessageVerdict::Exhausted);
    }

    #[test]
    fn message_window_recovers_after_the_window_passes() {
        let mut window = MessageWindow::new(1, Duration::from_millis(10), 50);
        let start = Instant::now();
        assert_eq!(window.admit_at(start), MessageVerdict::Allowed);
        assert_eq!(window.admit_at(start), MessageVerdict::Dropped);
        let later = start + Duration::from_millis(20);
        assert_eq!(window.admit_at(later), MessageVerdict::Allowed);
    }

    #[test]
    fn forwarded_for_wins_over_the_peer_address() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        let peer = "192.168.1.1:443".parse().ok();
        assert_eq!(
            source_ip(&headers, peer),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            source_ip(&http::HeaderMap::new(), peer),
            "192.168.1.1".parse::<IpAddr>().unwrap()
        );
    }
}
