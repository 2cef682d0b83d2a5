//! Sliding-window limit on connection attempts per source IP.
//!
//! Unlike the connection limiter this counts every attempt, including
//! rejected ones, so sources generating rejections keep burning quota.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;

#[derive(Debug, Default)]
struct AttemptEntry {
    timestamps: VecDeque<Instant>,
}

impl AttemptEntry {
    fn expire(&mut self, now: Instant, window: Duration) {
        let Some(cutoff) = now.checked_sub(window) else {
            return;
        };
        while let Some(&oldest) = self.timestamps.front() {
            if oldest > cutoff {
                break;
            }
            self.timestamps.pop_front();
        }
    }
}

#[derive(Debug)]
struct Shared {
    max_per_ip: usize,
    window: Duration,
    entries: RwLock<HashMap<IpAddr, Arc<Mutex<AttemptEntry>>>>,
}

impl Shared {
    fn entry(&self, ip: IpAddr) -> Arc<Mutex<AttemptEntry>> {
        if let Some(entry) = self.entries.read().unwrap().get(&ip) {
            return Arc::clone(entry);
        }
        let mut map = self.entries.write().unwrap();
        Arc::clone(map.entry(ip).or_default())
    }

    fn reclaim(&self, now: Instant) {
        let horizon = self.window * 2;
        let mut map = self.entries.write().unwrap();
        map.retain(|_, entry| {
            let entry = entry.lock().unwrap();
            match entry.timestamps.back() {
                Some(&newest) => now.duration_since(newest) <= horizon,
                None => false,
            }
        });
    }
}

/// Limits connection attempts per IP over a sliding window.
///
/// Must be created inside a tokio runtime; construction spawns the
/// background reclamation task.
#[derive(Debug)]
pub struct AttemptLimiter {
    shared: Arc<Shared>,
    stop: watch::Sender<bool>,
}

impl AttemptLimiter {
    /// Create a limiter allowing `max_per_ip` attempts per `window`.
    #[must_use]
    pub fn new(max_per_ip: usize, window: Duration) -> Self {
        let shared = Arc::new(Shared {
            max_per_ip,
            window,
            entries: RwLock::new(HashMap::new()),
        });

        let (stop, mut stop_rx) = watch::channel(false);
        let reclaim = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(window) => reclaim.reclaim(Instant::now()),
                    _ = stop_rx.changed() => break,
                }
            }
        });

        Self { shared, stop }
    }

    /// Record an attempt from `ip` and return whether it was within the
    /// limit. The attempt is recorded either way.
    pub fn record_attempt(&self, ip: IpAddr) -> bool {
        let entry = self.shared.entry(ip);
        let mut entry = entry.lock().unwrap();

        let now = Instant::now();
        entry.expire(now, self.shared.window);

        let allowed = entry.timestamps.len() < self.shared.max_per_ip;
        entry.timestamps.push_back(now);
        allowed
    }

    /// Number of IPs currently tracked.
    #[must_use]
    pub fn tracked_ips(&self) -> usize {
        self.shared.entries.read().unwrap().len()
    }

    /// Stop the background reclamation task.
    pub fn close(&self) {
        let _ = self.stop.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_allows_up_to_limit() {
        let limiter = AttemptLimiter::new(3, Duration::from_secs(60));
        let addr = ip("10.0.0.1");

        assert!(limiter.record_attempt(addr));
        assert!(limiter.record_attempt(addr));
        assert!(limiter.record_attempt(addr));
        assert!(!limiter.record_attempt(addr));
    }

    #[tokio::test]
    async fn test_rejected_attempts_keep_burning_quota() {
        let limiter = AttemptLimiter::new(1, Duration::from_millis(200));
        let addr = ip("10.0.0.1");

        assert!(limiter.record_attempt(addr));
        // Each rejection is itself recorded, so the window never drains
        // while the source keeps hammering.
        for _ in 0..5 {
            assert!(!limiter.record_attempt(addr));
        }
    }

    #[tokio::test]
    async fn test_window_expiry() {
        let limiter = AttemptLimiter::new(1, Duration::from_millis(50));
        let addr = ip("10.0.0.1");

        assert!(limiter.record_attempt(addr));
        assert!(!limiter.record_attempt(addr));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.record_attempt(addr));
    }

    #[tokio::test]
    async fn test_reclaimer_drops_idle_records() {
        let limiter = AttemptLimiter::new(4, Duration::from_millis(40));

        limiter.record_attempt(ip("10.0.0.1"));
        assert_eq!(limiter.tracked_ips(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(limiter.tracked_ips(), 0);

        limiter.close();
    }
}
