//! Sliding-window bandwidth accounting per source IP.
//!
//! Each IP owns an ordered list of `(bytes, timestamp)` consumption entries;
//! the sum of entries younger than the window is the current usage. When an
//! operation would push usage over the ceiling the configured
//! [`LimitAction`] decides what happens: `drop` denies without recording,
//! `log_only` records and allows, and `throttle` admits only operations no
//! larger than the configured throttle minimum.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::config::LimitAction;

#[derive(Debug, Clone, Copy)]
struct Consumption {
    bytes: u64,
    at: Instant,
}

#[derive(Debug, Default)]
struct Bucket {
    entries: VecDeque<Consumption>,
}

impl Bucket {
    /// Drop entries older than one window and return the remaining usage.
    fn expire_and_sum(&mut self, now: Instant, window: Duration) -> u64 {
        if let Some(cutoff) = now.checked_sub(window) {
            while let Some(&oldest) = self.entries.front() {
                if oldest.at > cutoff {
                    break;
                }
                self.entries.pop_front();
            }
        }
        self.entries.iter().map(|entry| entry.bytes).sum()
    }

    /// Usage within the window without mutating the bucket.
    fn usage(&self, now: Instant, window: Duration) -> u64 {
        let cutoff = now.checked_sub(window);
        self.entries
            .iter()
            .filter(|entry| cutoff.map_or(true, |cutoff| entry.at > cutoff))
            .map(|entry| entry.bytes)
            .sum()
    }
}

#[derive(Debug)]
struct Shared {
    max_per_ip: u64,
    throttle_minimum: u64,
    window: Duration,
    action: LimitAction,
    buckets: RwLock<HashMap<IpAddr, Arc<Mutex<Bucket>>>>,
}

impl Shared {
    fn bucket(&self, ip: IpAddr) -> Arc<Mutex<Bucket>> {
        if let Some(bucket) = self.buckets.read().unwrap().get(&ip) {
            return Arc::clone(bucket);
        }
        let mut map = self.buckets.write().unwrap();
        Arc::clone(map.entry(ip).or_default())
    }

    fn reclaim(&self, now: Instant) {
        let horizon = self.window * 2;
        let mut map = self.buckets.write().unwrap();
        map.retain(|_, bucket| {
            let bucket = bucket.lock().unwrap();
            match bucket.entries.back() {
                Some(&newest) => now.duration_since(newest.at) <= horizon,
                None => false,
            }
        });
    }
}

/// Limits bytes per IP over a sliding window with a configurable
/// enforcement mode.
///
/// Must be created inside a tokio runtime; construction spawns the
/// background reclamation task.
#[derive(Debug)]
pub struct BandwidthLimiter {
    shared: Arc<Shared>,
    stop: watch::Sender<bool>,
}

impl BandwidthLimiter {
    /// Create a limiter allowing `max_per_ip` bytes per `window`.
    #[must_use]
    pub fn new(
        max_per_ip: u64,
        window: Duration,
        action: LimitAction,
        throttle_minimum: u64,
    ) -> Self {
        let shared = Arc::new(Shared {
            max_per_ip,
            throttle_minimum,
            window,
            action,
            buckets: RwLock::new(HashMap::new()),
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

    /// Account `bytes` for `ip` and return whether the transfer may
    /// proceed under the configured action.
    pub fn allow(&self, ip: IpAddr, bytes: u64) -> bool {
        if bytes == 0 {
            return true;
        }

        let bucket = self.shared.bucket(ip);
        let mut bucket = bucket.lock().unwrap();

        let now = Instant::now();
        let usage = bucket.expire_and_sum(now, self.shared.window);

        if usage + bytes > self.shared.max_per_ip {
            match self.shared.action {
                LimitAction::LogOnly => {
                    bucket.entries.push_back(Consumption { bytes, at: now });
                    return true;
                }
                LimitAction::Throttle => {
                    if self.shared.throttle_minimum > 0 && bytes <= self.shared.throttle_minimum {
                        bucket.entries.push_back(Consumption { bytes, at: now });
                        return true;
                    }
                    return false;
                }
                // Dropped bytes never count against quota.
                LimitAction::Drop => return false,
            }
        }

        bucket.entries.push_back(Consumption { bytes, at: now });
        true
    }

    /// Whether accounting `bytes` for `ip` would exceed the ceiling.
    /// Does not mutate any state; used by the pipelines to emit violation
    /// logs in every mode.
    #[must_use]
    pub fn is_over_limit(&self, ip: IpAddr, bytes: u64) -> bool {
        if bytes == 0 {
            return false;
        }

        let bucket = self.shared.buckets.read().unwrap().get(&ip).cloned();
        let Some(bucket) = bucket else { return false };

        let bucket = bucket.lock().unwrap();
        let usage = bucket.usage(Instant::now(), self.shared.window);
        usage + bytes > self.shared.max_per_ip
    }

    /// Number of IPs currently tracked.
    #[must_use]
    pub fn tracked_ips(&self) -> usize {
        self.shared.buckets.read().unwrap().len()
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

    fn limiter(max: u64, action: LimitAction, throttle_min: u64) -> BandwidthLimiter {
        BandwidthLimiter::new(max, Duration::from_secs(60), action, throttle_min)
    }

    #[tokio::test]
    async fn test_drop_mode_enforces_ceiling() {
        let limiter = limiter(1024, LimitAction::Drop, 0);
        let addr = ip("10.0.0.1");

        assert!(limiter.allow(addr, 512));
        assert!(limiter.allow(addr, 512));
        assert!(!limiter.allow(addr, 1));
    }

    #[tokio::test]
    async fn test_dropped_bytes_do_not_count() {
        let limiter = limiter(1024, LimitAction::Drop, 0);
        let addr = ip("10.0.0.1");

        assert!(limiter.allow(addr, 1000));
        // Denied transfers leave the recorded usage untouched, so a
        // smaller transfer still fits.
        assert!(!limiter.allow(addr, 100));
        assert!(limiter.allow(addr, 24));
    }

    #[tokio::test]
    async fn test_log_only_mode_always_allows() {
        let limiter = limiter(1024, LimitAction::LogOnly, 0);
        let addr = ip("10.0.0.1");

        for _ in 0..10 {
            assert!(limiter.allow(addr, 1024));
        }
        assert!(limiter.is_over_limit(addr, 1));
    }

    #[tokio::test]
    async fn test_throttle_mode_admits_small_operations() {
        let limiter = limiter(1024, LimitAction::Throttle, 256);
        let addr = ip("10.0.0.1");

        assert!(limiter.allow(addr, 1024));

        // Over the ceiling: only operations up to the minimum pass.
        assert!(limiter.allow(addr, 256));
        assert!(!limiter.allow(addr, 257));
        assert!(limiter.allow(addr, 100));
    }

    #[tokio::test]
    async fn test_throttle_without_minimum_denies() {
        let limiter = limiter(1024, LimitAction::Throttle, 0);
        let addr = ip("10.0.0.1");

        assert!(limiter.allow(addr, 1024));
        assert!(!limiter.allow(addr, 1));
    }

    #[tokio::test]
    async fn test_is_over_limit_does_not_mutate() {
        let limiter = limiter(1024, LimitAction::Drop, 0);
        let addr = ip("10.0.0.1");

        assert!(limiter.allow(addr, 1024));
        assert!(limiter.is_over_limit(addr, 1));
        assert!(limiter.is_over_limit(addr, 1));

        // The probe recorded nothing, so usage is still exactly the cap.
        assert!(!limiter.is_over_limit(addr, 0));
    }

    #[tokio::test]
    async fn test_unknown_ip_is_not_over_limit() {
        let limiter = limiter(1024, LimitAction::Drop, 0);
        assert!(!limiter.is_over_limit(ip("10.9.9.9"), 4096));
    }

    #[tokio::test]
    async fn test_zero_bytes_always_allowed() {
        let limiter = limiter(1, LimitAction::Drop, 0);
        let addr = ip("10.0.0.1");

        assert!(limiter.allow(addr, 0));
        assert_eq!(limiter.tracked_ips(), 0);
    }

    #[tokio::test]
    async fn test_window_expiry_restores_quota() {
        let limiter =
            BandwidthLimiter::new(1024, Duration::from_millis(50), LimitAction::Drop, 0);
        let addr = ip("10.0.0.1");

        assert!(limiter.allow(addr, 1024));
        assert!(!limiter.allow(addr, 1));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.allow(addr, 1024));
    }

    #[tokio::test]
    async fn test_reclaimer_drops_idle_buckets() {
        let limiter =
            BandwidthLimiter::new(1024, Duration::from_millis(40), LimitAction::Drop, 0);

        assert!(limiter.allow(ip("10.0.0.1"), 10));
        assert_eq!(limiter.tracked_ips(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(limiter.tracked_ips(), 0);

        limiter.close();
    }
}
