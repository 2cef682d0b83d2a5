//! Sliding-window limit on concurrent connections per source IP.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;

/// Per-IP admission record.
#[derive(Debug, Default)]
struct ConnEntry {
    /// Logical active count, decremented on release.
    active: usize,

    /// Admission timestamps, oldest first.
    timestamps: VecDeque<Instant>,
}

impl ConnEntry {
    /// Drop timestamps older than one window and reconcile the count.
    fn expire(&mut self, now: Instant, window: Duration) {
        if let Some(cutoff) = now.checked_sub(window) {
            while let Some(&oldest) = self.timestamps.front() {
                if oldest > cutoff {
                    break;
                }
                self.timestamps.pop_front();
            }
        }
        self.active = self.timestamps.len();
    }
}

#[derive(Debug)]
struct Shared {
    max_per_ip: usize,
    window: Duration,
    entries: RwLock<HashMap<IpAddr, Arc<Mutex<ConnEntry>>>>,
}

impl Shared {
    fn entry(&self, ip: IpAddr) -> Arc<Mutex<ConnEntry>> {
        if let Some(entry) = self.entries.read().unwrap().get(&ip) {
            return Arc::clone(entry);
        }
        let mut map = self.entries.write().unwrap();
        Arc::clone(map.entry(ip).or_default())
    }

    /// Remove records with no active connections whose newest timestamp is
    /// older than twice the window.
    fn reclaim(&self, now: Instant) {
        let horizon = self.window * 2;
        let mut map = self.entries.write().unwrap();
        map.retain(|_, entry| {
            let entry = entry.lock().unwrap();
            if entry.active != 0 {
                return true;
            }
            match entry.timestamps.back() {
                Some(&newest) => now.duration_since(newest) <= horizon,
                None => false,
            }
        });
    }
}

/// Limits concurrent connections per IP over a sliding window.
///
/// Must be created inside a tokio runtime; construction spawns the
/// background reclamation task.
#[derive(Debug)]
pub struct ConnectionLimiter {
    shared: Arc<Shared>,
    stop: watch::Sender<bool>,
}

impl ConnectionLimiter {
    /// Create a limiter allowing `max_per_ip` connections per `window`.
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

    /// Admit a connection from `ip` if it is within the limit, recording
    /// the admission timestamp on success.
    pub fn allow(&self, ip: IpAddr) -> bool {
        let entry = self.shared.entry(ip);
        let mut entry = entry.lock().unwrap();

        let now = Instant::now();
        entry.expire(now, self.shared.window);

        if entry.timestamps.len() >= self.shared.max_per_ip {
            return false;
        }

        entry.timestamps.push_back(now);
        entry.active += 1;
        true
    }

    /// Release one admission for `ip`, dropping the oldest timestamp.
    pub fn release(&self, ip: IpAddr) {
        let entry = self.shared.entries.read().unwrap().get(&ip).cloned();
        let Some(entry) = entry else { return };

        let mut entry = entry.lock().unwrap();
        if entry.active > 0 {
            entry.active -= 1;
            entry.timestamps.pop_front();
        }
    }

    /// Current active count for `ip` after expiry.
    #[must_use]
    pub fn active(&self, ip: IpAddr) -> usize {
        let entry = self.shared.entries.read().unwrap().get(&ip).cloned();
        let Some(entry) = entry else { return 0 };

        let mut entry = entry.lock().unwrap();
        entry.expire(Instant::now(), self.shared.window);
        entry.active
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
