//! Sliding-window admission control, one instance per command class.
//!
//! Each identity keeps at most `max_requests` timestamps (oldest first), so memory per
//! identity is bounded even without sweeping. A periodic [`RateLimiter::sweep`] drops
//! identities that have gone quiet.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::RateLimitClassConfig;
use crate::shutdown::shutdown_requested;

/// Sliding-window limiter: admits a request only if fewer than `max_requests` fall inside the trailing `window`.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RateLimitClassConfig) -> Self {
        Self::new(config.max_requests, config.window())
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        // A poisoned map only means a panic elsewhere mid-update; the timestamps are still usable.
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a request for `id` if admitted. Returns false when the window is full.
    pub fn is_allowed(&self, id: &str) -> bool {
        self.is_allowed_at(id, Instant::now())
    }

    fn is_allowed_at(&self, id: &str, now: Instant) -> bool {
        let mut windows = self.lock();
        let stamps = windows.entry(id.to_string()).or_default();
        prune(stamps, now, self.window);
        if stamps.len() >= self.max_requests {
            return false;
        }
        stamps.push_back(now);
        true
    }

    /// Time until the oldest request in `id`'s window expires; zero if `id` would be admitted now.
    pub fn reset_time(&self, id: &str) -> Duration {
        self.reset_time_at(id, Instant::now())
    }

    fn reset_time_at(&self, id: &str, now: Instant) -> Duration {
        let windows = self.lock();
        match windows.get(id).and_then(|s| s.front()) {
            Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Drop identities with no request inside the window. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, stamps| {
            prune(stamps, now, self.window);
            !stamps.is_empty()
        });
        before - windows.len()
    }

    /// Number of identities currently holding timestamps.
    pub fn tracked_identities(&self) -> usize {
        self.lock().len()
    }
}

fn prune(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = stamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            stamps.pop_front();
        } else {
            break;
        }
    }
}

/// Sweep all limiters every `interval` until `shutdown` flips to true.
pub fn spawn_sweeper(
    limiters: Vec<Arc<RateLimiter>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed: usize = limiters.iter().map(|l| l.sweep()).sum();
                    if removed > 0 {
                        log::debug!("rate limit sweep removed {} idle identit(ies)", removed);
                    }
                }
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }
    })
}
