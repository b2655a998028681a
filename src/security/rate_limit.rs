//! Fixed-window rate limiting shared by every route.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::security::forwarded::ClientIdentity;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: u32 },
    Rejected { retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

/// Per-identity window record.
#[derive(Debug, Clone, Copy)]
struct RateLimitWindow {
    window_start: Instant,
    count: u32,
}

/// Fixed-window counter keyed by client identity.
///
/// The map's entry guard holds the shard lock for the whole
/// check-and-increment, so two concurrent requests can never both take the
/// last slot of a window.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    windows: DashMap<String, RateLimitWindow>,
    window: Duration,
    max_requests: u32,
}

impl FixedWindowLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            max_requests,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.window(), config.max_requests)
    }

    pub fn admit(&self, identity: &ClientIdentity) -> Admission {
        self.admit_at(identity.address(), Instant::now())
    }

    /// Admission check against an explicit clock reading.
    pub fn admit_at(&self, key: &str, now: Instant) -> Admission {
        let mut entry = self
            .windows
            .entry(key.to_owned())
            .or_insert(RateLimitWindow {
                window_start: now,
                count: 0,
            });

        // Only a reading past the window end starts a new one, so
        // window_start never moves backwards.
        if now >= entry.window_start + self.window {
            entry.window_start = now;
            entry.count = 0;
        }

        if entry.count < self.max_requests {
            entry.count += 1;
            Admission::Allowed {
                remaining: self.max_requests - entry.count,
            }
        } else {
            let window_end = entry.window_start + self.window;
            Admission::Rejected {
                retry_after: window_end.saturating_duration_since(now),
            }
        }
    }

    /// Drop every window that has already ended. Returns how many went.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, window| now < window.window_start + self.window);
        before.saturating_sub(self.windows.len())
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }

    /// Periodically evict expired windows until shutdown.
    pub async fn run_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = self.sweep_at(Instant::now());
                    if evicted > 0 {
                        tracing::debug!(evicted, tracked = self.tracked(), "Rate limit windows swept");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Rate limit sweeper stopping");
                    break;
                }
            }
        }
    }
}
