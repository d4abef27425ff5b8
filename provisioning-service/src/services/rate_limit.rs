//! Keyed fixed-window rate limiting.
//!
//! Each [`RateLimiter`] owns its own window map, so profiles never share
//! counters. The increment-and-compare for a key happens while holding that
//! key's DashMap shard lock; unrelated keys proceed in parallel.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::{ProfileConfig, RateLimitConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub window_start: DateTime<Utc>,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitDecision {
    /// Whole seconds until the window resets, for `Retry-After`.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        (self.reset_at - now).num_seconds().max(0) as u64
    }
}

/// Named limiter profiles the boundary can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitProfile {
    Strict,
    Moderate,
    Lenient,
}

impl RateLimitProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitProfile::Strict => "strict",
            RateLimitProfile::Moderate => "moderate",
            RateLimitProfile::Lenient => "lenient",
        }
    }
}

impl std::str::FromStr for RateLimitProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(RateLimitProfile::Strict),
            "moderate" => Ok(RateLimitProfile::Moderate),
            "lenient" => Ok(RateLimitProfile::Lenient),
            _ => Err(format!("Invalid rate limit profile: {}", s)),
        }
    }
}

pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    max_entries: usize,
    windows: DashMap<String, RateWindow>,
    /// Minimum spacing between inline sweeps.
    sweep_gap: Duration,
    /// Millisecond timestamp of the last inline sweep that was claimed.
    last_sweep_ms: AtomicI64,
    sweeps: AtomicU64,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            max_entries: usize::MAX,
            windows: DashMap::new(),
            sweep_gap: Duration::seconds(1),
            last_sweep_ms: AtomicI64::new(i64::MIN),
            sweeps: AtomicU64::new(0),
        }
    }

    pub fn from_profile(profile: &ProfileConfig, max_entries: usize) -> Self {
        Self::new(profile.window(), profile.max_requests).with_max_entries(max_entries)
    }

    /// Sweep expired windows inline once the map holds more than `max_entries`.
    /// At most one inline sweep runs per `sweep_gap`, so a map full of live
    /// windows is not rescanned on every request.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    pub fn with_sweep_gap(mut self, sweep_gap: Duration) -> Self {
        self.sweep_gap = sweep_gap;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Sweeps performed so far, inline or from the background task.
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    pub fn check(&self, key: &str, now: DateTime<Utc>) -> RateLimitDecision {
        let decision = {
            let mut slot = self.windows.entry(key.to_string()).or_insert(RateWindow {
                window_start: now,
                count: 0,
            });

            if now >= slot.window_start + self.window {
                *slot = RateWindow {
                    window_start: now,
                    count: 0,
                };
            }

            let reset_at = slot.window_start + self.window;
            if slot.count < self.max_requests {
                slot.count += 1;
                RateLimitDecision {
                    allowed: true,
                    remaining: self.max_requests - slot.count,
                    reset_at,
                }
            } else {
                RateLimitDecision {
                    allowed: false,
                    remaining: 0,
                    reset_at,
                }
            }
        };

        // The shard lock above must be released before retain() walks every shard.
        if self.windows.len() > self.max_entries && self.claim_inline_sweep(now) {
            self.sweep(now);
        }

        decision
    }

    /// Only the caller that moves `last_sweep_ms` forward gets to sweep;
    /// everyone else inside the gap, or racing for the same slot, skips it.
    fn claim_inline_sweep(&self, now: DateTime<Utc>) -> bool {
        let now_ms = now.timestamp_millis();
        let last = self.last_sweep_ms.load(Ordering::Acquire);
        if now_ms.saturating_sub(last) < self.sweep_gap.num_milliseconds() {
            return false;
        }
        self.last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drop every window that has already ended. Returns how many were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now < w.window_start + self.window);
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        before.saturating_sub(self.windows.len())
    }

    /// Periodically sweep this limiter until it is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: std::time::Duration,
        clock: Arc<dyn Clock>,
    ) -> JoinHandle<()> {
        let limiter = Arc::downgrade(self);
        let every = every.max(std::time::Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                let removed = limiter.sweep(clock.now());
                if removed > 0 {
                    tracing::debug!(removed, "Evicted expired rate limit windows");
                }
            }
        })
    }
}

/// The three boundary profiles, each with an independent limiter.
#[derive(Clone)]
pub struct RateLimiterRegistry {
    strict: Arc<RateLimiter>,
    moderate: Arc<RateLimiter>,
    lenient: Arc<RateLimiter>,
}

impl RateLimiterRegistry {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            strict: Arc::new(RateLimiter::from_profile(&config.strict, config.max_entries)),
            moderate: Arc::new(RateLimiter::from_profile(&config.moderate, config.max_entries)),
            lenient: Arc::new(RateLimiter::from_profile(&config.lenient, config.max_entries)),
        }
    }

    pub fn get(&self, profile: RateLimitProfile) -> &Arc<RateLimiter> {
        match profile {
            RateLimitProfile::Strict => &self.strict,
            RateLimitProfile::Moderate => &self.moderate,
            RateLimitProfile::Lenient => &self.lenient,
        }
    }

    pub fn check(
        &self,
        profile: RateLimitProfile,
        key: &str,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        self.get(profile).check(key, now)
    }

    pub fn spawn_sweepers(
        &self,
        every: std::time::Duration,
        clock: Arc<dyn Clock>,
    ) -> Vec<JoinHandle<()>> {
        [&self.strict, &self.moderate, &self.lenient]
            .into_iter()
            .map(|limiter| limiter.spawn_sweeper(every, clock.clone()))
            .collect()
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}
