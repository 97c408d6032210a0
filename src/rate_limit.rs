//! Rate limiting for authentication endpoints.
//!
//! Uses a token bucket per client identity (usually the IP) to slow down
//! credential stuffing. Buckets refill lazily on access: every elapsed refill
//! window adds `refill_tokens`, capped at `capacity`.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::RateLimitSettings;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    available: u32,
    last_refill: Instant,
}

impl Bucket {
    fn full(settings: &RateLimitSettings, now: Instant) -> Self {
        Self {
            available: settings.capacity,
            last_refill: now,
        }
    }

    /// Number of whole refill windows elapsed since the last refill.
    fn elapsed_windows(&self, settings: &RateLimitSettings, now: Instant) -> u128 {
        let elapsed = now.saturating_duration_since(self.last_refill);
        elapsed.as_nanos() / settings.refill_window.as_nanos().max(1)
    }

    /// Token level after refilling up to `now`, without mutating.
    fn level_at(&self, settings: &RateLimitSettings, now: Instant) -> u32 {
        let windows = self.elapsed_windows(settings, now);
        let added = windows.saturating_mul(u128::from(settings.refill_tokens));
        let level = u128::from(self.available).saturating_add(added);
        level.min(u128::from(settings.capacity)) as u32
    }

    fn refill(&mut self, settings: &RateLimitSettings, now: Instant) {
        let windows = self.elapsed_windows(settings, now);
        if windows == 0 {
            return;
        }

        self.available = self.level_at(settings, now);
        if self.available >= settings.capacity {
            self.last_refill = now;
        } else {
            // Below capacity only a handful of windows can have elapsed.
            // Advance by whole windows to keep progress toward the next one.
            self.last_refill += settings.refill_window * windows as u32;
        }
    }
}

/// Per-identity token bucket limiter.
///
/// Cloning shares the underlying buckets.
#[derive(Clone)]
pub struct RateLimiter {
    settings: RateLimitSettings,
    buckets: Arc<DashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            buckets: Arc::new(DashMap::new()),
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    /// Take one token from `identity`'s bucket. Returns false if it is empty.
    pub fn try_consume(&self, identity: &str) -> bool {
        self.try_consume_at(identity, Instant::now())
    }

    pub fn try_consume_at(&self, identity: &str, now: Instant) -> bool {
        // The entry guard holds the shard write lock, so the refill,
        // check and decrement are atomic per identity.
        let mut bucket = self
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| Bucket::full(&self.settings, now));

        bucket.refill(&self.settings, now);

        if bucket.available == 0 {
            debug!(identity = %identity, "Rate limit exhausted");
            return false;
        }
        bucket.available -= 1;
        true
    }

    /// Tokens currently available to `identity`. Does not consume.
    pub fn available_tokens(&self, identity: &str) -> u32 {
        self.available_tokens_at(identity, Instant::now())
    }

    pub fn available_tokens_at(&self, identity: &str, now: Instant) -> u32 {
        match self.buckets.get(identity) {
            Some(bucket) => bucket.level_at(&self.settings, now),
            None => self.settings.capacity,
        }
    }

    /// Remove buckets that have refilled to capacity. A full bucket is
    /// indistinguishable from a fresh one, so dropping it loses nothing.
    /// Returns the number of buckets removed.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            bucket.refill(&self.settings, now);
            let keep = bucket.available < self.settings.capacity;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Number of tracked identities.
    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }

    /// Time until `identity` gets at least one more token, if its bucket is empty.
    pub fn retry_after(&self, identity: &str) -> Option<Duration> {
        let now = Instant::now();
        let bucket = self.buckets.get(identity)?;
        if bucket.level_at(&self.settings, now) > 0 {
            return None;
        }
        let next = bucket.last_refill + self.settings.refill_window;
        Some(next.saturating_duration_since(now))
    }
}
