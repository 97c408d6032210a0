//! Scheduled cleanup of expired blacklist entries and idle rate-limit buckets.

use crate::blacklist::TokenBlacklist;
use crate::rate_limit::RateLimiter;
use crate::token::unix_now;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Interval between blacklist sweeps.
pub const BLACKLIST_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Interval between rate-limit bucket cleanups.
pub const RATE_LIMIT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Sweep expired blacklist entries once. Returns the number removed.
pub async fn sweep_blacklist(blacklist: &TokenBlacklist) -> u64 {
    match blacklist.sweep(unix_now()).await {
        Ok(count) => count,
        Err(e) => {
            error!("Failed to sweep token blacklist: {}", e);
            0
        }
    }
}

/// Drop rate-limit buckets that have refilled. Returns the number removed.
pub fn cleanup_rate_limits(rate_limiter: &RateLimiter) -> usize {
    let removed = rate_limiter.cleanup();
    if removed > 0 {
        debug!("Cleaned up {} idle rate-limit buckets", removed);
    }
    removed
}

/// Run all cleanup tasks once.
pub async fn run_cleanup(blacklist: &TokenBlacklist, rate_limiter: &RateLimiter) {
    sweep_blacklist(blacklist).await;
    cleanup_rate_limits(rate_limiter);
}

/// Handle to the background cleanup task.
pub struct CleanupScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CleanupScheduler {
    /// Stop the scheduler and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!("Cleanup scheduler task failed: {}", e);
        }
        info!("Cleanup scheduler stopped");
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Spawn a background task that sweeps the blacklist hourly and cleans up
/// rate-limit buckets every ten minutes.
pub fn spawn_cleanup_scheduler(
    blacklist: TokenBlacklist,
    rate_limiter: RateLimiter,
) -> CleanupScheduler {
    spawn_cleanup_scheduler_with(
        blacklist,
        rate_limiter,
        BLACKLIST_SWEEP_INTERVAL,
        RATE_LIMIT_CLEANUP_INTERVAL,
    )
}

/// Same as [`spawn_cleanup_scheduler`] with explicit intervals.
pub fn spawn_cleanup_scheduler_with(
    blacklist: TokenBlacklist,
    rate_limiter: RateLimiter,
    sweep_interval: Duration,
    rate_limit_interval: Duration,
) -> CleanupScheduler {
    let (shutdown, mut stop) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut sweep = tokio::time::interval(sweep_interval);
        let mut buckets = tokio::time::interval(rate_limit_interval);

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    sweep_blacklist(&blacklist).await;
                }
                _ = buckets.tick() => {
                    cleanup_rate_limits(&rate_limiter);
                }
                changed = stop.changed() => {
                    // Sender dropped counts as a stop request
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    });

    CleanupScheduler { shutdown, handle }
}
