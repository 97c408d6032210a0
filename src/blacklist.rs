//! Revoked access tokens.
//!
//! Two tiers: a process-local cache answers hits without touching the
//! database, the `token_blacklist` table is authoritative. Inserts write
//! through to both before returning, so a token is reported blacklisted to
//! every thread as soon as `add` completes. Misses always consult the store;
//! negative answers are never cached.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::db::{BlacklistStore, Database};
use crate::token::unix_now;

#[derive(Clone)]
pub struct TokenBlacklist {
    store: BlacklistStore,
    /// token -> expires_at
    cache: Arc<DashMap<String, i64>>,
}

impl TokenBlacklist {
    pub fn new(db: &Database) -> Self {
        Self {
            store: db.blacklist(),
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Blacklist a token until `expires_at` (Unix seconds). Idempotent.
    ///
    /// A storage failure fails the call and leaves the cache untouched.
    pub async fn add(&self, token: &str, expires_at: u64) -> Result<(), sqlx::Error> {
        let expires_at = expires_at as i64;
        let inserted = self
            .store
            .insert(token, expires_at, unix_now() as i64)
            .await?;

        if !inserted {
            debug!("Token already blacklisted");
        }

        self.cache.insert(token.to_string(), expires_at);
        Ok(())
    }

    /// Check whether a token has been blacklisted.
    ///
    /// Storage errors propagate: callers must not treat an unanswered
    /// lookup as "not blacklisted".
    pub async fn is_blacklisted(&self, token: &str) -> Result<bool, sqlx::Error> {
        if self.cache.contains_key(token) {
            return Ok(true);
        }

        match self.store.get_expiry(token).await? {
            Some(expires_at) => {
                self.cache.insert(token.to_string(), expires_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete all entries that expired before `now` (Unix seconds).
    /// Returns the number of stored entries removed.
    pub async fn sweep(&self, now: u64) -> Result<u64, sqlx::Error> {
        let now = now as i64;
        let removed = self.store.delete_expired(now).await?;
        self.cache.retain(|_, expires_at| *expires_at >= now);

        if removed > 0 {
            info!(removed, "Swept expired blacklist entries");
        }
        Ok(removed)
    }

    /// Number of entries in the fast-lookup cache.
    pub fn len_cached(&self) -> usize {
        self.cache.len()
    }
}
