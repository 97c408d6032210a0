//! Durable storage for revoked access tokens.

use sqlx::sqlite::SqlitePool;

#[derive(Clone)]
pub struct BlacklistStore {
    pool: SqlitePool,
}

impl BlacklistStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a revoked token. Returns false if it was already present.
    pub async fn insert(
        &self,
        token: &str,
        expires_at: i64,
        now: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO token_blacklist (token, expires_at, created_at) VALUES (?, ?, ?) ON CONFLICT (token) DO NOTHING",
        )
        .bind(token)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Get the stored expiry for a token, if it is blacklisted.
    pub async fn get_expiry(&self, token: &str) -> Result<Option<i64>, sqlx::Error> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT expires_at FROM token_blacklist WHERE token = ?")
                .bind(token)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.0))
    }

    /// Delete all entries that expired strictly before `now`.
    pub async fn delete_expired(&self, now: i64) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM token_blacklist WHERE expires_at < ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64, sqlx::Error> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM token_blacklist")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }
}
