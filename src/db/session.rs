//! Session storage. Each row backs one refresh token grant.
//!
//! Rows are revoked, never deleted. Operations that must run inside the
//! session limiter's transaction are generic over the executor.

use sqlx::sqlite::{Sqlite, SqlitePool};
use sqlx::Executor;

/// A session (refresh token) record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    pub id: String,
    pub user_id: i64,
    pub token: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub revoked: bool,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub device_info: Option<String>,
}

impl Session {
    /// Not revoked and not past its expiry at `now`.
    pub fn is_usable_at(&self, now: i64) -> bool {
        !self.revoked && self.expires_at > now
    }
}

/// Store for managing session records.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new session record.
    pub async fn insert_with<'e, E>(executor: E, session: &Session) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            "INSERT INTO sessions (id, user_id, token, created_at, expires_at, revoked, user_agent, ip_address, device_info) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(session.user_id)
        .bind(&session.token)
        .bind(session.created_at)
        .bind(session.expires_at)
        .bind(session.revoked)
        .bind(&session.user_agent)
        .bind(&session.ip_address)
        .bind(&session.device_info)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Count non-revoked sessions for a user.
    pub async fn count_active_with<'e, E>(executor: E, user_id: i64) -> Result<i64, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sessions WHERE user_id = ? AND revoked = 0")
                .bind(user_id)
                .fetch_one(executor)
                .await?;
        Ok(count.0)
    }

    /// Revoke the single oldest non-revoked session for a user.
    /// Returns the id of the revoked session, if any.
    pub async fn revoke_oldest_with<'e, E>(
        executor: E,
        user_id: i64,
    ) -> Result<Option<String>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row: Option<(String,)> = sqlx::query_as(
            "UPDATE sessions SET revoked = 1 WHERE id = (
                SELECT id FROM sessions WHERE user_id = ? AND revoked = 0
                ORDER BY created_at ASC, rowid ASC LIMIT 1
            ) RETURNING id",
        )
        .bind(user_id)
        .fetch_optional(executor)
        .await?;
        Ok(row.map(|r| r.0))
    }

    pub async fn count_active(&self, user_id: i64) -> Result<i64, sqlx::Error> {
        Self::count_active_with(&self.pool, user_id).await
    }

    /// Get a session by id.
    pub async fn get(&self, id: &str) -> Result<Option<Session>, sqlx::Error> {
        sqlx::query_as::<_, Session>(
            "SELECT id, user_id, token, created_at, expires_at, revoked, user_agent, ip_address, device_info FROM sessions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    /// Get a session by its current refresh token.
    pub async fn find_by_token(&self, token: &str) -> Result<Option<Session>, sqlx::Error> {
        sqlx::query_as::<_, Session>(
            "SELECT id, user_id, token, created_at, expires_at, revoked, user_agent, ip_address, device_info FROM sessions WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
    }

    /// List non-revoked sessions for a user, newest first.
    pub async fn list_active(&self, user_id: i64) -> Result<Vec<Session>, sqlx::Error> {
        sqlx::query_as::<_, Session>(
            "SELECT id, user_id, token, created_at, expires_at, revoked, user_agent, ip_address, device_info FROM sessions WHERE user_id = ? AND revoked = 0 ORDER BY created_at DESC, rowid DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Revoke a session owned by `user_id`. Returns false if it does not exist,
    /// belongs to someone else, or is already revoked.
    pub async fn revoke(&self, user_id: i64, id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE sessions SET revoked = 1 WHERE id = ? AND user_id = ? AND revoked = 0",
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Revoke every active session of a user except the one holding `except_token`.
    pub async fn revoke_all_except(
        &self,
        user_id: i64,
        except_token: Option<&str>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE sessions SET revoked = 1 WHERE user_id = ? AND revoked = 0 AND (? IS NULL OR token <> ?)",
        )
        .bind(user_id)
        .bind(except_token)
        .bind(except_token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Swap the refresh token of an active session. Only succeeds if the
    /// session still holds `old_token`.
    pub async fn rotate(
        &self,
        id: &str,
        old_token: &str,
        new_token: &str,
        new_expires_at: i64,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE sessions SET token = ?, expires_at = ? WHERE id = ? AND token = ? AND revoked = 0",
        )
        .bind(new_token)
        .bind(new_expires_at)
        .bind(id)
        .bind(old_token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, NewUser};

    async fn setup() -> (Database, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let user_id = db
            .users()
            .create(&NewUser {
                email: "alice@example.com".to_string(),
                nickname: "alice".to_string(),
                password_hash: None,
                profile_image_url: None,
            })
            .await
            .unwrap();
        (db, user_id)
    }

    fn session(id: &str, user_id: i64, created_at: i64) -> Session {
        Session {
            id: id.to_string(),
            user_id,
            token: format!("token-{}", id),
            created_at,
            expires_at: created_at + 3600,
            revoked: false,
            user_agent: None,
            ip_address: Some("127.0.0.1".to_string()),
            device_info: None,
        }
    }

    #[tokio::test]
    async fn test_revoke_oldest_follows_creation_order() {
        let (db, user_id) = setup().await;

        // Same timestamp for b and c: insertion order breaks the tie
        SessionStore::insert_with(db.pool(), &session("b", user_id, 100)).await.unwrap();
        SessionStore::insert_with(db.pool(), &session("c", user_id, 100)).await.unwrap();
        SessionStore::insert_with(db.pool(), &session("a", user_id, 50)).await.unwrap();

        let first = SessionStore::revoke_oldest_with(db.pool(), user_id).await.unwrap();
        let second = SessionStore::revoke_oldest_with(db.pool(), user_id).await.unwrap();
        assert_eq!(first.as_deref(), Some("a"));
        assert_eq!(second.as_deref(), Some("b"));
        assert_eq!(db.sessions().count_active(user_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_revoke_requires_owner_and_active() {
        let (db, user_id) = setup().await;
        SessionStore::insert_with(db.pool(), &session("s1", user_id, 100)).await.unwrap();

        assert!(!db.sessions().revoke(user_id + 1, "s1").await.unwrap());
        assert!(db.sessions().revoke(user_id, "s1").await.unwrap());
        assert!(!db.sessions().revoke(user_id, "s1").await.unwrap());
        assert!(!db.sessions().revoke(user_id, "missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke_all_except() {
        let (db, user_id) = setup().await;
        for (i, id) in ["s1", "s2", "s3"].iter().enumerate() {
            SessionStore::insert_with(db.pool(), &session(id, user_id, i as i64))
                .await
                .unwrap();
        }

        let revoked = db
            .sessions()
            .revoke_all_except(user_id, Some("token-s2"))
            .await
            .unwrap();
        assert_eq!(revoked, 2);

        let active = db.sessions().list_active(user_id).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "s2");

        assert_eq!(db.sessions().revoke_all_except(user_id, None).await.unwrap(), 1);
        assert_eq!(db.sessions().count_active(user_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rotate_is_compare_and_swap() {
        let (db, user_id) = setup().await;
        SessionStore::insert_with(db.pool(), &session("s1", user_id, 100)).await.unwrap();

        assert!(db.sessions().rotate("s1", "token-s1", "token-new", 9999).await.unwrap());
        // Second rotation with the stale token loses
        assert!(!db.sessions().rotate("s1", "token-s1", "token-other", 9999).await.unwrap());

        let stored = db.sessions().get("s1").await.unwrap().unwrap();
        assert_eq!(stored.token, "token-new");
        assert_eq!(stored.expires_at, 9999);
        assert!(db.sessions().find_by_token("token-s1").await.unwrap().is_none());
    }
}
