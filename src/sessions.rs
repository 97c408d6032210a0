//! Concurrent session control.
//!
//! Each user may hold at most `max_sessions_per_user` non-revoked sessions.
//! Opening one more first revokes the oldest. The count/evict/insert sequence
//! runs under a per-user async lock and inside one transaction, so two
//! concurrent sign-ins for the same user cannot both pass the count check.

use dashmap::DashMap;
use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::db::{Database, Session, SessionStore};
use crate::token::unix_now;

/// Client metadata recorded on a new session.
#[derive(Debug, Clone)]
pub struct NewSession {
    /// Current refresh token for the session
    pub token: String,
    pub expires_at: u64,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

/// Active session as shown to its owner.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: String,
    pub device: &'static str,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
    /// Whether this is the session the request was made from
    pub current: bool,
}

impl SessionView {
    fn from_session(session: Session, current_id: Option<&str>) -> Self {
        Self {
            current: current_id == Some(session.id.as_str()),
            device: device_label(session.user_agent.as_deref()),
            id: session.id,
            user_agent: session.user_agent,
            ip_address: session.ip_address,
            created_at: session.created_at,
            expires_at: session.expires_at,
        }
    }
}

/// Best-effort device label from a user agent. Advisory only.
pub fn device_label(user_agent: Option<&str>) -> &'static str {
    let Some(ua) = user_agent else {
        return "Unknown";
    };
    // iOS agents mention "Mac OS X" and Android agents mention "Linux".
    if ua.contains("iPhone") {
        "iPhone"
    } else if ua.contains("iPad") {
        "iPad"
    } else if ua.contains("Android") {
        "Android"
    } else if ua.contains("Windows") {
        "Windows"
    } else if ua.contains("Mac") {
        "Mac"
    } else if ua.contains("Linux") {
        "Linux"
    } else {
        "Unknown"
    }
}

#[derive(Clone)]
pub struct SessionLimiter {
    db: Database,
    max_sessions: u32,
    locks: Arc<DashMap<i64, Arc<Mutex<()>>>>,
}

impl SessionLimiter {
    pub fn new(db: &Database, max_sessions_per_user: u32) -> Self {
        Self {
            db: db.clone(),
            max_sessions: max_sessions_per_user,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn max_sessions(&self) -> u32 {
        self.max_sessions
    }

    fn store(&self) -> SessionStore {
        self.db.sessions()
    }

    /// Revoke the oldest active sessions until a new one fits under the cap.
    /// Must run inside the transaction that creates the new session.
    /// Returns the number of sessions evicted.
    pub async fn enforce_limit(
        &self,
        conn: &mut SqliteConnection,
        user_id: i64,
    ) -> Result<u64, sqlx::Error> {
        let mut count = SessionStore::count_active_with(&mut *conn, user_id).await?;
        let max = i64::from(self.max_sessions);
        let mut evicted = 0;

        while count >= max {
            match SessionStore::revoke_oldest_with(&mut *conn, user_id).await? {
                Some(session_id) => {
                    info!(user_id, session_id = %session_id, "Session limit reached, revoked oldest session");
                    evicted += 1;
                    count -= 1;
                }
                None => break,
            }
        }

        Ok(evicted)
    }

    /// Create a session for `user_id`, evicting the oldest ones if the user is at the cap.
    pub async fn open_session(
        &self,
        user_id: i64,
        new_session: NewSession,
    ) -> Result<Session, sqlx::Error> {
        let lock = self
            .locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.open_session_locked(user_id, new_session).await
        };

        drop(lock);
        // Drop the lock entry once no other task is waiting on it
        self.locks
            .remove_if(&user_id, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn open_session_locked(
        &self,
        user_id: i64,
        new_session: NewSession,
    ) -> Result<Session, sqlx::Error> {
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            token: new_session.token,
            created_at: unix_now() as i64,
            expires_at: new_session.expires_at as i64,
            revoked: false,
            device_info: Some(device_label(new_session.user_agent.as_deref()).to_string()),
            user_agent: new_session.user_agent,
            ip_address: new_session.ip_address,
        };

        // Sign-ins for different users run in parallel, so the
        // count/evict/insert transaction takes the write lock up front
        let mut conn = self.db.begin_immediate().await?;
        let result = self.evict_and_insert(&mut *conn, &session).await;
        Database::end_immediate(conn, result.is_ok()).await?;
        let evicted = result?;

        debug!(user_id, session_id = %session.id, evicted, "Session opened");
        Ok(session)
    }

    async fn evict_and_insert(
        &self,
        conn: &mut SqliteConnection,
        session: &Session,
    ) -> Result<u64, sqlx::Error> {
        let evicted = self.enforce_limit(&mut *conn, session.user_id).await?;
        SessionStore::insert_with(&mut *conn, session).await?;
        Ok(evicted)
    }

    /// Active sessions of a user, newest first. `current_id` marks the caller's session.
    pub async fn list_active(
        &self,
        user_id: i64,
        current_id: Option<&str>,
    ) -> Result<Vec<SessionView>, sqlx::Error> {
        let sessions = self.store().list_active(user_id).await?;
        Ok(sessions
            .into_iter()
            .map(|s| SessionView::from_session(s, current_id))
            .collect())
    }

    /// Revoke one session. Returns false if it is missing, not owned by
    /// `user_id`, or already revoked.
    pub async fn revoke(&self, user_id: i64, session_id: &str) -> Result<bool, sqlx::Error> {
        self.store().revoke(user_id, session_id).await
    }

    /// Revoke every active session whose token differs from `except_token`.
    pub async fn revoke_all_others(
        &self,
        user_id: i64,
        except_token: &str,
    ) -> Result<u64, sqlx::Error> {
        self.store()
            .revoke_all_except(user_id, Some(except_token))
            .await
    }

    /// Revoke every active session of a user.
    pub async fn revoke_all(&self, user_id: i64) -> Result<u64, sqlx::Error> {
        self.store().revoke_all_except(user_id, None).await
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<Session>, sqlx::Error> {
        self.store().get(session_id).await
    }

    pub async fn find_by_token(&self, token: &str) -> Result<Option<Session>, sqlx::Error> {
        self.store().find_by_token(token).await
    }

    /// Replace a session's refresh token. Fails (returns false) if another
    /// refresh already rotated it or it was revoked in the meantime.
    pub async fn rotate(
        &self,
        session_id: &str,
        old_token: &str,
        new_token: &str,
        new_expires_at: u64,
    ) -> Result<bool, sqlx::Error> {
        self.store()
            .rotate(session_id, old_token, new_token, new_expires_at as i64)
            .await
    }

    #[cfg(test)]
    fn lock_entries(&self) -> usize {
        self.locks.len()
    }
}
