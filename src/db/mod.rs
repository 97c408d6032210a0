mod blacklist;
mod session;
mod user;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

pub use blacklist::BlacklistStore;
pub use session::{Session, SessionStore};
pub use user::{NewUser, User, UserRole, UserStore};

/// How long a writer waits for the database lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Schema migrations in order. Entry `n` brings the schema to version `n + 1`.
const MIGRATIONS: &[&[&str]] = &[
    // v1
    &[
        // Users table. password_hash is NULL for federated accounts.
        "CREATE TABLE users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT UNIQUE NOT NULL COLLATE NOCASE,
            nickname TEXT NOT NULL,
            password_hash TEXT,
            role TEXT NOT NULL DEFAULT 'USER',
            profile_image_url TEXT,
            provider TEXT,
            provider_id TEXT,
            created_at INTEGER NOT NULL
        )",
        "CREATE UNIQUE INDEX idx_users_provider ON users(provider, provider_id)",
        // Sessions table (one row per refresh token grant)
        "CREATE TABLE sessions (
            id TEXT PRIMARY KEY NOT NULL,
            user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            token TEXT UNIQUE NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            revoked INTEGER NOT NULL DEFAULT 0,
            user_agent TEXT,
            ip_address TEXT,
            device_info TEXT
        )",
        "CREATE INDEX idx_sessions_user_active ON sessions(user_id, revoked, created_at)",
        // Revoked access tokens, kept until their natural expiry
        "CREATE TABLE token_blacklist (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            token TEXT UNIQUE NOT NULL,
            expires_at INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )",
        "CREATE INDEX idx_token_blacklist_expires_at ON token_blacklist(expires_at)",
    ],
];

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open or create a database at the given path.
    /// Use ":memory:" for an in-memory database.
    pub async fn open(path: &str) -> Result<Self, sqlx::Error> {
        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{}?mode=rwc", path)
        };

        let options = SqliteConnectOptions::from_str(&url)?.busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Highest applied schema version, 0 for a fresh database.
    async fn schema_version(&self) -> Result<i32, sqlx::Error> {
        let version: Option<i32> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(&self.pool)
            .await?;
        Ok(version.unwrap_or(0))
    }

    /// Apply every migration newer than the recorded version, each in its
    /// own transaction.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
            .execute(&self.pool)
            .await?;

        let current = self.schema_version().await?;
        for (version, queries) in (1..).zip(MIGRATIONS) {
            if version > current {
                self.apply_migration(version, queries).await?;
                debug!("Applied schema migration {}", version);
            }
        }
        Ok(())
    }

    async fn apply_migration(&self, version: i32, queries: &[&'static str]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for query in queries {
            sqlx::query(*query).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await
    }

    /// Get the user store.
    pub fn users(&self) -> UserStore {
        UserStore::new(self.pool.clone())
    }

    /// Get the session (refresh token) store.
    pub fn sessions(&self) -> SessionStore {
        SessionStore::new(self.pool.clone())
    }

    /// Get the token blacklist store.
    pub fn blacklist(&self) -> BlacklistStore {
        BlacklistStore::new(self.pool.clone())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a new transaction.
    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, sqlx::Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Acquire a connection and open a write transaction on it.
    ///
    /// `BEGIN IMMEDIATE` takes the write lock before the first read, so
    /// concurrent read-then-write transactions queue on the busy timeout
    /// instead of failing on a lock upgrade. End it with [`Self::end_immediate`].
    pub async fn begin_immediate(&self) -> Result<PoolConnection<Sqlite>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        Ok(conn)
    }

    /// Commit or roll back a transaction from [`Self::begin_immediate`].
    ///
    /// A failed commit is rolled back and returned. A connection left with an
    /// open transaction is closed rather than returned to the pool.
    pub async fn end_immediate(
        mut conn: PoolConnection<Sqlite>,
        commit: bool,
    ) -> Result<(), sqlx::Error> {
        let commit_result = if commit {
            sqlx::query("COMMIT").execute(&mut *conn).await.map(|_| ())
        } else {
            Ok(())
        };
        if commit && commit_result.is_ok() {
            return Ok(());
        }

        if let Err(e) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
            warn!("Failed to roll back transaction, discarding connection: {}", e);
            let _ = conn.close().await;
        }
        commit_result
    }

    /// Close every pooled connection. Subsequent queries fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
