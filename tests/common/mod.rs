#![allow(dead_code)]

use authkit::auth::{
    AuditSink, AuthComponents, AuthEvent, AuthResponse, AuthService, ClientInfo, PasswordHasher,
    SignInRequest, SignUpRequest,
};
use authkit::blacklist::TokenBlacklist;
use authkit::config::{AuthConfig, RateLimitSettings};
use authkit::db::Database;
use authkit::rate_limit::RateLimiter;
use authkit::sessions::SessionLimiter;
use authkit::token::TokenCodec;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_SECRET: &[u8] = b"test-jwt-secret-0123456789abcdef!";
pub const PASSWORD: &str = "correct horse battery staple";

/// Audit sink that keeps every event for assertions.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<AuthEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<AuthEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl AuditSink for RecordingSink {
    fn record(&self, event: &AuthEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub struct TestHarness {
    pub db: Database,
    pub service: AuthService,
    pub audit: Arc<RecordingSink>,
}

/// Test configuration: defaults with a generous rate limit so flows are not
/// throttled unless a test asks for it.
pub fn test_config() -> AuthConfig {
    let mut config = AuthConfig::new(TEST_SECRET);
    config.rate_limit = RateLimitSettings {
        capacity: 1000,
        refill_tokens: 1000,
        refill_window: Duration::from_secs(60),
    };
    config
}

pub async fn harness() -> TestHarness {
    harness_with(test_config()).await
}

/// In-memory database with a fast password hasher and a recording audit sink.
pub async fn harness_with(config: AuthConfig) -> TestHarness {
    let db = Database::open(":memory:")
        .await
        .expect("Failed to open test database");
    harness_on(db, config)
}

/// Harness over an already opened database.
pub fn harness_on(db: Database, config: AuthConfig) -> TestHarness {
    config.validate().expect("Invalid test configuration");

    let audit = Arc::new(RecordingSink::default());
    let service = AuthService::from_parts(AuthComponents {
        db: db.clone(),
        codec: TokenCodec::from_config(&config),
        blacklist: TokenBlacklist::new(&db),
        sessions: SessionLimiter::new(&db, config.max_sessions_per_user),
        rate_limiter: RateLimiter::new(config.rate_limit),
        hasher: PasswordHasher::insecure_fast(),
        audit: audit.clone(),
        rotate_refresh_tokens: config.rotate_refresh_tokens,
    });

    TestHarness { db, service, audit }
}

/// SQLite file in the temp directory, removed with its journal files on drop.
pub struct TempDatabaseFile {
    pub path: std::path::PathBuf,
}

impl TempDatabaseFile {
    pub fn new() -> Self {
        let name = format!("authkit-test-{}.db", uuid::Uuid::new_v4());
        Self {
            path: std::env::temp_dir().join(name),
        }
    }

    pub fn path_str(&self) -> &str {
        self.path.to_str().expect("Temp path is not UTF-8")
    }
}

impl Drop for TempDatabaseFile {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", self.path.display(), suffix));
        }
    }
}

pub fn client(ip: &str) -> ClientInfo {
    ClientInfo::new(ip, Some("Mozilla/5.0 (Windows NT 10.0; Win64; x64)"))
}

impl TestHarness {
    pub async fn sign_up(&self, email: &str) -> AuthResponse {
        self.service
            .sign_up(
                SignUpRequest {
                    email: email.to_string(),
                    password: PASSWORD.to_string(),
                    nickname: None,
                },
                &client("10.0.0.1"),
            )
            .await
            .expect("Sign up failed")
    }

    pub async fn sign_in(&self, email: &str) -> AuthResponse {
        self.service
            .sign_in(
                SignInRequest {
                    email: email.to_string(),
                    password: PASSWORD.to_string(),
                },
                &client("10.0.0.1"),
            )
            .await
            .expect("Sign in failed")
    }
}
