//! Authentication audit events.
//!
//! Every flow reports what happened through an [`AuditSink`]. The default sink
//! writes structured log lines; tests and embedders can record events instead.

use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedUp { user_id: i64 },
    SignedIn { user_id: i64, session_id: String },
    /// Unknown email and wrong password are not distinguished here either.
    SignInFailed { identity: String },
    Refreshed { user_id: i64, session_id: String },
    SignedOut { user_id: i64, sessions_revoked: u64 },
    SessionRevoked { user_id: i64, session_id: String },
    OtherSessionsRevoked { user_id: i64, count: u64 },
    PasswordChanged { user_id: i64 },
    PasswordSet { user_id: i64 },
    RateLimited { identity: String },
    TokenRevoked { user_id: Option<i64> },
    FederatedSignIn { user_id: i64, provider: String, created: bool },
    /// A validly signed refresh token no session holds, usually one already rotated out.
    RefreshReuse { user_id: i64 },
}

impl AuthEvent {
    /// Events an operator should notice.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            AuthEvent::SignInFailed { .. }
                | AuthEvent::RateLimited { .. }
                | AuthEvent::RefreshReuse { .. }
        )
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuthEvent);
}

/// Logs each event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuthEvent) {
        if event.is_security_relevant() {
            warn!(target: "authkit::audit", event = ?event, "Auth event");
        } else {
            info!(target: "authkit::audit", event = ?event, "Auth event");
        }
    }
}
