//! Authentication flows on top of the token, session and rate-limit core.
//!
//! Access tokens are short-lived and stateless apart from the blacklist.
//! Refresh tokens are backed by a session row, rotated on use, and capped
//! per user.

mod audit;
mod errors;
mod password;
mod service;
mod types;

pub use audit::{AuditSink, AuthEvent, TracingAuditSink};
pub use errors::{AuthError, ResultExt};
pub use password::PasswordHasher;
pub use service::{AuthComponents, AuthService};
pub use types::{
    AuthResponse, ChangePasswordRequest, ClientInfo, FederatedProfile, Principal, RefreshRequest,
    SetPasswordRequest, SignInRequest, SignUpRequest, TokenResponse, UserView,
};
