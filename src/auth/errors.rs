//! Authentication error types.

use thiserror::Error;
use tracing::error;

/// Failures returned by authentication flows.
///
/// `Display` is the fixed client-facing message. Credential and token
/// failures are deliberately vague; internal detail is logged where the
/// error is created, never carried in the message.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Email is already registered")]
    DuplicateEmail,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Not found")]
    NotFound,
    #[error("Passwords do not match")]
    PasswordMismatch,
    #[error("Current password is incorrect")]
    InvalidCurrentPassword,
    #[error("Password is already set")]
    PasswordAlreadySet,
    #[error("No password is set for this account")]
    NoPasswordSet,
    #[error("Too many requests. Please try again later.")]
    TooManyRequests,
    /// Reserved for a lockout policy layered on top of audit events.
    #[error("Account is locked")]
    AccountLocked,
    /// Storage is unreachable. Callers may retry.
    #[error("Service temporarily unavailable")]
    Unavailable(#[source] sqlx::Error),
    #[error("Internal error")]
    Internal(String),
}

impl AuthError {
    /// HTTP status an API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::InvalidCredentials | AuthError::InvalidToken => 401,
            AuthError::DuplicateEmail
            | AuthError::PasswordAlreadySet
            | AuthError::NoPasswordSet => 409,
            AuthError::NotFound => 404,
            AuthError::PasswordMismatch | AuthError::InvalidCurrentPassword => 400,
            AuthError::TooManyRequests => 429,
            AuthError::AccountLocked => 423,
            AuthError::Unavailable(_) => 503,
            AuthError::Internal(_) => 500,
        }
    }

    pub fn storage(context: &str, e: sqlx::Error) -> Self {
        error!("{}: {}", context, e);
        AuthError::Unavailable(e)
    }

    pub fn internal(context: &str, e: impl std::fmt::Display) -> Self {
        error!("{}: {}", context, e);
        AuthError::Internal(context.to_string())
    }
}

/// Extension trait for concise storage error mapping on Results.
pub trait ResultExt<T> {
    fn db_err(self, context: &str) -> Result<T, AuthError>;
}

impl<T> ResultExt<T> for Result<T, sqlx::Error> {
    fn db_err(self, context: &str) -> Result<T, AuthError> {
        self.map_err(|e| AuthError::storage(context, e))
    }
}
