//! Authentication configuration and its validation.

use std::time::Duration;

use thiserror::Error;

/// Minimum signing secret length in bytes (256 bits).
pub const MIN_JWT_SECRET_LENGTH: usize = 32;

/// Default access token lifetime: 30 minutes
pub const DEFAULT_ACCESS_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

/// Default refresh token lifetime: 7 days
pub const DEFAULT_REFRESH_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub const DEFAULT_ISSUER: &str = "authkit";

pub const DEFAULT_MAX_SESSIONS_PER_USER: u32 = 5;

/// Token bucket settings for authentication endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    /// Maximum burst per client identity
    pub capacity: u32,
    /// Tokens added per elapsed refill window
    pub refill_tokens: u32,
    /// Length of one refill window
    pub refill_window: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: 5,
            refill_tokens: 5,
            refill_window: Duration::from_secs(60),
        }
    }
}

/// Configuration for the authentication core.
#[derive(Clone)]
pub struct AuthConfig {
    /// HS256 signing secret
    pub jwt_secret: Vec<u8>,
    /// `iss` claim written to and required on every token
    pub issuer: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub rate_limit: RateLimitSettings,
    /// Cap on non-revoked sessions per user
    pub max_sessions_per_user: u32,
    /// Issue a new refresh token on every refresh, replacing the old one
    pub rotate_refresh_tokens: bool,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .field("access_token_ttl", &self.access_token_ttl)
            .field("refresh_token_ttl", &self.refresh_token_ttl)
            .field("rate_limit", &self.rate_limit)
            .field("max_sessions_per_user", &self.max_sessions_per_user)
            .field("rotate_refresh_tokens", &self.rotate_refresh_tokens)
            .finish()
    }
}

impl AuthConfig {
    /// Configuration with default lifetimes and limits for the given secret.
    pub fn new(jwt_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
            issuer: DEFAULT_ISSUER.to_string(),
            access_token_ttl: DEFAULT_ACCESS_TOKEN_TTL,
            refresh_token_ttl: DEFAULT_REFRESH_TOKEN_TTL,
            rate_limit: RateLimitSettings::default(),
            max_sessions_per_user: DEFAULT_MAX_SESSIONS_PER_USER,
            rotate_refresh_tokens: true,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.len() < MIN_JWT_SECRET_LENGTH {
            return Err(ConfigError::SecretTooShort(MIN_JWT_SECRET_LENGTH));
        }
        if self.issuer.trim().is_empty() {
            return Err(ConfigError::EmptyIssuer);
        }
        if self.access_token_ttl < Duration::from_secs(60) {
            return Err(ConfigError::AccessTtlTooShort);
        }
        if self.refresh_token_ttl < Duration::from_secs(60 * 60) {
            return Err(ConfigError::RefreshTtlTooShort);
        }
        if self.rate_limit.capacity == 0 || self.rate_limit.refill_tokens == 0 {
            return Err(ConfigError::InvalidRateLimit(
                "capacity and refill tokens must be at least 1",
            ));
        }
        if self.rate_limit.refill_window < Duration::from_secs(1) {
            return Err(ConfigError::InvalidRateLimit(
                "refill window must be at least one second",
            ));
        }
        if self.max_sessions_per_user == 0 {
            return Err(ConfigError::InvalidSessionLimit);
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("JWT secret must be at least {0} bytes")]
    SecretTooShort(usize),
    #[error("issuer must not be empty")]
    EmptyIssuer,
    #[error("access token lifetime must be at least one minute")]
    AccessTtlTooShort,
    #[error("refresh token lifetime must be at least one hour")]
    RefreshTtlTooShort,
    #[error("invalid rate limit: {0}")]
    InvalidRateLimit(&'static str),
    #[error("max sessions per user must be at least 1")]
    InvalidSessionLimit,
}
