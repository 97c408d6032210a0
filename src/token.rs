//! JWT token issuance and verification.
//!
//! Access and refresh tokens share one encoding with a `typ` discriminator.
//! `verify` checks signature, issuer and expiry only; every use site must also
//! check the type (see [`TokenCodec::verify_typed`]).

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::AuthConfig;

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Token type for distinguishing access vs refresh tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    /// Short-lived token authorizing API calls. Carries roles and the session id.
    Access,
    /// Long-lived token backed by a session record. No roles.
    Refresh,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

/// JWT claims shared by access and refresh tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    /// Email, denormalized for display
    pub email: String,
    /// Role names, empty for refresh tokens
    #[serde(default)]
    pub roles: Vec<String>,
    /// Token type
    #[serde(rename = "typ")]
    pub token_type: TokenType,
    /// Issuer
    pub iss: String,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Unique token id
    pub jti: String,
    /// Session id (access tokens only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
}

impl Claims {
    /// The subject parsed as a numeric user id.
    pub fn subject_id(&self) -> Option<i64> {
        self.sub.parse().ok()
    }

    pub fn token_type(&self) -> TokenType {
        self.token_type
    }

    pub fn session_id(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    pub fn expires_at(&self) -> u64 {
        self.exp
    }
}

/// Result of minting a token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// The JWT token string
    pub token: String,
    /// JWT ID
    pub jti: String,
    /// Issued at timestamp (Unix seconds)
    pub issued_at: u64,
    /// Expiration timestamp (Unix seconds)
    pub expires_at: u64,
}

/// Signs and verifies tokens with the single configured HS256 secret.
#[derive(Clone)]
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenCodec {
    pub fn new(
        secret: &[u8],
        issuer: impl Into<String>,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        let issuer = issuer.into();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            issuer,
            access_ttl,
            refresh_ttl,
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            &config.jwt_secret,
            config.issuer.clone(),
            config.access_token_ttl,
            config.refresh_token_ttl,
        )
    }

    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// Mint a token with `iat = now` and `exp = now + ttl`.
    pub fn issue(
        &self,
        subject: &str,
        email: &str,
        roles: &[String],
        token_type: TokenType,
        ttl: Duration,
    ) -> Result<IssuedToken, TokenError> {
        self.issue_at(unix_now(), subject, email, roles, token_type, ttl)
    }

    /// Same as [`issue`](Self::issue) with an explicit clock.
    pub fn issue_at(
        &self,
        now: u64,
        subject: &str,
        email: &str,
        roles: &[String],
        token_type: TokenType,
        ttl: Duration,
    ) -> Result<IssuedToken, TokenError> {
        self.mint(now, subject, email, roles.to_vec(), token_type, ttl, None)
    }

    /// Mint an access token bound to a session.
    pub fn issue_access(
        &self,
        user_id: i64,
        email: &str,
        roles: &[String],
        session_id: &str,
    ) -> Result<IssuedToken, TokenError> {
        self.mint(
            unix_now(),
            &user_id.to_string(),
            email,
            roles.to_vec(),
            TokenType::Access,
            self.access_ttl,
            Some(session_id.to_string()),
        )
    }

    /// Mint a refresh token. Refresh tokens never carry roles.
    pub fn issue_refresh(&self, user_id: i64, email: &str) -> Result<IssuedToken, TokenError> {
        self.mint(
            unix_now(),
            &user_id.to_string(),
            email,
            Vec::new(),
            TokenType::Refresh,
            self.refresh_ttl,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn mint(
        &self,
        now: u64,
        subject: &str,
        email: &str,
        roles: Vec<String>,
        token_type: TokenType,
        ttl: Duration,
        sid: Option<String>,
    ) -> Result<IssuedToken, TokenError> {
        let jti = uuid::Uuid::new_v4().to_string();
        let exp = now + ttl.as_secs();

        let claims = Claims {
            sub: subject.to_string(),
            email: email.to_string(),
            roles,
            token_type,
            iss: self.issuer.clone(),
            iat: now,
            exp,
            jti: jti.clone(),
            sid,
        };

        let token = jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(TokenError::Encoding)?;

        Ok(IssuedToken {
            token,
            jti,
            issued_at: now,
            expires_at: exp,
        })
    }

    /// Decode and verify a token. Does not check the token type.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let token_data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(TokenError::from_jwt)?;

        // The library accepts exp == now; a token is only valid strictly before exp.
        if token_data.claims.exp <= unix_now() {
            return Err(TokenError::Expired);
        }

        Ok(token_data.claims)
    }

    /// Verify a token and require a specific type.
    pub fn verify_typed(&self, token: &str, expected: TokenType) -> Result<Claims, TokenError> {
        let claims = self.verify(token)?;
        if claims.token_type != expected {
            return Err(TokenError::WrongType);
        }
        Ok(claims)
    }
}

/// Errors that can occur during token operations.
///
/// Callers treat every verification failure the same way (authentication
/// denied); the variants exist for logging.
#[derive(Debug)]
pub enum TokenError {
    /// Signature does not match the configured secret
    BadSignature,
    /// Structurally invalid token or claims
    Malformed,
    /// Token is past its expiry
    Expired,
    /// Algorithm or header not supported
    UnsupportedFormat,
    /// Valid token of the wrong type (e.g., refresh token used as access token)
    WrongType,
    /// Error encoding the token
    Encoding(jsonwebtoken::errors::Error),
}

impl TokenError {
    fn from_jwt(e: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match e.kind() {
            ErrorKind::InvalidSignature => TokenError::BadSignature,
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidAlgorithmName
            | ErrorKind::MissingAlgorithm
            | ErrorKind::InvalidKeyFormat => TokenError::UnsupportedFormat,
            _ => TokenError::Malformed,
        }
    }
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::BadSignature => write!(f, "Token signature is invalid"),
            TokenError::Malformed => write!(f, "Token is malformed"),
            TokenError::Expired => write!(f, "Token has expired"),
            TokenError::UnsupportedFormat => write!(f, "Token format is not supported"),
            TokenError::WrongType => write!(f, "Wrong token type"),
            TokenError::Encoding(e) => write!(f, "Failed to encode token: {}", e),
        }
    }
}

impl std::error::Error for TokenError {}
