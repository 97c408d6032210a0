//! Authentication flows.
//!
//! `AuthService` composes the token codec, blacklist, session limiter, rate
//! limiter, user store and password hasher. It holds no global state: every
//! collaborator is passed in, and clones share them.

use std::sync::Arc;
use tracing::{debug, info};

use super::audit::{AuditSink, AuthEvent, TracingAuditSink};
use super::errors::{AuthError, ResultExt};
use super::password::PasswordHasher;
use super::types::{
    AuthResponse, ChangePasswordRequest, ClientInfo, FederatedProfile, Principal,
    RefreshRequest, SetPasswordRequest, SignInRequest, SignUpRequest, TokenResponse, UserView,
};
use crate::blacklist::TokenBlacklist;
use crate::config::{AuthConfig, ConfigError};
use crate::db::{Database, NewUser, User};
use crate::rate_limit::RateLimiter;
use crate::sessions::{NewSession, SessionLimiter, SessionView};
use crate::token::{Claims, TokenCodec, TokenType, unix_now};

/// Collaborators for [`AuthService::from_parts`].
pub struct AuthComponents {
    pub db: Database,
    pub codec: TokenCodec,
    pub blacklist: TokenBlacklist,
    pub sessions: SessionLimiter,
    pub rate_limiter: RateLimiter,
    pub hasher: PasswordHasher,
    pub audit: Arc<dyn AuditSink>,
    pub rotate_refresh_tokens: bool,
}

#[derive(Clone)]
pub struct AuthService {
    db: Database,
    codec: TokenCodec,
    blacklist: TokenBlacklist,
    sessions: SessionLimiter,
    rate_limiter: RateLimiter,
    hasher: PasswordHasher,
    audit: Arc<dyn AuditSink>,
    rotate_refresh_tokens: bool,
}

impl AuthService {
    /// Validate `config` and wire the default collaborators around `db`.
    pub fn new(config: &AuthConfig, db: &Database) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_parts(AuthComponents {
            db: db.clone(),
            codec: TokenCodec::from_config(config),
            blacklist: TokenBlacklist::new(db),
            sessions: SessionLimiter::new(db, config.max_sessions_per_user),
            rate_limiter: RateLimiter::new(config.rate_limit),
            hasher: PasswordHasher::default(),
            audit: Arc::new(TracingAuditSink),
            rotate_refresh_tokens: config.rotate_refresh_tokens,
        }))
    }

    pub fn from_parts(parts: AuthComponents) -> Self {
        Self {
            db: parts.db,
            codec: parts.codec,
            blacklist: parts.blacklist,
            sessions: parts.sessions,
            rate_limiter: parts.rate_limiter,
            hasher: parts.hasher,
            audit: parts.audit,
            rotate_refresh_tokens: parts.rotate_refresh_tokens,
        }
    }

    pub fn with_password_hasher(mut self, hasher: PasswordHasher) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn blacklist(&self) -> &TokenBlacklist {
        &self.blacklist
    }

    pub fn sessions(&self) -> &SessionLimiter {
        &self.sessions
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    fn check_rate_limit(&self, client: &ClientInfo) -> Result<(), AuthError> {
        if self.rate_limiter.try_consume(&client.ip_address) {
            return Ok(());
        }
        self.audit.record(&AuthEvent::RateLimited {
            identity: client.ip_address.clone(),
        });
        Err(AuthError::TooManyRequests)
    }

    /// Open a session for `user` and mint its token pair.
    async fn start_session(
        &self,
        user: &User,
        client: &ClientInfo,
    ) -> Result<(AuthResponse, String), AuthError> {
        // The session row holds the refresh token, so it is minted first
        let refresh = self
            .codec
            .issue_refresh(user.id, &user.email)
            .map_err(|e| AuthError::internal("Failed to issue refresh token", e))?;

        let session = self
            .sessions
            .open_session(
                user.id,
                NewSession {
                    token: refresh.token.clone(),
                    expires_at: refresh.expires_at,
                    user_agent: client.user_agent.clone(),
                    ip_address: Some(client.ip_address.clone()),
                },
            )
            .await
            .db_err("Failed to open session")?;

        let access = self
            .codec
            .issue_access(user.id, &user.email, &user.role.token_roles(), &session.id)
            .map_err(|e| AuthError::internal("Failed to issue access token", e))?;

        let response = AuthResponse {
            user: UserView::from(user),
            access_token: access.token,
            refresh_token: Some(refresh.token),
        };
        Ok((response, session.id))
    }

    async fn load_user(&self, user_id: i64) -> Result<User, AuthError> {
        self.db
            .users()
            .get_by_id(user_id)
            .await
            .db_err("Failed to load user")?
            .ok_or(AuthError::NotFound)
    }

    /// Register a password account and sign it in.
    pub async fn sign_up(
        &self,
        request: SignUpRequest,
        client: &ClientInfo,
    ) -> Result<AuthResponse, AuthError> {
        self.check_rate_limit(client)?;

        let email = request.email.trim();
        let users = self.db.users();
        if users
            .email_exists(email)
            .await
            .db_err("Failed to check email")?
        {
            return Err(AuthError::DuplicateEmail);
        }

        let password_hash = self.hasher.hash_blocking(&request.password).await?;
        let nickname = request
            .nickname
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| default_nickname(email));

        let user_id = users
            .create(&NewUser {
                email: email.to_string(),
                nickname,
                password_hash: Some(password_hash),
                profile_image_url: None,
            })
            .await
            .map_err(map_create_error)?;
        let user = self.load_user(user_id).await?;

        let (response, _) = self.start_session(&user, client).await?;
        self.audit.record(&AuthEvent::SignedUp { user_id });
        Ok(response)
    }

    /// Authenticate with email and password and open a new session.
    pub async fn sign_in(
        &self,
        request: SignInRequest,
        client: &ClientInfo,
    ) -> Result<AuthResponse, AuthError> {
        self.check_rate_limit(client)?;

        let user = self
            .db
            .users()
            .get_by_email(request.email.trim())
            .await
            .db_err("Failed to look up user")?;

        // Unknown and passwordless accounts cost one verification too
        let verified = match user.as_ref().and_then(|u| u.password_hash.as_deref()) {
            Some(hash) => self.hasher.verify_blocking(&request.password, hash).await?,
            None => {
                self.hasher
                    .verify_missing_blocking(&request.password)
                    .await?
            }
        };

        let Some(user) = user.filter(|_| verified) else {
            self.audit.record(&AuthEvent::SignInFailed {
                identity: client.ip_address.clone(),
            });
            return Err(AuthError::InvalidCredentials);
        };

        let (response, session_id) = self.start_session(&user, client).await?;
        self.audit.record(&AuthEvent::SignedIn {
            user_id: user.id,
            session_id,
        });
        Ok(response)
    }

    /// Exchange a refresh token for a new access token, rotating the refresh
    /// token when enabled.
    pub async fn refresh(
        &self,
        request: RefreshRequest,
        client: &ClientInfo,
    ) -> Result<TokenResponse, AuthError> {
        self.check_rate_limit(client)?;

        let presented = request.refresh_token.as_str();
        let claims = self.verify_token(presented, TokenType::Refresh)?;
        let user_id = claims.subject_id().ok_or(AuthError::InvalidToken)?;

        if self
            .blacklist
            .is_blacklisted(presented)
            .await
            .db_err("Blacklist lookup failed")?
        {
            debug!(user_id, "Refresh token is blacklisted");
            return Err(AuthError::InvalidToken);
        }

        let Some(session) = self
            .sessions
            .find_by_token(presented)
            .await
            .db_err("Failed to look up session")?
        else {
            self.audit.record(&AuthEvent::RefreshReuse { user_id });
            return Err(AuthError::InvalidToken);
        };

        if session.user_id != user_id || !session.is_usable_at(unix_now() as i64) {
            debug!(user_id, session_id = %session.id, "Session revoked or expired");
            return Err(AuthError::InvalidToken);
        }

        let user = match self.load_user(user_id).await {
            Err(AuthError::NotFound) => return Err(AuthError::InvalidToken),
            other => other?,
        };

        let refresh_token = if self.rotate_refresh_tokens {
            let next = self
                .codec
                .issue_refresh(user.id, &user.email)
                .map_err(|e| AuthError::internal("Failed to issue refresh token", e))?;
            let swapped = self
                .sessions
                .rotate(&session.id, presented, &next.token, next.expires_at)
                .await
                .db_err("Failed to rotate refresh token")?;
            if !swapped {
                // A concurrent refresh or a revocation got there first
                debug!(user_id, session_id = %session.id, "Refresh token rotation lost");
                return Err(AuthError::InvalidToken);
            }
            next.token
        } else {
            request.refresh_token.clone()
        };

        let access = self
            .codec
            .issue_access(user.id, &user.email, &user.role.token_roles(), &session.id)
            .map_err(|e| AuthError::internal("Failed to issue access token", e))?;

        if request.revoke_other_sessions {
            let count = self
                .sessions
                .revoke_all_others(user.id, &refresh_token)
                .await
                .db_err("Failed to revoke other sessions")?;
            self.audit
                .record(&AuthEvent::OtherSessionsRevoked { user_id, count });
        }

        self.audit.record(&AuthEvent::Refreshed {
            user_id,
            session_id: session.id,
        });

        Ok(TokenResponse {
            access_token: access.token,
            refresh_token,
            token_type: "Bearer",
            expires_in: self.codec.access_ttl().as_secs(),
        })
    }

    /// Resolve an access token to the calling principal.
    pub async fn authenticate(&self, access_token: &str) -> Result<Principal, AuthError> {
        let claims = self.verify_token(access_token, TokenType::Access)?;
        let user_id = claims.subject_id().ok_or(AuthError::InvalidToken)?;

        if self
            .blacklist
            .is_blacklisted(access_token)
            .await
            .db_err("Blacklist lookup failed")?
        {
            debug!(user_id, "Access token is blacklisted");
            return Err(AuthError::InvalidToken);
        }

        Ok(Principal { user_id, claims })
    }

    /// End a session. With a valid access token of `user_id`, the token is
    /// blacklisted until it expires and its session revoked. Without one,
    /// every session of the user is revoked. Returns the sessions revoked.
    pub async fn sign_out(
        &self,
        user_id: i64,
        access_token: Option<&str>,
    ) -> Result<u64, AuthError> {
        let claims = access_token.and_then(|token| {
            self.verify_token(token, TokenType::Access)
                .ok()
                .filter(|claims| claims.subject_id() == Some(user_id))
                .map(|claims| (token, claims))
        });

        let revoked = match claims {
            Some((token, claims)) => {
                self.blacklist
                    .add(token, claims.expires_at())
                    .await
                    .db_err("Failed to blacklist token")?;
                match claims.session_id() {
                    Some(session_id) => {
                        let revoked = self
                            .sessions
                            .revoke(user_id, session_id)
                            .await
                            .db_err("Failed to revoke session")?;
                        u64::from(revoked)
                    }
                    None => 0,
                }
            }
            None => self
                .sessions
                .revoke_all(user_id)
                .await
                .db_err("Failed to revoke sessions")?,
        };

        self.audit.record(&AuthEvent::SignedOut {
            user_id,
            sessions_revoked: revoked,
        });
        Ok(revoked)
    }

    /// Blacklist any verifiable token until its expiry.
    pub async fn revoke_token(&self, token: &str) -> Result<(), AuthError> {
        let claims = self.codec.verify(token).map_err(|e| {
            debug!("Token revocation rejected: {}", e);
            AuthError::InvalidToken
        })?;

        self.blacklist
            .add(token, claims.expires_at())
            .await
            .db_err("Failed to blacklist token")?;

        self.audit.record(&AuthEvent::TokenRevoked {
            user_id: claims.subject_id(),
        });
        Ok(())
    }

    pub async fn list_sessions(
        &self,
        principal: &Principal,
    ) -> Result<Vec<SessionView>, AuthError> {
        self.sessions
            .list_active(principal.user_id, principal.session_id())
            .await
            .db_err("Failed to list sessions")
    }

    /// Revoke one of the caller's sessions.
    pub async fn revoke_session(
        &self,
        principal: &Principal,
        session_id: &str,
    ) -> Result<bool, AuthError> {
        let revoked = self
            .sessions
            .revoke(principal.user_id, session_id)
            .await
            .db_err("Failed to revoke session")?;
        if !revoked {
            return Err(AuthError::NotFound);
        }

        self.audit.record(&AuthEvent::SessionRevoked {
            user_id: principal.user_id,
            session_id: session_id.to_string(),
        });
        Ok(true)
    }

    /// Revoke every session of the caller except the current one.
    pub async fn revoke_other_sessions(&self, principal: &Principal) -> Result<u64, AuthError> {
        let count = self.revoke_others_of(principal).await?;
        self.audit.record(&AuthEvent::OtherSessionsRevoked {
            user_id: principal.user_id,
            count,
        });
        Ok(count)
    }

    async fn revoke_others_of(&self, principal: &Principal) -> Result<u64, AuthError> {
        let current = match principal.session_id() {
            Some(session_id) => self
                .sessions
                .get(session_id)
                .await
                .db_err("Failed to load session")?
                .filter(|s| s.user_id == principal.user_id && !s.revoked),
            None => None,
        };

        let result = match current {
            Some(session) => {
                self.sessions
                    .revoke_all_others(principal.user_id, &session.token)
                    .await
            }
            None => self.sessions.revoke_all(principal.user_id).await,
        };
        result.db_err("Failed to revoke sessions")
    }

    /// Change the password of an account that has one. Revokes every other
    /// session on success.
    pub async fn change_password(
        &self,
        principal: &Principal,
        request: ChangePasswordRequest,
    ) -> Result<(), AuthError> {
        let user = self.load_user(principal.user_id).await?;
        let Some(current_hash) = user.password_hash.as_deref() else {
            return Err(AuthError::NoPasswordSet);
        };
        if request.new_password != request.confirm_password {
            return Err(AuthError::PasswordMismatch);
        }
        if !self
            .hasher
            .verify_blocking(&request.current_password, current_hash)
            .await?
        {
            return Err(AuthError::InvalidCurrentPassword);
        }

        let hash = self.hasher.hash_blocking(&request.new_password).await?;
        self.db
            .users()
            .set_password_hash(user.id, &hash)
            .await
            .db_err("Failed to update password")?;

        let revoked = self.revoke_others_of(principal).await?;
        info!(user_id = user.id, revoked, "Password changed");
        self.audit
            .record(&AuthEvent::PasswordChanged { user_id: user.id });
        Ok(())
    }

    /// Give a passwordless (federated) account its first password.
    pub async fn set_password(
        &self,
        principal: &Principal,
        request: SetPasswordRequest,
    ) -> Result<(), AuthError> {
        let user = self.load_user(principal.user_id).await?;
        if user.has_password() {
            return Err(AuthError::PasswordAlreadySet);
        }
        if request.new_password != request.confirm_password {
            return Err(AuthError::PasswordMismatch);
        }

        let hash = self.hasher.hash_blocking(&request.new_password).await?;
        self.db
            .users()
            .set_password_hash(user.id, &hash)
            .await
            .db_err("Failed to set password")?;

        self.audit.record(&AuthEvent::PasswordSet { user_id: user.id });
        Ok(())
    }

    /// Sign in with an identity asserted by an external provider, creating a
    /// passwordless account on first use.
    pub async fn federated_sign_in(
        &self,
        profile: FederatedProfile,
        client: &ClientInfo,
    ) -> Result<AuthResponse, AuthError> {
        self.check_rate_limit(client)?;

        let users = self.db.users();
        let existing = users
            .get_by_provider(&profile.provider, &profile.provider_id)
            .await
            .db_err("Failed to look up federated user")?;

        let (user, created) = match existing {
            Some(user) => (user, false),
            None => {
                let email = profile.email.trim();
                if users
                    .email_exists(email)
                    .await
                    .db_err("Failed to check email")?
                {
                    return Err(AuthError::DuplicateEmail);
                }

                let nickname = profile
                    .nickname
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| default_nickname(email));
                let user_id = users
                    .create_federated(
                        &NewUser {
                            email: email.to_string(),
                            nickname,
                            password_hash: None,
                            profile_image_url: profile.profile_image_url,
                        },
                        &profile.provider,
                        &profile.provider_id,
                    )
                    .await
                    .map_err(map_create_error)?;
                (self.load_user(user_id).await?, true)
            }
        };

        let (response, _) = self.start_session(&user, client).await?;
        self.audit.record(&AuthEvent::FederatedSignIn {
            user_id: user.id,
            provider: profile.provider,
            created,
        });
        Ok(response)
    }

    pub async fn current_user(&self, principal: &Principal) -> Result<UserView, AuthError> {
        let user = self.load_user(principal.user_id).await?;
        Ok(UserView::from(&user))
    }

    fn verify_token(&self, token: &str, expected: TokenType) -> Result<Claims, AuthError> {
        self.codec.verify_typed(token, expected).map_err(|e| {
            debug!(expected = expected.as_str(), "Token rejected: {}", e);
            AuthError::InvalidToken
        })
    }
}

/// Nickname for accounts that did not provide one: the email's local part.
fn default_nickname(email: &str) -> String {
    email
        .split('@')
        .next()
        .filter(|local| !local.is_empty())
        .unwrap_or(email)
        .to_string()
}

fn map_create_error(e: sqlx::Error) -> AuthError {
    match &e {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => AuthError::DuplicateEmail,
        _ => AuthError::storage("Failed to create user", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::IssuedToken;
    use std::time::Duration;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    async fn setup() -> (Database, AuthService) {
        let db = Database::open(":memory:").await.unwrap();
        let service = AuthService::new(&AuthConfig::new(SECRET), &db)
            .unwrap()
            .with_password_hasher(PasswordHasher::insecure_fast());
        (db, service)
    }

    fn client() -> ClientInfo {
        ClientInfo::new("127.0.0.1", Some("Mozilla/5.0 (X11; Linux x86_64)"))
    }

    fn sign_up_request(email: &str) -> SignUpRequest {
        SignUpRequest {
            email: email.to_string(),
            password: "hunter22".to_string(),
            nickname: None,
        }
    }

    #[test]
    fn test_default_nickname() {
        assert_eq!(default_nickname("alice@example.com"), "alice");
        assert_eq!(default_nickname("@example.com"), "@example.com");
        assert_eq!(default_nickname("bob"), "bob");
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let db = Database::open(":memory:").await.unwrap();
        let result = AuthService::new(&AuthConfig::new(b"short".to_vec()), &db);
        assert!(matches!(result, Err(ConfigError::SecretTooShort(32))));
    }

    #[tokio::test]
    async fn test_sign_up_defaults_nickname_and_signs_in() {
        let (_db, service) = setup().await;

        let response = service
            .sign_up(sign_up_request("carol@example.com"), &client())
            .await
            .unwrap();
        assert_eq!(response.user.nickname, "carol");
        assert!(response.user.has_password);
        assert!(response.refresh_token.is_some());

        let principal = service.authenticate(&response.access_token).await.unwrap();
        assert_eq!(principal.user_id, response.user.id);
        assert_eq!(principal.roles(), ["USER".to_string()]);
        assert!(principal.session_id().is_some());
    }

    #[tokio::test]
    async fn test_refresh_token_is_not_an_access_token() {
        let (_db, service) = setup().await;
        let response = service
            .sign_up(sign_up_request("dave@example.com"), &client())
            .await
            .unwrap();
        let refresh = response.refresh_token.unwrap();

        assert!(matches!(
            service.authenticate(&refresh).await,
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(
            service
                .refresh(
                    RefreshRequest {
                        refresh_token: response.access_token,
                        revoke_other_sessions: false,
                    },
                    &client(),
                )
                .await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_refresh_without_rotation_keeps_token() {
        let db = Database::open(":memory:").await.unwrap();
        let mut config = AuthConfig::new(SECRET);
        config.rotate_refresh_tokens = false;
        let service = AuthService::new(&config, &db)
            .unwrap()
            .with_password_hasher(PasswordHasher::insecure_fast());

        let response = service
            .sign_up(sign_up_request("erin@example.com"), &client())
            .await
            .unwrap();
        let refresh = response.refresh_token.unwrap();

        for _ in 0..2 {
            let tokens = service
                .refresh(
                    RefreshRequest {
                        refresh_token: refresh.clone(),
                        revoke_other_sessions: false,
                    },
                    &client(),
                )
                .await
                .unwrap();
            assert_eq!(tokens.refresh_token, refresh);
            assert_eq!(tokens.token_type, "Bearer");
            assert_eq!(tokens.expires_in, 30 * 60);
        }
    }

    #[tokio::test]
    async fn test_refresh_rejects_expired_session() {
        let (db, service) = setup().await;
        let response = service
            .sign_up(sign_up_request("frank@example.com"), &client())
            .await
            .unwrap();
        let user_id = response.user.id;

        // A token valid for an hour bound to a session that has already expired
        let IssuedToken { token, .. } = service
            .codec()
            .issue(
                &user_id.to_string(),
                "frank@example.com",
                &[],
                TokenType::Refresh,
                Duration::from_secs(3600),
            )
            .unwrap();
        let session = service
            .sessions()
            .open_session(
                user_id,
                NewSession {
                    token: token.clone(),
                    expires_at: unix_now() - 1,
                    user_agent: None,
                    ip_address: None,
                },
            )
            .await
            .unwrap();
        assert!(!session.is_usable_at(unix_now() as i64));
        assert_eq!(db.sessions().count_active(user_id).await.unwrap(), 2);

        let result = service
            .refresh(
                RefreshRequest {
                    refresh_token: token,
                    revoke_other_sessions: false,
                },
                &client(),
            )
            .await;
        assert!(matches!(result, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn test_sign_out_with_foreign_token_revokes_all() {
        let (db, service) = setup().await;
        let alice = service
            .sign_up(sign_up_request("alice@example.com"), &client())
            .await
            .unwrap();
        let bob = service
            .sign_up(sign_up_request("bob@example.com"), &client())
            .await
            .unwrap();

        // Bob's token does not belong to Alice: it is ignored, not blacklisted
        let revoked = service
            .sign_out(alice.user.id, Some(&bob.access_token))
            .await
            .unwrap();
        assert_eq!(revoked, 1);
        assert!(service.authenticate(&bob.access_token).await.is_ok());
        assert_eq!(db.sessions().count_active(alice.user.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_revoke_token_blacklists_refresh_token() {
        let (_db, service) = setup().await;
        let response = service
            .sign_up(sign_up_request("gina@example.com"), &client())
            .await
            .unwrap();
        let refresh = response.refresh_token.unwrap();

        service.revoke_token(&refresh).await.unwrap();
        assert!(service.blacklist().is_blacklisted(&refresh).await.unwrap());

        let result = service
            .refresh(
                RefreshRequest {
                    refresh_token: refresh,
                    revoke_other_sessions: false,
                },
                &client(),
            )
            .await;
        assert!(matches!(result, Err(AuthError::InvalidToken)));

        assert!(matches!(
            service.revoke_token("garbage").await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_current_user() {
        let (_db, service) = setup().await;
        let response = service
            .sign_up(sign_up_request("hank@example.com"), &client())
            .await
            .unwrap();
        let principal = service.authenticate(&response.access_token).await.unwrap();

        let user = service.current_user(&principal).await.unwrap();
        assert_eq!(user, response.user);
    }
}
