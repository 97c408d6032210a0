//! Request, response and principal types for authentication flows.

use serde::{Deserialize, Serialize};

use crate::db::{User, UserRole};
use crate::token::Claims;

/// Where a request came from. `ip_address` is the rate-limit identity.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: String,
    pub user_agent: Option<String>,
}

impl ClientInfo {
    pub fn new(ip_address: impl Into<String>, user_agent: Option<&str>) -> Self {
        Self {
            ip_address: ip_address.into(),
            user_agent: user_agent.map(str::to_string),
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub nickname: Option<String>,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
    /// Revoke every other session of the user after refreshing
    #[serde(default)]
    pub revoke_other_sessions: bool,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
    pub confirm_password: String,
}

#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPasswordRequest {
    pub new_password: String,
    pub confirm_password: String,
}

/// Identity asserted by an external provider after a successful OAuth login.
#[derive(Debug, Clone)]
pub struct FederatedProfile {
    pub provider: String,
    pub provider_id: String,
    pub email: String,
    pub nickname: Option<String>,
    pub profile_image_url: Option<String>,
}

/// Public user representation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: i64,
    pub email: String,
    pub nickname: String,
    pub role: UserRole,
    pub profile_image_url: Option<String>,
    pub has_password: bool,
}

impl From<&User> for UserView {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            email: user.email.clone(),
            nickname: user.nickname.clone(),
            role: user.role,
            profile_image_url: user.profile_image_url.clone(),
            has_password: user.has_password(),
        }
    }
}

/// Result of sign-up and sign-in flows.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub user: UserView,
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// Result of a token refresh.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    /// Access token lifetime in seconds
    pub expires_in: u64,
}

/// Caller identity established from a verified access token.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: i64,
    pub claims: Claims,
}

impl Principal {
    pub fn session_id(&self) -> Option<&str> {
        self.claims.session_id()
    }

    pub fn email(&self) -> &str {
        &self.claims.email
    }

    pub fn roles(&self) -> &[String] {
        &self.claims.roles
    }

    pub fn has_role(&self, role: UserRole) -> bool {
        self.claims.roles.iter().any(|r| r == role.as_str())
    }
}
