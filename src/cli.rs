//! CLI argument parsing, validation, and startup helpers.

use crate::config::{
    AuthConfig, DEFAULT_ISSUER, DEFAULT_MAX_SESSIONS_PER_USER, MIN_JWT_SECRET_LENGTH,
    RateLimitSettings,
};
use crate::db::Database;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use clap::{Parser, Subcommand};
use rand::RngCore;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(clap::ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "authkit",
    about = "Token lifecycle and session control for authentication services"
)]
pub struct Args {
    /// Path to SQLite database file
    #[arg(short, long, env = "AUTHKIT_DATABASE", default_value = "authkit.db")]
    pub database: String,

    /// Path to file containing JWT secret. Prefer using JWT_SECRET env var instead
    #[arg(long, env = "AUTHKIT_JWT_SECRET_FILE")]
    pub jwt_secret_file: Option<String>,

    /// Issuer written to and required on every token
    #[arg(long, env = "AUTHKIT_ISSUER", default_value = DEFAULT_ISSUER)]
    pub issuer: String,

    /// Access token lifetime in minutes
    #[arg(long, env = "AUTHKIT_ACCESS_TTL_MINUTES", default_value = "30")]
    pub access_ttl_minutes: u64,

    /// Refresh token lifetime in hours
    #[arg(long, env = "AUTHKIT_REFRESH_TTL_HOURS", default_value = "168")]
    pub refresh_ttl_hours: u64,

    /// Burst size of the per-IP rate limiter
    #[arg(long, env = "AUTHKIT_RATE_LIMIT_CAPACITY", default_value = "5")]
    pub rate_limit_capacity: u32,

    /// Tokens added back per refill window
    #[arg(long, env = "AUTHKIT_RATE_LIMIT_REFILL", default_value = "5")]
    pub rate_limit_refill: u32,

    /// Refill window in seconds
    #[arg(long, env = "AUTHKIT_RATE_LIMIT_WINDOW_SECS", default_value = "60")]
    pub rate_limit_window_secs: u64,

    /// Maximum concurrent sessions per user
    #[arg(long, env = "AUTHKIT_MAX_SESSIONS", default_value_t = DEFAULT_MAX_SESSIONS_PER_USER)]
    pub max_sessions: u32,

    /// Keep the same refresh token on refresh instead of rotating it
    #[arg(long, env = "AUTHKIT_NO_ROTATION")]
    pub no_rotation: bool,

    /// Log output format
    #[arg(short, long, env = "AUTHKIT_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run scheduled maintenance until interrupted (default)
    Run,
    /// Sweep expired blacklist entries once
    Sweep,
    /// List the active sessions of a user
    Sessions {
        #[arg(long)]
        email: String,
    },
    /// Revoke every session of a user
    RevokeSessions {
        #[arg(long)]
        email: String,
    },
    /// Print a random secret suitable for JWT_SECRET
    GenerateSecret,
}

/// Initialize logging based on the specified format.
/// The filter comes from `RUST_LOG` and defaults to `info`.
pub fn init_logging(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
    }
}

/// Load JWT secret from environment variable or file.
/// Returns None and logs an error if the secret cannot be loaded.
pub fn load_jwt_secret(jwt_secret_file: Option<&str>) -> Option<String> {
    let secret = if let Ok(secret) = std::env::var("JWT_SECRET") {
        // SAFETY: called during startup before the runtime spawns other
        // threads, and nothing else reads this variable.
        unsafe { std::env::remove_var("JWT_SECRET") };
        secret
    } else if let Some(path) = jwt_secret_file {
        match std::fs::read_to_string(path) {
            Ok(content) => content.trim().to_string(),
            Err(e) => {
                error!(path = %path, error = %e, "Failed to read JWT secret file");
                return None;
            }
        }
    } else {
        error!(
            "JWT secret is required. Set JWT_SECRET environment variable (recommended) or use --jwt-secret-file"
        );
        return None;
    };

    if secret.len() < MIN_JWT_SECRET_LENGTH {
        error!(
            "JWT secret is shorter than {} bytes. Run `authkit generate-secret` for one",
            MIN_JWT_SECRET_LENGTH
        );
        return None;
    }

    Some(secret)
}

/// Build and validate the auth configuration from arguments.
/// Returns None and logs an error if validation fails.
pub fn build_config(args: &Args, jwt_secret: String) -> Option<AuthConfig> {
    let config = AuthConfig {
        jwt_secret: jwt_secret.into_bytes(),
        issuer: args.issuer.clone(),
        access_token_ttl: Duration::from_secs(args.access_ttl_minutes.saturating_mul(60)),
        refresh_token_ttl: Duration::from_secs(args.refresh_ttl_hours.saturating_mul(60 * 60)),
        rate_limit: RateLimitSettings {
            capacity: args.rate_limit_capacity,
            refill_tokens: args.rate_limit_refill,
            refill_window: Duration::from_secs(args.rate_limit_window_secs),
        },
        max_sessions_per_user: args.max_sessions,
        rotate_refresh_tokens: !args.no_rotation,
    };

    match config.validate() {
        Ok(()) => Some(config),
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            None
        }
    }
}

/// Random 256-bit secret, base64url encoded without padding.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Open the database, logging errors if it fails.
pub async fn open_database(path: &str) -> Option<Database> {
    match Database::open(path).await {
        Ok(db) => {
            info!(path = %path, "Database opened");
            Some(db)
        }
        Err(e) => {
            error!(path = %path, error = %e, "Failed to open database");
            None
        }
    }
}
