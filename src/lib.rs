pub mod auth;
pub mod blacklist;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod db;
pub mod rate_limit;
pub mod sessions;
pub mod token;

use auth::AuthService;
use cleanup::CleanupScheduler;

/// Run cleanup tasks once and spawn the background scheduler.
/// Stop the returned scheduler with [`CleanupScheduler::shutdown`].
pub async fn init_cleanup(service: &AuthService) -> CleanupScheduler {
    cleanup::run_cleanup(service.blacklist(), service.rate_limiter()).await;
    cleanup::spawn_cleanup_scheduler(service.blacklist().clone(), service.rate_limiter().clone())
}
