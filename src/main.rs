use authkit::auth::AuthService;
use authkit::cli::{
    Args, Command, build_config, generate_secret, init_logging, load_jwt_secret, open_database,
};
use authkit::db::Database;
use authkit::init_cleanup;
use authkit::token::unix_now;
use clap::Parser;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let command = args.command.clone().unwrap_or(Command::Run);

    // Needs neither a secret nor a database
    if command == Command::GenerateSecret {
        println!("{}", generate_secret());
        return;
    }

    init_logging(&args.log_format);

    let Some(jwt_secret) = load_jwt_secret(args.jwt_secret_file.as_deref()) else {
        std::process::exit(1);
    };

    let Some(config) = build_config(&args, jwt_secret) else {
        std::process::exit(1);
    };

    let Some(db) = open_database(&args.database).await else {
        std::process::exit(1);
    };

    let service = match AuthService::new(&config, &db) {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    let result = match command {
        Command::Run => {
            run(&service).await;
            Ok(())
        }
        Command::Sweep => service
            .blacklist()
            .sweep(unix_now())
            .await
            .map(|removed| println!("Removed {} expired blacklist entries", removed)),
        Command::Sessions { email } => list_sessions(&db, &service, &email).await,
        Command::RevokeSessions { email } => revoke_sessions(&db, &service, &email).await,
        Command::GenerateSecret => Ok(()),
    };

    db.close().await;

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        std::process::exit(1);
    }
}

async fn run(service: &AuthService) {
    let scheduler = init_cleanup(service).await;
    info!("Maintenance scheduler running, press Ctrl-C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }

    info!("Shutting down");
    scheduler.shutdown().await;
}

async fn list_sessions(
    db: &Database,
    service: &AuthService,
    email: &str,
) -> Result<(), sqlx::Error> {
    let Some(user) = db.users().get_by_email(email).await? else {
        println!("No user with email {}", email);
        return Ok(());
    };

    let sessions = service.sessions().list_active(user.id, None).await?;
    if sessions.is_empty() {
        println!("No active sessions for {}", user.email);
    }
    for session in sessions {
        println!(
            "{}  {:<8} {:<16} created {} expires {}",
            session.id,
            session.device,
            session.ip_address.as_deref().unwrap_or("-"),
            session.created_at,
            session.expires_at
        );
    }
    Ok(())
}

async fn revoke_sessions(
    db: &Database,
    service: &AuthService,
    email: &str,
) -> Result<(), sqlx::Error> {
    let Some(user) = db.users().get_by_email(email).await? else {
        println!("No user with email {}", email);
        return Ok(());
    };

    let revoked = service.sessions().revoke_all(user.id).await?;
    info!(user_id = user.id, revoked, "Revoked sessions");
    println!("Revoked {} sessions for {}", revoked, user.email);
    Ok(())
}
