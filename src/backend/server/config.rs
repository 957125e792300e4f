//! Server Configuration
//!
//! Configuration is loaded from environment variables with sensible
//! defaults for local development. Missing optional services (database,
//! push webhook) are logged and disabled rather than preventing startup.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{error, info, warn};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_FILE_MIB: u64 = 50;
const DEFAULT_UPLOAD_IDLE_SECS: u64 = 120;

/// Runtime configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub database_url: Option<String>,
    pub jwt_secret: String,
    pub uploads_dir: String,
    pub webhook_url: Option<String>,
    pub max_file_mib: u64,
    pub upload_idle_timeout: Duration,
}

impl ServerConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Self {
        let port = match std::env::var("SERVER_PORT") {
            Ok(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("SERVER_PORT is not a valid port, using {}", DEFAULT_PORT);
                DEFAULT_PORT
            }),
            Err(_) => DEFAULT_PORT,
        };

        let jwt_secret = std::env::var("JWT_SECRET").unwrap_or_else(|_| {
            warn!("JWT_SECRET not set, using an insecure development secret");
            "dev-secret-change-me".to_string()
        });

        let max_file_mib = std::env::var("MAX_FILE_SIZE_MB")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_MAX_FILE_MIB);

        let upload_idle_secs = std::env::var("UPLOAD_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_UPLOAD_IDLE_SECS);

        Self {
            port,
            database_url: std::env::var("DATABASE_URL").ok(),
            jwt_secret,
            uploads_dir: std::env::var("UPLOADS_DIR").unwrap_or_else(|_| "uploads".to_string()),
            webhook_url: std::env::var("PUSH_WEBHOOK_URL").ok(),
            max_file_mib,
            upload_idle_timeout: Duration::from_secs(upload_idle_secs),
        }
    }

    pub fn max_file_bytes(&self) -> u64 {
        self.max_file_mib * 1024 * 1024
    }
}

/// Connect to Postgres and run migrations.
///
/// Returns `None` when `DATABASE_URL` is unset or the connection fails;
/// the server then degrades to the in-memory store instead of refusing to
/// start.
pub async fn load_database(config: &ServerConfig) -> Option<PgPool> {
    let database_url = match &config.database_url {
        Some(url) => url,
        None => {
            warn!("DATABASE_URL not set. Falling back to the in-memory store.");
            return None;
        }
    };

    info!("Connecting to database...");
    let pool = match PgPoolOptions::new().max_connections(10).connect(database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to create database connection pool: {:?}", e);
            warn!("Falling back to the in-memory store.");
            return None;
        }
    };

    info!("Running database migrations...");
    match sqlx::migrate!().run(&pool).await {
        Ok(_) => info!("Database migrations completed successfully"),
        Err(e) => {
            error!("Failed to run database migrations: {}", e);
            warn!("Continuing without migrations - database might not be up to date");
        }
    }

    Some(pool)
}
