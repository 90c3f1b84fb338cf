//! Application configuration

use std::env;
use std::time::Duration;

/// Minimum length accepted for the operator bearer token
const MIN_OPERATOR_TOKEN_LEN: usize = 32;

/// Application configuration loaded from environment variables
///
/// Stripe and email settings are read by the billing crate itself
/// (`StripeConfig::from_env`, `EmailConfig::from_env`).
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,

    // Operator access
    pub operator_api_token: String,

    // Resume engine
    pub resume_item_timeout: Duration,

    // Logging
    pub log_json: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),
            run_migrations: env::var("RUN_MIGRATIONS")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),

            // Operator access
            operator_api_token: {
                let token = env::var("OPERATOR_API_TOKEN")
                    .map_err(|_| ConfigError::Missing("OPERATOR_API_TOKEN"))?;
                if token.len() < MIN_OPERATOR_TOKEN_LEN {
                    return Err(ConfigError::WeakSecret(
                        "OPERATOR_API_TOKEN must be at least 32 characters",
                    ));
                }
                token
            },

            // Resume engine
            resume_item_timeout: {
                let raw = env::var("RESUME_ITEM_TIMEOUT_SECS").unwrap_or_else(|_| "30".to_string());
                let secs: u64 = raw
                    .parse()
                    .map_err(|_| ConfigError::Invalid("RESUME_ITEM_TIMEOUT_SECS", raw.clone()))?;
                if secs == 0 {
                    return Err(ConfigError::Invalid("RESUME_ITEM_TIMEOUT_SECS", raw));
                }
                Duration::from_secs(secs)
            },

            // Logging
            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
