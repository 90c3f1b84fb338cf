//! Worker configuration

use std::env;
use std::time::Duration;

/// Worker configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,

    /// Six-field cron (with seconds); defaults to 00:05 UTC on the 1st
    pub rollover_cron: String,
    /// Catch up on a missed month at boot; rollover is idempotent
    pub rollover_on_startup: bool,

    pub event_replay_cron: String,
    /// Events younger than this are left to Stripe's own redelivery
    pub event_replay_grace: Duration,
    pub event_replay_batch: i64,

    pub resume_item_timeout: Duration,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),

            rollover_cron: env::var("ROLLOVER_CRON").unwrap_or_else(|_| "0 5 0 1 * *".to_string()),
            rollover_on_startup: env::var("ROLLOVER_ON_STARTUP")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),

            event_replay_cron: env::var("EVENT_REPLAY_CRON")
                .unwrap_or_else(|_| "0 */10 * * * *".to_string()),
            event_replay_grace: Duration::from_secs(parse_positive("EVENT_REPLAY_GRACE_SECS", 900)?),
            event_replay_batch: i64::try_from(parse_positive("EVENT_REPLAY_BATCH", 50)?)
                .map_err(|_| ConfigError::Invalid("EVENT_REPLAY_BATCH", "too large".to_string()))?,

            resume_item_timeout: Duration::from_secs(parse_positive("RESUME_ITEM_TIMEOUT_SECS", 30)?),
            log_json: env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        })
    }
}

fn parse_positive(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.parse::<u64>() {
            Ok(0) | Err(_) => Err(ConfigError::Invalid(key, raw)),
            Ok(value) => Ok(value),
        },
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static CONFIG_TEST_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();
        env::set_var("DATABASE_URL", "postgres://test");

        let config = Config::from_env().unwrap();
        assert_eq!(config.rollover_cron, "0 5 0 1 * *");
        assert_eq!(config.event_replay_cron, "0 */10 * * * *");
        assert_eq!(config.event_replay_grace, Duration::from_secs(900));
        assert_eq!(config.event_replay_batch, 50);
        assert!(config.rollover_on_startup);

        env::remove_var("DATABASE_URL");
    }

    #[test]
    fn test_rejects_zero_batch() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var("EVENT_REPLAY_BATCH", "0");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("EVENT_REPLAY_BATCH", _))
        ));

        env::remove_var("EVENT_REPLAY_BATCH");
        env::remove_var("DATABASE_URL");
    }
}
