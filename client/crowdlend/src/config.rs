//! Application configuration loaded from environment variables.

use std::time::Duration;

use crate::errors::{ClientError, Result};
use crate::payment::VerifyPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    /// REST API root including the `/api` prefix (e.g. http://localhost:8000/api)
    pub api_base_url: String,
    /// SQLite database holding the session credentials
    pub session_db_url: String,
    /// Per-request timeout for outbound HTTP calls
    pub request_timeout_secs: u64,
    /// Wait before the first investment verification
    pub invest_verify_delay_secs: u64,
    /// Wait before the first repayment verification
    pub repay_verify_delay_secs: u64,
    /// Total verification checks per payment; `1` is a single check
    pub verify_max_attempts: u32,
    /// First gap between verification checks when polling
    pub verify_retry_interval_secs: u64,
    /// Upper bound for the doubling gap between checks
    pub verify_max_retry_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_base_url: "http://localhost:8000/api".to_string(),
            session_db_url: "sqlite:./crowdlend_session.db".to_string(),
            request_timeout_secs: 30,
            invest_verify_delay_secs: 30,
            repay_verify_delay_secs: 20,
            verify_max_attempts: 1,
            verify_retry_interval_secs: 5,
            verify_max_retry_interval_secs: 60,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();
        let config = Config {
            api_base_url: env_var("API_BASE_URL").unwrap_or(defaults.api_base_url),
            session_db_url: env_var("SESSION_DB_URL").unwrap_or(defaults.session_db_url),
            request_timeout_secs: parse_or("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs)?,
            invest_verify_delay_secs: parse_or(
                "INVEST_VERIFY_DELAY_SECS",
                defaults.invest_verify_delay_secs,
            )?,
            repay_verify_delay_secs: parse_or(
                "REPAY_VERIFY_DELAY_SECS",
                defaults.repay_verify_delay_secs,
            )?,
            verify_max_attempts: parse_or("VERIFY_MAX_ATTEMPTS", defaults.verify_max_attempts)?,
            verify_retry_interval_secs: parse_or(
                "VERIFY_RETRY_INTERVAL_SECS",
                defaults.verify_retry_interval_secs,
            )?,
            verify_max_retry_interval_secs: parse_or(
                "VERIFY_MAX_RETRY_INTERVAL_SECS",
                defaults.verify_max_retry_interval_secs,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.api_base_url.starts_with("http://") && !self.api_base_url.starts_with("https://") {
            return Err(ClientError::Config(format!(
                "API_BASE_URL must be an http(s) URL, got {}",
                self.api_base_url
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(ClientError::Config(
                "REQUEST_TIMEOUT_SECS must be at least 1".to_string(),
            ));
        }
        if self.verify_max_attempts == 0 {
            return Err(ClientError::Config(
                "VERIFY_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn invest_policy(&self) -> VerifyPolicy {
        self.policy(self.invest_verify_delay_secs)
    }

    pub fn repay_policy(&self) -> VerifyPolicy {
        self.policy(self.repay_verify_delay_secs)
    }

    fn policy(&self, delay_secs: u64) -> VerifyPolicy {
        VerifyPolicy::single(Duration::from_secs(delay_secs)).with_polling(
            self.verify_max_attempts,
            Duration::from_secs(self.verify_retry_interval_secs),
            Duration::from_secs(self.verify_max_retry_interval_secs),
        )
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| ClientError::Config(format!("Missing env var: {key}")))
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ClientError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}
