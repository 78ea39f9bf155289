//! Application configuration loaded from environment variables.

use std::time::Duration;

use crate::errors::{AppError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the HTTP server
    pub api_port: u16,
    /// Shared secret the payment provider signs webhook bodies with
    pub webhook_secret: String,
    /// Bearer token required on admin routes
    pub admin_api_token: String,
    /// Business rules handed to the settlement engine
    pub settlement: SettlementConfig,
    /// Upper bound for a single settlement invocation
    pub settlement_timeout: Duration,
}

/// Amounts and limits the settlement engine is constructed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementConfig {
    /// Minimum payment that activates an account (integer currency units)
    pub registration_fee: i64,
    /// Credit paid to an active referrer when a referred user activates
    pub referral_bonus: i64,
    /// Conflicting attempts allowed on the project update before giving up
    pub project_txn_max_retries: u32,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            registration_fee: 20_000,
            referral_bonus: 4_000,
            project_txn_max_retries: 5,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = SettlementConfig::default();

        let webhook_secret = env_var("WEBHOOK_SECRET").map_err(|_| {
            AppError::Config("WEBHOOK_SECRET environment variable is required".to_string())
        })?;
        let admin_api_token = env_var("ADMIN_API_TOKEN").map_err(|_| {
            AppError::Config("ADMIN_API_TOKEN environment variable is required".to_string())
        })?;
        if admin_api_token.trim().is_empty() {
            return Err(AppError::Config("ADMIN_API_TOKEN must not be empty".to_string()));
        }

        let settlement = SettlementConfig {
            registration_fee: parse_or("REGISTRATION_FEE", defaults.registration_fee)?,
            referral_bonus: parse_or("REFERRAL_BONUS", defaults.referral_bonus)?,
            project_txn_max_retries: parse_or(
                "PROJECT_TXN_MAX_RETRIES",
                defaults.project_txn_max_retries,
            )?,
        };
        if settlement.registration_fee <= 0 {
            return Err(AppError::Config("REGISTRATION_FEE must be positive".to_string()));
        }
        if settlement.referral_bonus < 0 {
            return Err(AppError::Config("REFERRAL_BONUS must not be negative".to_string()));
        }

        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./settlement.db".to_string()),
            api_port: parse_or("API_PORT", 3002)?,
            webhook_secret,
            admin_api_token,
            settlement,
            settlement_timeout: Duration::from_secs(parse_or("SETTLEMENT_TIMEOUT_SECS", 10u64)?),
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| AppError::Config(format!("Missing env var: {key}")))
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}
