use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub topup: TopUpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Shared counter store for rate limiting; in-process counters when unset
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopUpConfig {
    pub currency: String,
    pub daily_limit: Decimal,
    /// Offset of the business timezone from UTC, in minutes
    pub timezone_offset_minutes: i32,
    pub cancel_grace_minutes: i64,
    pub provider_timeout_secs: u64,
    pub credit_max_retries: u32,
    pub rate_limit_per_minute: i64,
}

impl TopUpConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}

fn var_or<T>(name: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow!("{} must be a valid value, got {:?}: {}", name, raw, e))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let server = ServerConfig {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .context("PORT not set")?
                .parse()
                .context("PORT must be a valid number")?,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        };

        let database = DatabaseConfig {
            url: env::var("DATABASE_URL").context("DATABASE_URL not set")?,
            max_connections: var_or("DATABASE_MAX_CONNECTIONS", "20")?,
        };

        let redis = RedisConfig {
            url: env::var("REDIS_URL").ok().filter(|url| !url.trim().is_empty()),
        };

        let topup = TopUpConfig {
            currency: env::var("TOPUP_CURRENCY").unwrap_or_else(|_| "KES".to_string()),
            daily_limit: var_or("TOPUP_DAILY_LIMIT", "1000000")?,
            timezone_offset_minutes: var_or("TOPUP_TIMEZONE_OFFSET_MINUTES", "180")?,
            cancel_grace_minutes: var_or("TOPUP_CANCEL_GRACE_MINUTES", "30")?,
            provider_timeout_secs: var_or("TOPUP_PROVIDER_TIMEOUT_SECS", "30")?,
            credit_max_retries: var_or("TOPUP_CREDIT_MAX_RETRIES", "3")?,
            rate_limit_per_minute: var_or("TOPUP_RATE_LIMIT_PER_MINUTE", "30")?,
        };

        let config = Config {
            server,
            database,
            redis,
            topup,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port < 1024 {
            return Err(anyhow!(
                "Port must be at least 1024, got {}",
                self.server.port
            ));
        }

        let valid_environments = ["development", "staging", "production"];
        if !valid_environments.contains(&self.server.environment.as_str()) {
            return Err(anyhow!(
                "Environment must be one of: {:?}, got {}",
                valid_environments,
                self.server.environment
            ));
        }

        if self.database.url.trim().is_empty() {
            return Err(anyhow!("DATABASE_URL cannot be empty"));
        }

        if self.database.max_connections == 0 {
            return Err(anyhow!("DATABASE_MAX_CONNECTIONS must be greater than 0"));
        }

        let currency = &self.topup.currency;
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(anyhow!(
                "TOPUP_CURRENCY must be a 3-letter ISO code, got {}",
                currency
            ));
        }

        if self.topup.daily_limit <= Decimal::ZERO {
            return Err(anyhow!("TOPUP_DAILY_LIMIT must be greater than 0"));
        }

        // chrono::FixedOffset accepts strictly less than one day
        if self.topup.timezone_offset_minutes.abs() >= 24 * 60 {
            return Err(anyhow!(
                "TOPUP_TIMEZONE_OFFSET_MINUTES must be within +/-1439, got {}",
                self.topup.timezone_offset_minutes
            ));
        }

        if self.topup.cancel_grace_minutes <= 0 {
            return Err(anyhow!("TOPUP_CANCEL_GRACE_MINUTES must be greater than 0"));
        }

        if self.topup.provider_timeout_secs == 0 {
            return Err(anyhow!("TOPUP_PROVIDER_TIMEOUT_SECS must be greater than 0"));
        }

        if self.topup.rate_limit_per_minute <= 0 {
            return Err(anyhow!("TOPUP_RATE_LIMIT_PER_MINUTE must be greater than 0"));
        }

        Ok(())
    }
}
