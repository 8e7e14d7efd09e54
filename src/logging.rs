//! Tracing setup and log hygiene helpers
//!
//! JSON output in production, pretty output in development. Phone numbers and
//! provider credentials must never reach the logs in clear text; use
//! [`mask_phone_number`] and [`redact_sensitive_data`] before logging them.

use std::env;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "staging" | "stage" => Self::Staging,
            _ => Self::Development,
        }
    }

    /// Detect environment from `ENVIRONMENT` (or `ENV`)
    pub fn from_env() -> Self {
        let value = env::var("ENVIRONMENT")
            .or_else(|_| env::var("ENV"))
            .unwrap_or_else(|_| "development".to_string());
        Self::parse(&value)
    }

    pub fn default_log_level(&self) -> Level {
        match self {
            Self::Development => Level::DEBUG,
            Self::Staging | Self::Production => Level::INFO,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Initialize the global tracing subscriber
///
/// # Environment Variables
/// - `ENVIRONMENT` or `ENV`: "production", "staging" or "development"
/// - `RUST_LOG`: overrides the default filter
/// - `LOG_FORMAT`: force "json" or "pretty"
pub fn init_tracing() {
    let environment = Environment::from_env();

    let use_json = env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or_else(|_| environment.is_production());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{}={},tower_http=info,sqlx=warn,hyper=warn,reqwest=warn",
            env!("CARGO_PKG_NAME").replace('-', "_"),
            environment.default_log_level()
        ))
    });

    if use_json {
        let json_layer = fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_level(true)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(json_layer).init();
    } else {
        let pretty_layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(env_filter);

        tracing_subscriber::registry().with(pretty_layer).init();
    }

    tracing::info!(
        environment = ?environment,
        format = if use_json { "json" } else { "pretty" },
        "Tracing initialized"
    );
}

/// Keep the country prefix and the last four digits of an MSISDN
///
/// ```
/// use topup_engine::logging::mask_phone_number;
/// assert_eq!(mask_phone_number("254712345678"), "2547****5678");
/// ```
pub fn mask_phone_number(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().collect();
    if digits.len() < 8 {
        return "****".to_string();
    }
    let head: String = digits[..4].iter().collect();
    let tail: String = digits[digits.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}

/// Redact credential-like fields from JSON-ish text before it is logged
pub fn redact_sensitive_data(text: &str) -> String {
    let sensitive_keys = [
        "password",
        "Password",
        "passkey",
        "secret",
        "consumer_secret",
        "access_token",
        "token",
        "authorization",
        "Authorization",
        "pin",
    ];

    let mut result = text.to_string();
    for key in &sensitive_keys {
        let pattern = format!(r#""{}"\s*:\s*"[^"]*""#, regex::escape(key));
        if let Ok(re) = regex::Regex::new(&pattern) {
            result = re
                .replace_all(&result, format!(r#""{}": "[REDACTED]""#, key))
                .to_string();
        }
    }
    result
}

/// Log a top-up lifecycle event with a consistent `event_type`
///
/// ```no_run
/// # use topup_engine::log_transaction;
/// log_transaction!(
///     event = "topup_completed",
///     transaction_id = "2b1f...",
///     amount = "1000",
/// );
/// ```
#[macro_export]
macro_rules! log_transaction {
    ($($key:tt = $value:expr),* $(,)?) => {
        tracing::info!(
            event_type = "transaction",
            $($key = tracing::field::display(&$value)),*
        );
    };
}
