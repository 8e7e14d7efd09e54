//! Application error taxonomy
//!
//! Every fallible operation that crosses a module boundary returns [`AppResult`].
//! Errors are grouped by who can act on them:
//!
//! - `Domain`: business rule rejections the user can correct (surfaced verbatim)
//! - `Validation`: malformed input
//! - `External`: payment provider and network failures (generic message to clients,
//!   full detail in logs)
//! - `Infrastructure`: database, cache and configuration failures

use crate::database::error::DatabaseError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Clone, Error)]
#[error("{kind}")]
pub struct AppError {
    pub kind: AppErrorKind,
}

#[derive(Debug, Clone, Error)]
pub enum AppErrorKind {
    #[error(transparent)]
    Domain(DomainError),
    #[error(transparent)]
    Validation(ValidationError),
    #[error(transparent)]
    External(ExternalError),
    #[error(transparent)]
    Infrastructure(InfrastructureError),
}

#[derive(Debug, Clone, Error)]
pub enum DomainError {
    #[error("Invalid amount {amount}: {reason}")]
    InvalidAmount { amount: String, reason: String },

    #[error("Daily top-up limit of {limit} exceeded: {spent_today} already used today, {attempted} requested")]
    DailyLimitExceeded {
        limit: String,
        spent_today: String,
        attempted: String,
    },

    #[error("Transaction {transaction_id} not found")]
    TransactionNotFound { transaction_id: String },

    #[error("No wallet found for this account")]
    WalletNotFound { user_id: String },

    #[error("Wallet cannot receive top-ups: {reason}")]
    WalletUnavailable { user_id: String, reason: String },

    #[error("Transaction {transaction_id} cannot be cancelled: {reason}")]
    NotCancellable {
        transaction_id: String,
        reason: String,
    },

    #[error("Invalid callback signature")]
    InvalidSignature { rail: String },

    #[error("Payment rail {rail} is not available")]
    RailUnavailable { rail: String },

    #[error("Too many requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Invalid phone number: {value}")]
    InvalidPhoneNumber { value: String },

    #[error("Payment details do not match the {rail} rail")]
    RailInputMismatch { rail: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidParameter { field: String, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum ExternalError {
    #[error("{provider} error: {message}")]
    PaymentProvider {
        provider: String,
        message: String,
        is_retryable: bool,
    },

    #[error("{service} did not respond within {timeout_secs}s")]
    Timeout { service: String, timeout_secs: u64 },

    #[error("{service} rate limited the request")]
    RateLimit {
        service: String,
        retry_after: Option<u64>,
    },
}

#[derive(Debug, Clone, Error)]
pub enum InfrastructureError {
    #[error("Database error: {message}")]
    Database { message: String, is_retryable: bool },

    #[error("Cache error: {message}")]
    Cache { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self { kind }
    }

    pub fn domain(error: DomainError) -> Self {
        Self::new(AppErrorKind::Domain(error))
    }

    pub fn validation(error: ValidationError) -> Self {
        Self::new(AppErrorKind::Validation(error))
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Infrastructure(
            InfrastructureError::Configuration {
                message: message.into(),
            },
        ))
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>, is_retryable: bool) -> Self {
        Self::new(AppErrorKind::External(ExternalError::PaymentProvider {
            provider: provider.into(),
            message: message.into(),
            is_retryable,
        }))
    }

    pub fn status_code(&self) -> StatusCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InvalidAmount { .. } => StatusCode::BAD_REQUEST,
                DomainError::DailyLimitExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                DomainError::TransactionNotFound { .. } | DomainError::WalletNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                DomainError::WalletUnavailable { .. } => StatusCode::FORBIDDEN,
                DomainError::NotCancellable { .. } => StatusCode::CONFLICT,
                DomainError::InvalidSignature { .. } => StatusCode::UNAUTHORIZED,
                DomainError::RailUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                DomainError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            },
            AppErrorKind::Validation(_) => StatusCode::BAD_REQUEST,
            AppErrorKind::External(ExternalError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            AppErrorKind::External(_) => StatusCode::BAD_GATEWAY,
            AppErrorKind::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::InvalidAmount { .. } => "INVALID_AMOUNT",
                DomainError::DailyLimitExceeded { .. } => "DAILY_LIMIT_EXCEEDED",
                DomainError::TransactionNotFound { .. } => "TRANSACTION_NOT_FOUND",
                DomainError::WalletNotFound { .. } => "WALLET_NOT_FOUND",
                DomainError::WalletUnavailable { .. } => "WALLET_UNAVAILABLE",
                DomainError::NotCancellable { .. } => "NOT_CANCELLABLE",
                DomainError::InvalidSignature { .. } => "INVALID_SIGNATURE",
                DomainError::RailUnavailable { .. } => "RAIL_UNAVAILABLE",
                DomainError::RateLimited { .. } => "RATE_LIMITED",
            },
            AppErrorKind::Validation(_) => "VALIDATION_ERROR",
            AppErrorKind::External(ExternalError::Timeout { .. }) => "PROVIDER_TIMEOUT",
            AppErrorKind::External(_) => "PROVIDER_ERROR",
            AppErrorKind::Infrastructure(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to show to API clients.
    ///
    /// Domain and validation errors are user-correctable and returned as is.
    /// Provider and infrastructure details stay in the logs.
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => err.to_string(),
            AppErrorKind::Validation(err) => err.to_string(),
            AppErrorKind::External(_) => {
                "The payment provider could not process the request. Please try again.".to_string()
            }
            AppErrorKind::Infrastructure(_) => {
                "An internal error occurred. Please try again later.".to_string()
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::External(ExternalError::PaymentProvider { is_retryable, .. }) => {
                *is_retryable
            }
            AppErrorKind::External(_) => true,
            AppErrorKind::Infrastructure(InfrastructureError::Database { is_retryable, .. }) => {
                *is_retryable
            }
            _ => false,
        }
    }

    pub fn is_invalid_signature(&self) -> bool {
        matches!(
            self.kind,
            AppErrorKind::Domain(DomainError::InvalidSignature { .. })
        )
    }
}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        let is_retryable = err.is_retryable();
        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            message: err.to_string(),
            is_retryable,
        }))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if self.is_invalid_signature() {
            return status.into_response();
        }

        if status.is_server_error() {
            error!(code = self.error_code(), error = %self, "Request failed");
        } else {
            warn!(code = self.error_code(), error = %self, "Request rejected");
        }

        let body = Json(json!({
            "error": {
                "code": self.error_code(),
                "message": self.user_message(),
            }
        }));

        (status, body).into_response()
    }
}
