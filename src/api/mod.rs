//! HTTP surface: client top-up routes, provider webhooks and health

pub mod health;
pub mod topups;
pub mod webhooks;

use crate::cache::RateLimiter;
use crate::error::{AppError, AppResult, ValidationError};
use crate::services::topup_orchestrator::TopUpOrchestrator;
use axum::{
    http::HeaderMap,
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

/// Header carrying the authenticated user id, set by the gateway in front of this service
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<TopUpOrchestrator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub environment: String,
    /// Absent when running on in-memory storage
    pub pool: Option<PgPool>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/topups", post(topups::initiate).get(topups::history))
        .route("/api/topups/:id/verify", post(topups::verify))
        .route("/api/topups/:id/cancel", post(topups::cancel))
        .route("/webhooks/:rail", post(webhooks::receive))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .with_state(state)
}

pub(crate) fn user_id(headers: &HeaderMap) -> AppResult<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            AppError::validation(ValidationError::InvalidParameter {
                field: USER_ID_HEADER.to_string(),
                reason: "missing user id".to_string(),
            })
        })
}
