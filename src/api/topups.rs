//! Client top-up routes. The caller is identified by the `X-User-Id` header.

use crate::api::{user_id, AppState};
use crate::database::topup_repository::TopUpTransaction;
use crate::error::AppResult;
use crate::payments::types::RailInput;
use crate::services::topup_orchestrator::{HistoryPage, InitiatedTopUp};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: i64 = 20;

#[derive(Debug, Deserialize)]
pub struct InitiateTopUpRequest {
    pub amount: Decimal,
    /// Tagged by `rail`, e.g. `{"rail": "mobile_money", "phone_number": "0712345678"}`
    pub rail_input: RailInput,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

pub async fn initiate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<InitiateTopUpRequest>,
) -> AppResult<(StatusCode, Json<InitiatedTopUp>)> {
    let user_id = user_id(&headers)?;
    state.rate_limiter.check(&user_id).await?;

    let rail = request.rail_input.rail();
    let initiated = state
        .orchestrator
        .initiate(&user_id, rail, request.amount, request.rail_input)
        .await?;

    Ok((StatusCode::CREATED, Json(initiated)))
}

pub async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<HistoryPage>> {
    let user_id = user_id(&headers)?;
    state.rate_limiter.check(&user_id).await?;

    let page = state
        .orchestrator
        .list_history(
            &user_id,
            query.page.unwrap_or(1),
            query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;

    Ok(Json(page))
}

pub async fn verify(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> AppResult<Json<TopUpTransaction>> {
    let user_id = user_id(&headers)?;
    state.rate_limiter.check(&user_id).await?;

    let transaction = state.orchestrator.verify(id, &user_id).await?;
    Ok(Json(transaction))
}

pub async fn cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> AppResult<Json<TopUpTransaction>> {
    let user_id = user_id(&headers)?;
    state.rate_limiter.check(&user_id).await?;

    let transaction = state.orchestrator.cancel(id, &user_id).await?;
    Ok(Json(transaction))
}
