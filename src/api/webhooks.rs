//! Provider callbacks
//!
//! The body is taken as raw bytes: the signature covers them exactly as sent.
//! Anything that verifies is acknowledged with 200 so providers stop retrying;
//! a bad signature gets an empty 401.

use crate::api::AppState;
use crate::error::{AppError, AppResult, DomainError};
use crate::payments::types::Rail;
use crate::services::topup_orchestrator::ReconcileOutcome;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};
use tracing::{info, warn};

pub async fn receive(
    State(state): State<AppState>,
    Path(rail): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let rail: Rail = rail.parse()?;

    let Some(signature) = headers
        .get(rail.signature_header())
        .and_then(|value| value.to_str().ok())
    else {
        warn!(
            event_type = "security",
            rail = %rail,
            "Callback without signature header"
        );
        return Err(AppError::domain(DomainError::InvalidSignature {
            rail: rail.to_string(),
        }));
    };

    match state.orchestrator.reconcile(rail, &body, signature).await? {
        ReconcileOutcome::Applied(tx) => {
            info!(tx_id = %tx.id, status = %tx.status, "Callback processed");
        }
        ReconcileOutcome::Unmatched { correlation_id } => {
            info!(%correlation_id, "Callback acknowledged without a matching top-up");
        }
        ReconcileOutcome::Ignored {
            transaction_id,
            reason,
        } => {
            info!(tx_id = %transaction_id, %reason, "Callback acknowledged, no change");
        }
    }

    Ok(Json(json!({ "status": "received" })))
}
