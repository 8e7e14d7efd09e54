//! HTTP surface tests: routes, status codes and webhook acknowledgement rules,
//! driven through the router with in-memory storage.

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use common::{signed_callback, Harness, USER};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use topup_engine::api::{router, AppState, USER_ID_HEADER};
use topup_engine::cache::{InMemoryCounterStore, RateLimiter};
use topup_engine::database::repository::TopUpStore;
use topup_engine::database::topup_repository::TopUpStatus;
use tower::ServiceExt;

fn app(harness: &Harness, requests_per_minute: i64) -> Router {
    router(AppState {
        orchestrator: harness.orchestrator.clone(),
        rate_limiter: Arc::new(RateLimiter::new(
            Arc::new(InMemoryCounterStore::new()),
            "topups",
            requests_per_minute,
            Duration::from_secs(60),
        )),
        environment: "test".to_string(),
        pool: None,
    })
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn mobile_callback(payload: Vec<u8>, signature: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/webhooks/mobile_money")
        .header("content-type", "application/json")
        .header("x-callback-signature", signature)
        .body(Body::from(payload))
        .unwrap()
}

#[tokio::test]
async fn health_reports_in_memory_storage_and_rails() {
    let h = Harness::new().await;

    let response = app(&h, 30)
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "in_memory");
    assert_eq!(body["rails"], json!(["bank_transfer", "mobile_money"]));
}

#[tokio::test]
async fn initiate_returns_created_with_instructions() {
    let h = Harness::new().await;

    let request = Request::post("/api/topups")
        .header("content-type", "application/json")
        .header(USER_ID_HEADER, USER)
        .body(Body::from(
            json!({
                "amount": 1000,
                "rail_input": { "rail": "mobile_money", "phone_number": "0712345678" }
            })
            .to_string(),
        ))
        .unwrap();

    let response = app(&h, 30).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(response.headers().contains_key("x-request-id"));
    let body = json_body(response).await;
    assert_eq!(body["transaction"]["status"], "PENDING");
    assert_eq!(body["transaction"]["user_id"], USER);
    assert!(body["instructions"].is_object());
}

#[tokio::test]
async fn initiate_without_user_header_is_rejected() {
    let h = Harness::new().await;

    let request = Request::post("/api/topups")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "amount": 1000, "rail_input": { "rail": "bank_transfer" } }).to_string(),
        ))
        .unwrap();

    let response = app(&h, 30).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn out_of_range_amount_maps_to_bad_request() {
    let h = Harness::new().await;

    let request = Request::post("/api/topups")
        .header("content-type", "application/json")
        .header(USER_ID_HEADER, USER)
        .body(Body::from(
            json!({
                "amount": 5,
                "rail_input": { "rail": "mobile_money", "phone_number": "0712345678" }
            })
            .to_string(),
        ))
        .unwrap();

    let response = app(&h, 30).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "INVALID_AMOUNT");
}

#[tokio::test]
async fn requests_over_the_budget_are_throttled() {
    let h = Harness::new().await;
    let app = app(&h, 2);

    let history = || {
        Request::get("/api/topups?page=1&limit=10")
            .header(USER_ID_HEADER, USER)
            .body(Body::empty())
            .unwrap()
    };

    for _ in 0..2 {
        let response = app.clone().oneshot(history()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.clone().oneshot(history()).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn bad_signature_gets_empty_unauthorized() {
    let h = Harness::new().await;
    let tx = h.start_mobile(dec!(1000)).await;

    let (payload, _) = signed_callback(json!({
        "correlation_id": tx.provider_reference.clone().unwrap(),
        "status": "completed",
    }));

    let response = app(&h, 30)
        .oneshot(mobile_callback(payload, "deadbeef"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(body.is_empty());

    let stored = h.topups.find_by_id(tx.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TopUpStatus::Pending);
    assert_eq!(h.balance(USER).await, dec!(0));
}

#[tokio::test]
async fn missing_signature_header_gets_unauthorized() {
    let h = Harness::new().await;
    let (payload, _) = signed_callback(json!({ "correlation_id": "MOCK-X", "status": "completed" }));

    let request = Request::post("/webhooks/mobile_money")
        .header("content-type", "application/json")
        .body(Body::from(payload))
        .unwrap();

    let response = app(&h, 30).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn signed_callback_completes_and_credits() {
    let h = Harness::new().await;
    let tx = h.start_mobile(dec!(1000)).await;

    let (payload, signature) = signed_callback(json!({
        "correlation_id": tx.provider_reference.clone().unwrap(),
        "status": "completed",
        "settlement_reference": "RCPT-API-1",
    }));

    let response = app(&h, 30)
        .oneshot(mobile_callback(payload, &signature))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({ "status": "received" }));

    let stored = h.topups.find_by_id(tx.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TopUpStatus::Completed);
    assert_eq!(h.balance(USER).await, dec!(1000));
}

#[tokio::test]
async fn unmatched_callback_is_acknowledged() {
    let h = Harness::new().await;

    let (payload, signature) = signed_callback(json!({
        "correlation_id": "MOCK-UNKNOWN",
        "status": "completed",
    }));

    let response = app(&h, 30)
        .oneshot(mobile_callback(payload, &signature))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({ "status": "received" }));
}

#[tokio::test]
async fn unknown_rail_is_bad_request() {
    let h = Harness::new().await;

    let request = Request::post("/webhooks/carrier-pigeon")
        .header("x-callback-signature", "abc")
        .body(Body::from("{}"))
        .unwrap();

    let response = app(&h, 30).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn verify_and_cancel_are_scoped_to_owner() {
    let h = Harness::new().await;
    let tx = h.start_bank(dec!(5000)).await;
    let app = app(&h, 30);

    let response = app
        .clone()
        .oneshot(
            Request::post(format!("/api/topups/{}/verify", tx.id))
                .header(USER_ID_HEADER, "someone-else")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(
            Request::post(format!("/api/topups/{}/cancel", tx.id))
                .header(USER_ID_HEADER, USER)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "CANCELLED");
}
