//! HTTP API Integration Tests
//!
//! Exercises the router in-process with `tower::ServiceExt::oneshot`.

mod common;

use std::time::Duration;

use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use contractflow::api;
use contractflow::domain::{SignatureOutcome, State};

use common::{signature_webhook, Harness};

fn app(h: &Harness) -> Router {
    api::router(h.orchestrator.clone())
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, body)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let h = Harness::new();
    let (status, body) = send(app(&h), get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("OK".to_string()));
}

#[tokio::test]
async fn test_submit_then_poll_until_consent_pending() {
    let h = Harness::new();
    h.ocr
        .document("uploads/bill.pdf", &[("customer_id", "C12345")]);

    let (status, body) = send(
        app(&h),
        post(
            "/request",
            json!({
                "description": "Please switch me to the green offer",
                "attachmentRefs": [{"storageKey": "uploads/bill.pdf", "declaredType": "invoice"}],
                "declaredFields": {"customer_id": "C12345"}
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["requestId"].as_str().unwrap().to_string();

    let mut state = String::new();
    for _ in 0..100 {
        let (status, body) = send(app(&h), get(&format!("/request/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        state = body["request"]["state"].as_str().unwrap().to_string();
        if state == "CONSENT_PENDING" {
            assert!(!body["events"].as_array().unwrap().is_empty());
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, "CONSENT_PENDING");

    let (status, body) = send(app(&h), get("/requests?limit=5")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_request_is_404() {
    let h = Harness::new();
    let (status, body) = send(
        app(&h),
        get(&format!("/request/{}", uuid::Uuid::new_v4())),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_consent_captures_client_details() {
    let h = Harness::new();
    let id = h.until_consent().await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/consent")
        .header(CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", "198.51.100.7, 10.0.0.1")
        .header("user-agent", "portal/2.1")
        .body(Body::from(
            json!({"requestId": id, "accepted": true, "textVersion": "v1"}).to_string(),
        ))
        .unwrap();
    let (status, body) = send(app(&h), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sourceIp"], "198.51.100.7");
    assert_eq!(body["userAgent"], "portal/2.1");
    assert!(body["hash"].as_str().unwrap().starts_with("sha256:"));

    let stored = h.store.consent_proof(id).unwrap().unwrap();
    assert_eq!(stored.source_ip, "198.51.100.7");

    // Write-once
    let (status, body) = send(
        app(&h),
        post(
            "/consent",
            json!({"requestId": id, "accepted": true, "textVersion": "v1"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "DUPLICATE_CONSENT");
}

#[tokio::test]
async fn test_declined_consent_is_422() {
    let h = Harness::new();
    let id = h.until_consent().await;

    let (status, body) = send(
        app(&h),
        post(
            "/consent",
            json!({"requestId": id, "accepted": false, "textVersion": "v1"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "CONSENT_DECLINED");
    assert_eq!(h.store.load(id).unwrap().state, State::Rejected);
}

#[tokio::test]
async fn test_decision_on_request_not_pending_review_is_409() {
    let h = Harness::new();
    let id = h.until_consent().await;

    let (status, body) = send(
        app(&h),
        post(
            "/hitl/decision",
            json!({"requestId": id, "decision": "APPROVE", "reviewerId": "bo-1"}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICTING_STATE");
}

#[tokio::test]
async fn test_malformed_body_is_client_error() {
    let h = Harness::new();
    let (status, _) = send(
        app(&h),
        post(
            "/hitl/decision",
            json!({"requestId": "not-a-uuid", "decision": "MAYBE"}),
        ),
    )
    .await;

    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_signature_webhook_statuses() {
    let h = Harness::new();
    let (id, envelope_id) = h.until_signature().await;

    let mut forged = signature_webhook(&envelope_id, SignatureOutcome::Signed, Some("evt-9"));
    forged.signature = "00".repeat(32);
    let (status, body) = send(
        app(&h),
        post("/webhooks/signature", serde_json::to_value(&forged).unwrap()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "INVALID_SIGNATURE");

    let hook = signature_webhook(&envelope_id, SignatureOutcome::Signed, Some("evt-9"));
    let payload = serde_json::to_value(&hook).unwrap();

    let (status, body) = send(app(&h), post("/webhooks/signature", payload.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "applied");

    let (status, body) = send(app(&h), post("/webhooks/signature", payload)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "duplicate");

    assert_eq!(h.store.load(id).unwrap().state, State::Signed);
}

#[tokio::test]
async fn test_cancel_route() {
    let h = Harness::new();
    let id = h.until_consent().await;

    let (status, body) = send(app(&h), post(&format!("/request/{}/cancel", id), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "REJECTED");

    let (status, _) = send(app(&h), post(&format!("/request/{}/cancel", id), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
}
