use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use chrono::TimeZone;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use werf_core::{RetryPolicy, StageRecord};
use werf_sync::{ClientRegistry, LocalBackendFactory, router};

fn registry() -> Arc<ClientRegistry> {
    Arc::new(ClientRegistry::new(Arc::new(LocalBackendFactory::in_memory(
        RetryPolicy::immediate(3),
    ))))
}

fn app() -> Router {
    router(registry(), Duration::from_secs(30))
}

async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn record(image_id: &str, signature: &str, seconds: i64) -> Value {
    let created_at = chrono::Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap();
    serde_json::to_value(StageRecord::at(image_id, signature, created_at)).unwrap()
}

// ── Service routes ──

#[tokio::test]
async fn health_answers_ok() {
    let response = app()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn new_client_ids_are_distinct() {
    let app = app();
    let (status, first) = post(&app, "/new-client-id", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    let (_, second) = post(&app, "/new-client-id", json!({})).await;

    let first = first["client_id"].as_str().unwrap();
    assert!(!first.is_empty());
    assert_ne!(first, second["client_id"].as_str().unwrap());
}

// ── Locker ──

#[tokio::test]
async fn second_holder_sees_busy_until_release() {
    let app = app();
    let acquire = |holder: &str| {
        json!({ "lock_name": "demo/install", "holder_id": holder, "ttl_ms": 5_000 })
    };

    let (status, first) = post(&app, "/demo/locker/acquire", acquire("ci-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["status"], "acquired");
    assert_eq!(first["handle"]["holder_id"], "ci-1");
    assert_eq!(first["handle"]["mode"], "exclusive");

    let (_, busy) = post(&app, "/demo/locker/acquire", acquire("ci-2")).await;
    assert_eq!(busy["status"], "busy");
    assert_eq!(busy["holder"], "ci-1");

    let handle = first["handle"].clone();
    let (status, _) = post(
        &app,
        "/demo/locker/renew-lease",
        json!({ "handle": handle, "ttl_ms": 5_000 }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = post(&app, "/demo/locker/release", json!({ "handle": handle })).await;
    assert_eq!(status, StatusCode::OK);

    let (_, after) = post(&app, "/demo/locker/acquire", acquire("ci-2")).await;
    assert_eq!(after["status"], "acquired");
}

#[tokio::test]
async fn shared_holders_coexist() {
    let app = app();
    let shared = |holder: &str| {
        json!({ "lock_name": "demo/stages-and-images", "holder_id": holder, "mode": "shared" })
    };

    let (_, a) = post(&app, "/demo/locker/acquire", shared("ci-1")).await;
    let (_, b) = post(&app, "/demo/locker/acquire", shared("ci-2")).await;
    assert_eq!(a["status"], "acquired");
    assert_eq!(b["status"], "acquired");

    let exclusive = json!({ "lock_name": "demo/stages-and-images", "holder_id": "cleanup" });
    let (_, cleanup) = post(&app, "/demo/locker/acquire", exclusive).await;
    assert_eq!(cleanup["status"], "busy");
}

#[tokio::test]
async fn renewing_a_foreign_lease_is_lease_lost() {
    let app = app();
    let handle = json!({ "lock_name": "demo/install", "holder_id": "ghost", "mode": "exclusive" });

    let (status, body) = post(
        &app,
        "/demo/locker/renew-lease",
        json!({ "handle": handle, "ttl_ms": 1_000 }),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["kind"], "lease_lost");
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn clients_are_isolated() {
    let app = app();
    let request = json!({ "lock_name": "install", "holder_id": "ci-1" });
    let (_, a) = post(&app, "/project-a/locker/acquire", request.clone()).await;

    let other = json!({ "lock_name": "install", "holder_id": "ci-2" });
    let (_, b) = post(&app, "/project-b/locker/acquire", other).await;

    assert_eq!(a["status"], "acquired");
    assert_eq!(b["status"], "acquired");
}

// ── Bad requests ──

#[tokio::test]
async fn invalid_client_id_is_rejected() {
    let (status, body) = post(
        &app(),
        "/Not_Valid/locker/acquire",
        json!({ "lock_name": "install", "holder_id": "ci-1" }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "bad_request");
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn malformed_body_is_rejected() {
    let (status, body) = post(&app(), "/demo/locker/acquire", json!({ "lock_name": 7 })).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(!body["error"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_project_key_is_rejected() {
    let (status, body) = post(
        &app(),
        "/demo/stages-storage-cache/get-all-stages",
        json!({ "project": "a/b" }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "bad_request");
}

// ── Stages storage cache ──

#[tokio::test]
async fn earliest_publish_wins() {
    let app = app();
    let uri = "/demo/stages-storage-cache/publish";

    let later = record("sha256:later", "sig-1", 10);
    let (status, first) = post(
        &app,
        uri,
        json!({ "project": "demo", "signature": "sig-1", "record": later }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["accepted"], true);

    let earlier = record("sha256:earlier", "sig-1", 5);
    let (_, second) = post(
        &app,
        uri,
        json!({ "project": "demo", "signature": "sig-1", "record": earlier }),
    )
    .await;
    assert_eq!(second["accepted"], true);

    let latest = record("sha256:latest", "sig-1", 20);
    let (_, third) = post(
        &app,
        uri,
        json!({ "project": "demo", "signature": "sig-1", "record": latest }),
    )
    .await;
    assert_eq!(third["accepted"], false);
    assert_eq!(third["canonical"]["image_id"], "sha256:earlier");

    let (_, found) = post(
        &app,
        "/demo/stages-storage-cache/lookup",
        json!({ "project": "demo", "signature": "sig-1" }),
    )
    .await;
    assert_eq!(found["record"]["image_id"], "sha256:earlier");
}

#[tokio::test]
async fn publishing_under_another_signature_is_bad_request() {
    let (status, body) = post(
        &app(),
        "/demo/stages-storage-cache/publish",
        json!({ "project": "demo", "signature": "sig-1", "record": record("sha256:a", "sig-2", 0) }),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "signature_mismatch");
}

#[tokio::test]
async fn store_list_and_delete_stages() {
    let app = app();
    let store = |signature: &str, image: &str| {
        json!({
            "project": "demo",
            "signature": signature,
            "records": [record(image, signature, 0)],
        })
    };
    let (status, _) = post(
        &app,
        "/demo/stages-storage-cache/store-stages-by-signature",
        store("sig-1", "sha256:one"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    post(
        &app,
        "/demo/stages-storage-cache/store-stages-by-signature",
        store("sig-2", "sha256:two"),
    )
    .await;

    let (_, all) = post(
        &app,
        "/demo/stages-storage-cache/get-all-stages",
        json!({ "project": "demo" }),
    )
    .await;
    assert_eq!(all["stages"].as_array().unwrap().len(), 2);

    let (_, by_signature) = post(
        &app,
        "/demo/stages-storage-cache/get-stages-by-signature",
        json!({ "project": "demo", "signature": "sig-2" }),
    )
    .await;
    assert_eq!(by_signature["stages"][0]["image_id"], "sha256:two");

    post(
        &app,
        "/demo/stages-storage-cache/delete-stages-by-signature",
        json!({ "project": "demo", "signature": "sig-2" }),
    )
    .await;
    let (_, gone) = post(
        &app,
        "/demo/stages-storage-cache/lookup",
        json!({ "project": "demo", "signature": "sig-2" }),
    )
    .await;
    assert_eq!(gone["record"], Value::Null);

    post(
        &app,
        "/demo/stages-storage-cache/delete-all-stages",
        json!({ "project": "demo" }),
    )
    .await;
    let (_, empty) = post(
        &app,
        "/demo/stages-storage-cache/get-all-stages",
        json!({ "project": "demo" }),
    )
    .await;
    assert_eq!(empty["stages"], json!([]));
}
