// SPDX-License-Identifier: MIT OR Apache-2.0
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::from_fn;
use axum::routing::get;
use fp_daemon::middleware::{RequestId, access_log_middleware, request_id_middleware};
use http_body_util::BodyExt;
use std::collections::HashSet;
use tower::ServiceExt;

fn app_with_request_id() -> Router {
    Router::new()
        .route("/ping", get(|| async { "pong" }))
        .layer(from_fn(request_id_middleware))
}

fn app_with_access_log() -> Router {
    Router::new()
        .route("/ok", get(|| async { "ok" }))
        .route("/not-found", get(|| async { StatusCode::NOT_FOUND }))
        .layer(from_fn(access_log_middleware))
}

#[tokio::test]
async fn request_id_header_is_set() {
    let app = app_with_request_id();
    let resp = app
        .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let header = resp
        .headers()
        .get("x-request-id")
        .expect("missing x-request-id");
    let parsed: uuid::Uuid = header.to_str().unwrap().parse().expect("not a valid uuid");
    assert_ne!(parsed, uuid::Uuid::nil());
}

#[tokio::test]
async fn request_id_is_unique_per_request() {
    let app = app_with_request_id();

    let mut ids = HashSet::new();
    for _ in 0..5 {
        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let id = resp
            .headers()
            .get("x-request-id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_owned();
        ids.insert(id);
    }
    assert_eq!(ids.len(), 5, "every request should get a distinct id");
}

#[tokio::test]
async fn request_id_available_as_extension() {
    let app = Router::new()
        .route(
            "/ext",
            get(|ext: axum::Extension<RequestId>| async move { ext.0.0.to_string() }),
        )
        .layer(from_fn(request_id_middleware));

    let resp = app
        .oneshot(Request::builder().uri("/ext").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let body_str = String::from_utf8(body.to_vec()).unwrap();
    let _parsed: uuid::Uuid = body_str.parse().expect("body should be a uuid");
}

#[tokio::test]
async fn access_log_does_not_alter_successful_response() {
    let app = app_with_access_log();
    let resp = app
        .oneshot(Request::builder().uri("/ok").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn access_log_does_not_alter_error_response() {
    let app = app_with_access_log();
    let resp = app
        .oneshot(
            Request::builder()
                .uri("/not-found")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
