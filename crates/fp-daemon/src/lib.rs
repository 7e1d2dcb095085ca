// SPDX-License-Identifier: MIT OR Apache-2.0
//! Wires the execution engine (`fp-executor`) and the gateway
//! (`fp-gateway`) into two Axum routers: the executor's `/invoke/...`
//! surface and the gateway's host/path/method-routed surface (§6).
//!
//! The two surfaces are bound to distinct listeners (§4.6: the gateway
//! "proxies to the executor") even though both run inside this one
//! process — the gateway's [`fp_gateway::proxy::Proxy`] really does speak
//! HTTP to the executor's listener, same as it would across a network
//! boundary in a multi-process deployment.
#![deny(unsafe_code)]

/// Request-id and access-log middleware shared by both routers.
pub mod middleware;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path as AxPath, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use fp_executor::http::RawInvocation;
use fp_executor::ExecutionEngine;
use fp_gateway::{Gateway, GatewayResponse, IncomingRequest, MiddlewareAuthorizer, MiddlewareVerdict};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

/// Shared state for the executor's `/invoke` router.
#[derive(Clone)]
pub struct ExecutorState {
    /// The execution engine invocations are dispatched through.
    pub engine: Arc<ExecutionEngine>,
}

/// Shared state for the gateway's router.
#[derive(Clone)]
pub struct GatewayState {
    /// The gateway invocations are dispatched through.
    pub gateway: Arc<Gateway>,
}

/// Build the executor's HTTP surface: `ANY /invoke/{functionId}[/...]` plus
/// a liveness `/health` (§6 "Executor HTTP surface").
pub fn build_executor_router(state: ExecutorState) -> Router {
    Router::new()
        .route("/health", get(executor_health))
        .route("/invoke/{function_id}", any(invoke_handler))
        .route("/invoke/{function_id}/{*rest}", any(invoke_handler))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(axum::middleware::from_fn(middleware::access_log_middleware))
        .with_state(state)
}

/// Build the gateway's HTTP surface: every request falls through to route
/// resolution against the current snapshot (§6 "Gateway HTTP surface").
pub fn build_gateway_router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(gateway_health))
        .fallback(gateway_handler)
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(axum::middleware::from_fn(middleware::access_log_middleware))
        .with_state(state)
}

async fn executor_health(State(state): State<ExecutorState>) -> impl IntoResponse {
    let metrics = state.engine.metrics().snapshot();
    let pool_stats = state.engine.pool().stats();
    Json(json!({
        "status": "ok",
        "contract_version": fp_core::CONTRACT_VERSION,
        "metrics": metrics,
        "pool": {
            "idle": pool_stats.idle,
            "busy": pool_stats.busy,
            "available_permits": pool_stats.available_permits,
        },
    }))
}

async fn gateway_health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "contract_version": fp_core::CONTRACT_VERSION }))
}

async fn invoke_handler(
    State(state): State<ExecutorState>,
    AxPath(function_id): AxPath<Uuid>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b.to_vec(),
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid request body").into_response(),
    };

    let raw = RawInvocation {
        method: method.to_string(),
        url: uri.to_string(),
        headers: header_pairs(&headers),
        body: body_bytes,
        client_ip: Some(addr.ip().to_string()),
    };

    let outcome = state.engine.invoke(function_id, &raw).await;
    response_from_sandbox(outcome.response)
}

async fn gateway_handler(
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b.to_vec(),
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid request body").into_response(),
    };

    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let req = IncomingRequest {
        host,
        method: method.to_string(),
        path: uri.to_string(),
        headers: header_pairs(&headers),
        body: body_bytes,
        client_ip: Some(addr.ip().to_string()),
    };

    response_from_gateway(state.gateway.handle(req).await)
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn response_from_sandbox(resp: fp_sandbox::Response) -> Response {
    let mut builder = Response::builder().status(resp.status);
    for (name, value) in &resp.headers {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(resp.body)).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "malformed response").into_response()
    })
}

fn response_from_gateway(resp: GatewayResponse) -> Response {
    let mut builder = Response::builder().status(resp.status);
    for (name, value) in &resp.headers {
        builder = builder.header(name, value);
    }
    builder.body(Body::from(resp.body)).unwrap_or_else(|_| {
        (StatusCode::INTERNAL_SERVER_ERROR, "malformed response").into_response()
    })
}

/// Implements `middleware` gateway auth methods (§4.6 step 2) by invoking
/// the designated function over the executor's own HTTP surface, exactly
/// as an external caller would.
pub struct ExecutorMiddlewareAuthorizer {
    client: reqwest::Client,
    executor_base_url: String,
}

impl ExecutorMiddlewareAuthorizer {
    /// Forward middleware-authorizer invocations to `executor_base_url`.
    pub fn new(executor_base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            executor_base_url: executor_base_url.into(),
        }
    }
}

#[async_trait::async_trait]
impl MiddlewareAuthorizer for ExecutorMiddlewareAuthorizer {
    async fn authorize(&self, function_id: Uuid, req: &IncomingRequest) -> MiddlewareVerdict {
        let url = format!(
            "{}/invoke/{}",
            self.executor_base_url.trim_end_matches('/'),
            function_id
        );
        let method = match reqwest::Method::from_bytes(req.method.as_bytes()) {
            Ok(m) => m,
            Err(_) => return MiddlewareVerdict::Error(fp_gateway::GatewayError::BadRequest(
                format!("invalid method: {}", req.method),
            )),
        };

        let mut builder = self.client.request(method, url);
        for (name, value) in &req.headers {
            builder = builder.header(name, value);
        }
        if let Some(ip) = &req.client_ip {
            builder = builder.header("x-forwarded-for", ip);
        }

        let response = match builder.body(req.body.clone()).send().await {
            Ok(r) => r,
            Err(e) => {
                if e.is_timeout() {
                    return MiddlewareVerdict::Error(fp_gateway::GatewayError::AuthTimeout);
                }
                return MiddlewareVerdict::Error(fp_gateway::GatewayError::BadGateway(e.to_string()));
            }
        };

        let status = response.status();
        if status.is_success() {
            return MiddlewareVerdict::Admit;
        }

        let headers = response
            .headers()
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
        MiddlewareVerdict::Reject { status: status.as_u16(), headers, body }
    }
}
