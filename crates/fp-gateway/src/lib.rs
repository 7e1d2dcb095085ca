// SPDX-License-Identifier: MIT OR Apache-2.0
//! The gateway (C7, §4.6): an in-memory route index, auth-method
//! evaluation, and upstream proxying to the execution engine.
//!
//! [`Gateway`] is the crate's entry point — one call per inbound HTTP
//! request, resolving `(host, path, method)` against the current
//! [`RouteIndex`] snapshot, evaluating the route's bound auth methods, then
//! proxying admitted requests to the executor.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Auth-method evaluation for a route's bound [`fp_core::GatewayAuthMethod`]s.
pub mod auth;
/// CORS preflight and response-header handling.
pub mod cors;
/// The gateway's own error taxonomy.
pub mod error;
/// JWT verification for `bearer_jwt` auth methods.
pub mod jwt;
/// Forwarding admitted requests to the executor.
pub mod proxy;
/// The in-memory route index.
pub mod routing;

pub use error::GatewayError;
pub use routing::{GatewayEntry, RouteIndex, RouteResolution, Snapshot};

use auth::{AuthOutcome, PresentedCredentials};
use fp_core::GatewayRoute;
use jwt::JwtVerifier;
use proxy::{Proxy, UpstreamRequest};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// One inbound HTTP request, already read off the wire.
pub struct IncomingRequest {
    /// The `Host` header (or `:authority` for HTTP/2), used for host-based
    /// gateway resolution.
    pub host: String,
    /// HTTP method.
    pub method: String,
    /// Request path, including any query string.
    pub path: String,
    /// Request headers, as received.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Vec<u8>,
    /// The client's observed address.
    pub client_ip: Option<String>,
}

/// The response the gateway returns to the client — either proxied from
/// the executor, a CORS preflight answer, a middleware rejection, or a
/// synthesized error.
pub struct GatewayResponse {
    /// HTTP status.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

/// The outcome of invoking a `middleware` auth method (§4.6 step 2): the
/// designated function runs as an authorizer, and its response is either
/// discarded (on admit) or relayed verbatim to the client (on reject).
pub enum MiddlewareVerdict {
    /// The middleware function returned `2xx`; the request is admitted.
    Admit,
    /// The middleware function returned a non-`2xx` status; its response
    /// is returned to the client unchanged.
    Reject {
        /// Status the middleware function returned.
        status: u16,
        /// Headers to forward from the middleware's response.
        headers: Vec<(String, String)>,
        /// Body to forward from the middleware's response.
        body: Vec<u8>,
    },
    /// The middleware function itself could not be invoked (pool
    /// exhaustion, package error, etc).
    Error(GatewayError),
}

/// Invokes a designated function as a `middleware` authorizer. Implemented
/// by whatever wires the gateway to the execution engine (the daemon, in
/// production; a stub in tests) since invoking a function means going
/// through `fp-executor`, which the gateway crate itself doesn't depend on.
#[async_trait::async_trait]
pub trait MiddlewareAuthorizer: Send + Sync {
    /// Run `function_id` against the original request and report whether
    /// it admits or rejects.
    async fn authorize(&self, function_id: Uuid, req: &IncomingRequest) -> MiddlewareVerdict;
}

/// Binds a [`RouteIndex`], JWT verifier, proxy, and middleware authorizer
/// into the gateway's one entry point, [`Gateway::handle`].
pub struct Gateway {
    routes: Arc<RouteIndex>,
    jwt: JwtVerifier,
    proxy: Proxy,
    middleware: Arc<dyn MiddlewareAuthorizer>,
    auth_timeout: Duration,
}

impl Gateway {
    /// Construct a gateway. `auth_timeout` bounds each `bearer_jwt`
    /// verification independently of the invocation deadline (§5).
    pub fn new(
        routes: Arc<RouteIndex>,
        proxy: Proxy,
        middleware: Arc<dyn MiddlewareAuthorizer>,
        auth_timeout: Duration,
    ) -> Self {
        Self {
            routes,
            jwt: JwtVerifier::new(auth_timeout),
            proxy,
            middleware,
            auth_timeout,
        }
    }

    /// Handle one inbound request end to end. Never panics; every failure
    /// mode becomes a well-formed [`GatewayResponse`] (§6).
    pub async fn handle(&self, req: IncomingRequest) -> GatewayResponse {
        match self.try_handle(&req).await {
            Ok(response) => response,
            Err(err) => error_response(&err),
        }
    }

    async fn try_handle(&self, req: &IncomingRequest) -> Result<GatewayResponse, GatewayError> {
        let snapshot = self.routes.current().await;
        let origin = header(&req.headers, "origin");

        if req.method.eq_ignore_ascii_case("OPTIONS") {
            if let RouteResolution::Matched { route, .. } =
                snapshot.resolve(&req.host, &req.path, &req.method)
            {
                if let Some(policy) = &route.cors {
                    if let Some((status, headers)) = cors::preflight_response(policy, origin) {
                        return Ok(GatewayResponse { status, headers, body: Vec::new() });
                    }
                }
            }
        }

        let (gateway, route, params) = match snapshot.resolve(&req.host, &req.path, &req.method) {
            RouteResolution::Matched { gateway, route, params } => (gateway, route, params),
            RouteResolution::NoGateway | RouteResolution::NoRoute => {
                return Err(GatewayError::NoRoute)
            }
            RouteResolution::MethodNotAllowed => return Err(GatewayError::MethodNotAllowed),
        };

        let bound_methods = bound_auth_methods(gateway, route.id);
        if !bound_methods.is_empty() {
            let creds = PresentedCredentials {
                authorization: header(&req.headers, "authorization"),
                api_key_header: header(&req.headers, "x-api-key"),
            };
            let outcome = tokio::time::timeout(
                self.auth_timeout,
                auth::evaluate(&bound_methods, &creds, &self.jwt, self.middleware.as_ref(), req),
            )
            .await
            .unwrap_or(AuthOutcome::Rejected(GatewayError::AuthTimeout));

            match outcome {
                AuthOutcome::Admitted => {}
                AuthOutcome::MiddlewareRejected { status, headers, body } => {
                    return Ok(GatewayResponse { status, headers, body })
                }
                AuthOutcome::Rejected(err) => return Err(err),
            }
        }

        let upstream = UpstreamRequest {
            method: req.method.clone(),
            path: format!(
                "/invoke/{}{}",
                route.target_function_id,
                rewritten_path(route, &params, &req.path)
            ),
            headers: req.headers.clone(),
            body: req.body.clone(),
            client_ip: req.client_ip.clone(),
        };
        let response = self.proxy.forward(upstream).await?;

        let mut headers = response.headers;
        if let Some(policy) = &route.cors {
            cors::apply_response_headers(policy, origin, &mut headers);
        }

        Ok(GatewayResponse { status: response.status, headers, body: response.body })
    }
}

fn bound_auth_methods(
    gateway: &GatewayEntry,
    route_id: Uuid,
) -> Vec<&fp_core::GatewayAuthMethod> {
    gateway
        .bindings
        .get(&route_id)
        .map(|bindings| {
            bindings
                .iter()
                .filter_map(|b| gateway.auth_methods.get(&b.auth_method_id))
                .collect()
        })
        .unwrap_or_default()
}

fn rewritten_path(route: &GatewayRoute, params: &BTreeMap<String, String>, original_path: &str) -> String {
    let Some(template) = &route.path_rewrite else {
        return original_path.to_string();
    };
    let mut rewritten = template.clone();
    for (name, value) in params {
        rewritten = rewritten.replace(&format!("{{{name}}}"), value);
    }
    rewritten
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn error_response(err: &GatewayError) -> GatewayResponse {
    let body = serde_json::json!({ "error": err.code_str(), "message": err.to_string() });
    GatewayResponse {
        status: err.http_status(),
        headers: vec![("content-type".to_string(), "application/json".to_string())],
        body: serde_json::to_vec(&body).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewritten_path_substitutes_captured_params() {
        let route = GatewayRoute {
            id: Uuid::new_v4(),
            gateway_id: Uuid::new_v4(),
            path_template: "/widgets/{id}".into(),
            methods: std::collections::BTreeSet::from(["GET".to_string()]),
            target_function_id: Uuid::new_v4(),
            path_rewrite: Some("/v2/{id}".into()),
            cors: None,
        };
        let mut params = BTreeMap::new();
        params.insert("id".to_string(), "42".to_string());
        assert_eq!(rewritten_path(&route, &params, "/widgets/42"), "/v2/42");
    }

    #[test]
    fn rewritten_path_falls_back_to_original_without_rewrite() {
        let route = GatewayRoute {
            id: Uuid::new_v4(),
            gateway_id: Uuid::new_v4(),
            path_template: "/widgets/{id}".into(),
            methods: std::collections::BTreeSet::from(["GET".to_string()]),
            target_function_id: Uuid::new_v4(),
            path_rewrite: None,
            cors: None,
        };
        assert_eq!(rewritten_path(&route, &BTreeMap::new(), "/widgets/42"), "/widgets/42");
    }
}
