// SPDX-License-Identifier: MIT OR Apache-2.0
//! Proxying an admitted request to the executor (§4.6 step 3, §6 "Gateway
//! HTTP surface"): the client IP is preserved via forwarding headers, the
//! body goes through unchanged, and hop-by-hop headers are stripped in
//! both directions.

use crate::error::GatewayError;
use std::time::Duration;

/// Request/response-layer hop-by-hop headers (RFC 7230 §6.1) that must not
/// be relayed across the proxy boundary.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// A request ready to be forwarded upstream.
pub struct UpstreamRequest {
    /// HTTP method.
    pub method: String,
    /// Path (and query string) to request on the executor, already
    /// rewritten per the matched route's `path_rewrite`.
    pub path: String,
    /// Request headers, as received from the client.
    pub headers: Vec<(String, String)>,
    /// Request body, forwarded unchanged.
    pub body: Vec<u8>,
    /// The client's observed address, for `X-Forwarded-For`/`X-Real-IP`.
    pub client_ip: Option<String>,
}

/// The executor's response, ready to be relayed back to the client.
pub struct UpstreamResponse {
    /// HTTP status the executor returned.
    pub status: u16,
    /// Response headers, hop-by-hop headers already stripped.
    pub headers: Vec<(String, String)>,
    /// Response body, forwarded unchanged.
    pub body: Vec<u8>,
}

/// Forwards admitted requests to the execution engine's HTTP surface.
pub struct Proxy {
    client: reqwest::Client,
    executor_base_url: String,
    timeout: Duration,
}

impl Proxy {
    /// `executor_base_url` is the executor's base URL, e.g.
    /// `http://127.0.0.1:8081`; requests are forwarded to
    /// `{executor_base_url}{path}`.
    pub fn new(executor_base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            executor_base_url: executor_base_url.into(),
            timeout,
        }
    }

    /// Forward `req` upstream, mapping connection failures to `502` and
    /// timeouts to `504` (§6).
    pub async fn forward(&self, req: UpstreamRequest) -> Result<UpstreamResponse, GatewayError> {
        let url = format!("{}{}", self.executor_base_url.trim_end_matches('/'), req.path);
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|_| GatewayError::BadRequest(format!("invalid method: {}", req.method)))?;

        let mut builder = self.client.request(method, url).timeout(self.timeout);
        for (name, value) in &req.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            builder = builder.header(name, value);
        }
        if let Some(ip) = &req.client_ip {
            builder = builder.header("x-forwarded-for", ip).header("x-real-ip", ip);
        }

        let response = builder
            .body(req.body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::GatewayTimeout
                } else {
                    GatewayError::BadGateway(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .map(|(name, value)| (name.to_string(), value.to_str().unwrap_or_default().to_string()))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| GatewayError::BadGateway(e.to_string()))?
            .to_vec();

        Ok(UpstreamResponse { status, headers, body })
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_recognized_case_insensitively() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(!is_hop_by_hop("content-type"));
    }
}
