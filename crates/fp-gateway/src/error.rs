// SPDX-License-Identifier: MIT OR Apache-2.0
//! The gateway's own error taxonomy (§6 "Gateway HTTP surface"): unlike
//! the executor, several of the gateway's terminal statuses (`405`, the
//! upstream-specific `502`/`504`) have no one-to-one [`fp_error::ErrorCode`]
//! counterpart, so the gateway owns its HTTP-status mapping directly and
//! only borrows `ErrorCode`'s string tags where they line up.

use thiserror::Error;

/// A failure at any stage of gateway request handling.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No route matched `(host, path)`.
    #[error("no route matches this request")]
    NoRoute,
    /// A route matched the path but not the method.
    #[error("method not allowed on this route")]
    MethodNotAllowed,
    /// No bound auth method accepted the request.
    #[error("no auth method accepted the request")]
    Unauthorized,
    /// A network policy or auth-middleware function rejected the request.
    #[error("request forbidden: {0}")]
    Forbidden(String),
    /// A JWKS/OIDC verification call exceeded its own timeout budget.
    #[error("auth verification timed out")]
    AuthTimeout,
    /// The upstream executor could not be reached or returned malformed
    /// output.
    #[error("upstream error: {0}")]
    BadGateway(String),
    /// The upstream executor did not respond within the gateway's proxy
    /// timeout.
    #[error("upstream timed out")]
    GatewayTimeout,
    /// The request itself was malformed (e.g. an unparseable `Authorization`
    /// header).
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl GatewayError {
    /// The HTTP status this error surfaces as (§6).
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NoRoute => 404,
            Self::MethodNotAllowed => 405,
            Self::Unauthorized => 401,
            Self::Forbidden(_) => 403,
            Self::AuthTimeout => 504,
            Self::BadGateway(_) => 502,
            Self::GatewayTimeout => 504,
            Self::BadRequest(_) => 400,
        }
    }

    /// A stable machine-readable code for the error response body. Reuses
    /// [`fp_error::ErrorCode`]'s tags where one applies; the codes unique
    /// to gateway routing (`405`) get a local tag in the same style.
    pub fn code_str(&self) -> &'static str {
        match self {
            Self::NoRoute => fp_error::ErrorCode::NotFound.as_str(),
            Self::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            Self::Unauthorized => fp_error::ErrorCode::Unauthorized.as_str(),
            Self::Forbidden(_) => fp_error::ErrorCode::Forbidden.as_str(),
            Self::AuthTimeout => fp_error::ErrorCode::AuthTimeout.as_str(),
            Self::BadGateway(_) => "BAD_GATEWAY",
            Self::GatewayTimeout => fp_error::ErrorCode::Timeout.as_str(),
            Self::BadRequest(_) => fp_error::ErrorCode::BadRequest.as_str(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_not_allowed_is_405() {
        assert_eq!(GatewayError::MethodNotAllowed.http_status(), 405);
    }

    #[test]
    fn no_route_is_404() {
        assert_eq!(GatewayError::NoRoute.http_status(), 404);
    }

    #[test]
    fn bad_gateway_is_502() {
        assert_eq!(GatewayError::BadGateway("boom".into()).http_status(), 502);
    }
}
