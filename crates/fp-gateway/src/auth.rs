// SPDX-License-Identifier: MIT OR Apache-2.0
//! Auth-method evaluation (§4.6 step 2): a route's bound methods are tried
//! in configured order and the request is admitted the moment any one
//! accepts it.

use crate::error::GatewayError;
use crate::jwt::JwtVerifier;
use crate::{IncomingRequest, MiddlewareAuthorizer, MiddlewareVerdict};
use base64::Engine;
use fp_core::{AuthMethodConfig, GatewayAuthMethod};
use subtle::ConstantTimeEq;

/// The `Authorization`/`x-api-key` material pulled off the inbound request,
/// decoupled from [`IncomingRequest`] so basic/bearer/api-key checks don't
/// need the whole request.
pub struct PresentedCredentials<'a> {
    /// Raw `Authorization` header value, if present.
    pub authorization: Option<&'a str>,
    /// Raw `x-api-key` header value, if present.
    pub api_key_header: Option<&'a str>,
}

/// What came of evaluating a route's bound auth methods.
pub enum AuthOutcome {
    /// One of the bound methods accepted the request.
    Admitted,
    /// A `middleware` method rejected it; its response is returned verbatim.
    MiddlewareRejected {
        /// Status the middleware function returned.
        status: u16,
        /// Headers to forward from the middleware's response.
        headers: Vec<(String, String)>,
        /// Body to forward from the middleware's response.
        body: Vec<u8>,
    },
    /// No bound method accepted the request.
    Rejected(GatewayError),
}

/// Evaluate `methods` in order against `creds`/`req`, admitting on the first
/// acceptance (§4.6 step 2: "the request is admitted if any method accepts
/// it").
pub async fn evaluate(
    methods: &[&GatewayAuthMethod],
    creds: &PresentedCredentials<'_>,
    jwt: &JwtVerifier,
    middleware: &dyn MiddlewareAuthorizer,
    req: &IncomingRequest,
) -> AuthOutcome {
    let mut last_rejection: Option<AuthOutcome> = None;

    for method in methods {
        let outcome = check_one(method, creds, jwt, middleware, req).await;
        match outcome {
            AuthOutcome::Admitted => return AuthOutcome::Admitted,
            other => last_rejection = Some(other),
        }
    }

    last_rejection.unwrap_or(AuthOutcome::Rejected(GatewayError::Unauthorized))
}

async fn check_one(
    method: &GatewayAuthMethod,
    creds: &PresentedCredentials<'_>,
    jwt: &JwtVerifier,
    middleware: &dyn MiddlewareAuthorizer,
    req: &IncomingRequest,
) -> AuthOutcome {
    match &method.config {
        AuthMethodConfig::BasicAuth { credentials } => check_basic(credentials, creds.authorization),
        AuthMethodConfig::ApiKey { api_keys } => check_api_key(api_keys, creds.api_key_header),
        AuthMethodConfig::BearerJwt { mode, audience, issuer } => {
            let Some(token) = extract_bearer(creds.authorization) else {
                return AuthOutcome::Rejected(GatewayError::Unauthorized);
            };
            match jwt.verify(mode, audience.as_deref(), issuer.as_deref(), token).await {
                Ok(()) => AuthOutcome::Admitted,
                Err(e) => AuthOutcome::Rejected(e),
            }
        }
        AuthMethodConfig::Middleware { function_id } => {
            match middleware.authorize(*function_id, req).await {
                MiddlewareVerdict::Admit => AuthOutcome::Admitted,
                MiddlewareVerdict::Reject { status, headers, body } => {
                    AuthOutcome::MiddlewareRejected { status, headers, body }
                }
                MiddlewareVerdict::Error(e) => AuthOutcome::Rejected(e),
            }
        }
    }
}

fn check_basic(credentials: &[fp_core::BasicCredential], header: Option<&str>) -> AuthOutcome {
    let Some(header) = header else {
        return AuthOutcome::Rejected(GatewayError::Unauthorized);
    };
    let Some(encoded) = header.strip_prefix("Basic ") else {
        return AuthOutcome::Rejected(GatewayError::Unauthorized);
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded.trim()) else {
        return AuthOutcome::Rejected(GatewayError::Unauthorized);
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return AuthOutcome::Rejected(GatewayError::Unauthorized);
    };
    let Some((user, pass)) = decoded.split_once(':') else {
        return AuthOutcome::Rejected(GatewayError::Unauthorized);
    };

    let matched = credentials.iter().any(|c| {
        constant_time_str_eq(&c.username, user) && constant_time_str_eq(&c.password, pass)
    });
    if matched {
        AuthOutcome::Admitted
    } else {
        AuthOutcome::Rejected(GatewayError::Unauthorized)
    }
}

fn check_api_key(api_keys: &[String], presented: Option<&str>) -> AuthOutcome {
    let Some(presented) = presented else {
        return AuthOutcome::Rejected(GatewayError::Unauthorized);
    };
    let matched = api_keys.iter().any(|k| constant_time_str_eq(k, presented));
    if matched {
        AuthOutcome::Admitted
    } else {
        AuthOutcome::Rejected(GatewayError::Unauthorized)
    }
}

fn extract_bearer(authorization: Option<&str>) -> Option<&str> {
    authorization?.strip_prefix("Bearer ").map(str::trim)
}

fn constant_time_str_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
