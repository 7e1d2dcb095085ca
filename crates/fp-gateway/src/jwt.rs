// SPDX-License-Identifier: MIT OR Apache-2.0
//! JWT verification for `bearer_jwt` auth methods (§4.6 step 2, §6 "Auth-method
//! configuration schemas").
//!
//! `fixed_secret` verifies against an inline HMAC secret; the other five
//! modes all resolve to fetching a JWKS document (directly, or indirectly
//! via an OIDC discovery document) and picking the signing key by `kid`.
//! Discovery and JWKS documents are cached by URL with a refresh-on-kid-miss
//! fallback (§4.6: "fetch JWKS at configured URL (with caching and refresh
//! on kid miss)").

use crate::error::GatewayError;
use fp_core::JwtMode;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use moka::future::Cache;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

const MICROSOFT_DISCOVERY: &str = "https://login.microsoftonline.com/{tenant}/v2.0/.well-known/openid-configuration";
const GOOGLE_DISCOVERY: &str = "https://accounts.google.com/.well-known/openid-configuration";
const GITHUB_DISCOVERY: &str = "https://token.actions.githubusercontent.com/.well-known/openid-configuration";

#[derive(Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

#[derive(Deserialize, Clone)]
struct Jwk {
    kid: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
}

#[derive(Deserialize, Clone)]
struct JwkSet {
    keys: Vec<Jwk>,
}

/// Verifies bearer JWTs across all six [`JwtMode`] variants, caching fetched
/// JWKS and discovery documents per method-specific timeout (§5: "Gateway
/// auth methods that perform outbound verification...have their own
/// per-method timeout independent of the invocation deadline").
pub struct JwtVerifier {
    http: reqwest::Client,
    jwks_cache: Cache<String, Arc<JwkSet>>,
    timeout: Duration,
}

impl JwtVerifier {
    /// Build a verifier with the given per-fetch timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            jwks_cache: Cache::builder()
                .time_to_live(Duration::from_secs(3600))
                .max_capacity(1_000)
                .build(),
            timeout,
        }
    }

    /// Verify `token` under `mode`, then check the configured `audience`/
    /// `issuer` claims if present.
    pub async fn verify(
        &self,
        mode: &JwtMode,
        audience: Option<&str>,
        issuer: Option<&str>,
        token: &str,
    ) -> Result<(), GatewayError> {
        let claims = tokio::time::timeout(self.timeout, self.verify_claims(mode, token))
            .await
            .map_err(|_| GatewayError::AuthTimeout)??;

        if let Some(expected) = audience {
            if !claims_contain(&claims, "aud", expected) {
                return Err(GatewayError::Unauthorized);
            }
        }
        if let Some(expected) = issuer {
            if claims.get("iss").and_then(|v| v.as_str()) != Some(expected) {
                return Err(GatewayError::Unauthorized);
            }
        }
        Ok(())
    }

    async fn verify_claims(
        &self,
        mode: &JwtMode,
        token: &str,
    ) -> Result<serde_json::Value, GatewayError> {
        match mode {
            JwtMode::FixedSecret { jwt_secret } => verify_hmac(token, jwt_secret),
            JwtMode::Microsoft { tenant_id } => {
                let url = MICROSOFT_DISCOVERY.replace("{tenant}", tenant_id);
                self.verify_via_discovery(token, &url).await
            }
            JwtMode::Google => self.verify_via_discovery(token, GOOGLE_DISCOVERY).await,
            JwtMode::Github => self.verify_via_discovery(token, GITHUB_DISCOVERY).await,
            JwtMode::JwksEndpoint { jwks_url } => self.verify_via_jwks_url(token, jwks_url).await,
            JwtMode::OidcDiscovery { oidc_url } => self.verify_via_discovery(token, oidc_url).await,
        }
    }

    async fn verify_via_discovery(
        &self,
        token: &str,
        discovery_url: &str,
    ) -> Result<serde_json::Value, GatewayError> {
        let doc: DiscoveryDocument = self
            .http
            .get(discovery_url)
            .send()
            .await
            .map_err(|e| GatewayError::BadGateway(e.to_string()))?
            .json()
            .await
            .map_err(|e| GatewayError::BadGateway(e.to_string()))?;
        self.verify_via_jwks_url(token, &doc.jwks_uri).await
    }

    async fn verify_via_jwks_url(
        &self,
        token: &str,
        jwks_url: &str,
    ) -> Result<serde_json::Value, GatewayError> {
        let header = decode_header(token).map_err(|_| GatewayError::Unauthorized)?;

        let mut set = self.fetch_jwks(jwks_url).await?;
        let mut jwk = find_jwk(&set, header.kid.as_deref());
        if jwk.is_none() {
            // Refresh once on kid miss (§4.6) — covers key rotation between
            // our cache's TTL and the issuer's.
            self.jwks_cache.invalidate(jwks_url).await;
            set = self.fetch_jwks(jwks_url).await?;
            jwk = find_jwk(&set, header.kid.as_deref());
        }
        let jwk = jwk.ok_or(GatewayError::Unauthorized)?;

        let (n, e) = match (&jwk.n, &jwk.e) {
            (Some(n), Some(e)) => (n, e),
            _ => return Err(GatewayError::Unauthorized),
        };
        let decoding_key =
            DecodingKey::from_rsa_components(n, e).map_err(|_| GatewayError::Unauthorized)?;

        let mut validation = Validation::new(header.alg);
        validation.validate_aud = false;
        let data = decode::<serde_json::Value>(token, &decoding_key, &validation)
            .map_err(|_| GatewayError::Unauthorized)?;
        Ok(data.claims)
    }

    async fn fetch_jwks(&self, jwks_url: &str) -> Result<Arc<JwkSet>, GatewayError> {
        if let Some(cached) = self.jwks_cache.get(jwks_url).await {
            return Ok(cached);
        }
        let set: JwkSet = self
            .http
            .get(jwks_url)
            .send()
            .await
            .map_err(|e| GatewayError::BadGateway(e.to_string()))?
            .json()
            .await
            .map_err(|e| GatewayError::BadGateway(e.to_string()))?;
        let set = Arc::new(set);
        self.jwks_cache.insert(jwks_url.to_string(), set.clone()).await;
        Ok(set)
    }
}

fn find_jwk(set: &JwkSet, kid: Option<&str>) -> Option<Jwk> {
    match kid {
        Some(kid) => set.keys.iter().find(|k| k.kid.as_deref() == Some(kid)).cloned(),
        None => set.keys.first().cloned(),
    }
}

fn verify_hmac(token: &str, secret: &str) -> Result<serde_json::Value, GatewayError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_aud = false;
    let data = decode::<serde_json::Value>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|_| GatewayError::Unauthorized)?;
    Ok(data.claims)
}

fn claims_contain(claims: &serde_json::Value, field: &str, expected: &str) -> bool {
    match claims.get(field) {
        Some(serde_json::Value::String(s)) => s == expected,
        Some(serde_json::Value::Array(values)) => {
            values.iter().any(|v| v.as_str() == Some(expected))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct Claims {
        aud: String,
        iss: String,
    }

    #[tokio::test]
    async fn fixed_secret_accepts_matching_hmac_token() {
        let secret = "super-secret";
        let token = encode(
            &Header::new(Algorithm::HS256),
            &Claims { aud: "api".into(), iss: "issuer".into() },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let verifier = JwtVerifier::new(Duration::from_secs(1));
        let mode = JwtMode::FixedSecret { jwt_secret: secret.to_string() };
        verifier.verify(&mode, Some("api"), Some("issuer"), &token).await.unwrap();
    }

    #[tokio::test]
    async fn fixed_secret_rejects_wrong_audience() {
        let secret = "super-secret";
        let token = encode(
            &Header::new(Algorithm::HS256),
            &Claims { aud: "api".into(), iss: "issuer".into() },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let verifier = JwtVerifier::new(Duration::from_secs(1));
        let mode = JwtMode::FixedSecret { jwt_secret: secret.to_string() };
        let err = verifier.verify(&mode, Some("other"), None, &token).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized));
    }

    #[tokio::test]
    async fn fixed_secret_rejects_wrong_key() {
        let token = encode(
            &Header::new(Algorithm::HS256),
            &Claims { aud: "api".into(), iss: "issuer".into() },
            &EncodingKey::from_secret(b"right-secret"),
        )
        .unwrap();

        let verifier = JwtVerifier::new(Duration::from_secs(1));
        let mode = JwtMode::FixedSecret { jwt_secret: "wrong-secret".to_string() };
        let err = verifier.verify(&mode, None, None, &token).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unauthorized));
    }
}
