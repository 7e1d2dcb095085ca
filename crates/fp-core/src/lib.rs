// SPDX-License-Identifier: MIT OR Apache-2.0
//! fp-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Stable domain types for the function platform: [`Project`], [`Function`],
//! [`FunctionVersion`], [`FunctionEnvironmentVariable`], [`NetworkPolicyRule`],
//! [`GatewayConfig`], [`GatewayRoute`], [`GatewayAuthMethod`],
//! [`RouteAuthBinding`], and [`ExecutionLog`].
//!
//! If you only take one dependency to model the platform's data, take this
//! one.

/// Invariant checks over the domain types (active-version binding, version
/// monotonicity, route unambiguity).
pub mod validate;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Current contract version string embedded in API responses that echo it.
pub const CONTRACT_VERSION: &str = "fp/v1";

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

/// A tenant boundary owning functions, gateway configuration, and
/// project-scoped network policies.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Project {
    /// Unique identifier.
    pub id: Uuid,
    /// Project slug, used as the default gateway prefix.
    pub slug: String,
    /// Whether the project accepts invocations and admin mutations.
    pub active: bool,
    /// KV-storage quota in bytes, enforced by the sandbox's key-value
    /// surface (not modeled further here — owned by the sandbox host).
    pub kv_quota_bytes: u64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Function / FunctionVersion
// ---------------------------------------------------------------------------

/// A deployable unit of user code, unique by name within its project.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Function {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Name, unique within the project.
    pub name: String,
    /// Whether the function accepts invocations.
    pub active: bool,
    /// Whether `Admission` (§4.4 step 2) must succeed before dispatch.
    pub requires_api_key: bool,
    /// SHA-256 hash of the configured API key, compared in constant time.
    /// `None` when `requires_api_key` is false.
    pub api_key_hash: Option<String>,
    /// The version currently served by invocations, if any.
    pub active_version_id: Option<Uuid>,
    /// Optional per-function retention override; falls back to the
    /// platform default when absent.
    pub retention: Option<RetentionPolicy>,
    /// Optional cron schedule; the scheduler collaborator (C8, boundary)
    /// reads this to decide when to invoke the function.
    pub schedule: Option<String>,
    /// Running count of invocations, incremented atomically with each
    /// execution log insert.
    pub execution_count: u64,
    /// Timestamp of the most recent invocation.
    pub last_executed: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Time- or count-based execution log retention.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep logs newer than this many days.
    Time {
        /// Retention window in days.
        days: u32,
    },
    /// Keep at most this many logs per function.
    Count {
        /// Maximum log rows retained.
        limit: u32,
    },
}

/// An immutable, monotonically versioned upload of a function's code
/// package.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FunctionVersion {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning function.
    pub function_id: Uuid,
    /// Monotonically increasing per-function version number. Never reused.
    pub version: u32,
    /// Object name in the object store, e.g. `functions/{id}/{hash}.tgz`.
    pub object_name: String,
    /// Hex-encoded SHA-256 of the package bytes; both the object-store
    /// integrity check and the package-cache key component.
    pub package_hash: String,
    /// Package size in bytes.
    pub size_bytes: u64,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Identifier of the uploader (opaque to this crate).
    pub uploaded_by: String,
}

/// A single environment variable bound to a function's invocations. Keys
/// are unique per function.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FunctionEnvironmentVariable {
    /// Owning function.
    pub function_id: Uuid,
    /// Variable name.
    pub key: String,
    /// Variable value.
    pub value: String,
}

// ---------------------------------------------------------------------------
// Network policy
// ---------------------------------------------------------------------------

/// Allow or deny a matched egress destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    /// Permit the connection.
    Allow,
    /// Refuse the connection.
    Deny,
}

/// What a [`NetworkPolicyRule`]'s `target_value` is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    /// A literal IP address.
    Ip,
    /// A CIDR block.
    Cidr,
    /// A hostname, optionally wildcarded with a `*.` prefix.
    Domain,
}

/// A single egress rule, either project-scoped or global.
///
/// Evaluation order is `priority` ascending, project rules before global
/// rules of equal priority (§4.5); the first match wins; no match is a
/// deny (invariant 4).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NetworkPolicyRule {
    /// Unique identifier.
    pub id: Uuid,
    /// `None` for a global rule.
    pub project_id: Option<Uuid>,
    /// Allow or deny.
    pub action: PolicyAction,
    /// What kind of value `target_value` holds.
    pub target_type: TargetType,
    /// The IP, CIDR, or domain (possibly `*.`-prefixed) to match.
    pub target_value: String,
    /// Lower values are evaluated first.
    pub priority: i32,
    /// Human-readable explanation surfaced in audit/log output.
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// Per-project gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning project (unique — one gateway per project).
    pub project_id: Uuid,
    /// Whether the gateway accepts traffic.
    pub enabled: bool,
    /// Optional custom domain (unique across all gateways).
    pub custom_domain: Option<String>,
}

/// A single routable path within a gateway.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayRoute {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning gateway.
    pub gateway_id: Uuid,
    /// Path template, possibly with `{param}` segments.
    pub path_template: String,
    /// HTTP methods this route accepts.
    pub methods: BTreeSet<String>,
    /// Function invoked when this route matches.
    pub target_function_id: Uuid,
    /// Optional rewrite applied to the path before forwarding to the
    /// executor.
    pub path_rewrite: Option<String>,
    /// CORS policy applied to preflight and actual requests.
    pub cors: Option<CorsPolicy>,
}

/// CORS policy attached to a [`GatewayRoute`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CorsPolicy {
    /// Allowed origins (`*` permitted).
    pub allowed_origins: Vec<String>,
    /// Allowed methods for preflight responses.
    pub allowed_methods: Vec<String>,
    /// Allowed request headers for preflight responses.
    pub allowed_headers: Vec<String>,
    /// Whether credentials (cookies, auth headers) are allowed.
    pub allow_credentials: bool,
    /// `Access-Control-Max-Age` in seconds.
    pub max_age_secs: Option<u32>,
}

/// The type of a [`GatewayAuthMethod`] and its opaque, type-specific
/// configuration (§6 Auth-method configuration schemas).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethodConfig {
    /// HTTP Basic credentials, compared in constant time.
    BasicAuth {
        /// Accepted username/password pairs.
        credentials: Vec<BasicCredential>,
    },
    /// Bearer JWT, verified per `mode`.
    BearerJwt {
        /// Verification mode.
        #[serde(flatten)]
        mode: JwtMode,
        /// Required `aud` claim, if any.
        audience: Option<String>,
        /// Required `iss` claim, if any.
        issuer: Option<String>,
    },
    /// A static list of accepted API keys.
    ApiKey {
        /// Accepted keys (compared in constant time).
        api_keys: Vec<String>,
    },
    /// Delegate the admission decision to another function.
    Middleware {
        /// The authorizer function's id.
        function_id: Uuid,
    },
}

/// A single accepted HTTP Basic credential pair.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BasicCredential {
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
}

/// JWT verification strategy for `bearer_jwt` auth methods.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "jwtMode", rename_all = "snake_case")]
pub enum JwtMode {
    /// HMAC verification with a shared secret.
    FixedSecret {
        /// The shared HMAC secret.
        jwt_secret: String,
    },
    /// OIDC discovery against a Microsoft Entra ID tenant.
    Microsoft {
        /// The Azure AD tenant id.
        tenant_id: String,
    },
    /// OIDC discovery against Google's well-known document.
    Google,
    /// OIDC discovery against GitHub's well-known document.
    Github,
    /// Fetch and cache a JWKS document directly.
    JwksEndpoint {
        /// JWKS document URL.
        jwks_url: String,
    },
    /// Fetch an OIDC discovery document, then its JWKS.
    OidcDiscovery {
        /// OIDC discovery document URL.
        oidc_url: String,
    },
}

/// A named authentication method scoped to a gateway.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayAuthMethod {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning gateway.
    pub gateway_id: Uuid,
    /// Name, unique within the gateway.
    pub name: String,
    /// Type-specific configuration.
    pub config: AuthMethodConfig,
}

/// Binds a [`GatewayRoute`] to a [`GatewayAuthMethod`]; a route is
/// authorized if **any** bound method accepts the request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RouteAuthBinding {
    /// The bound route.
    pub route_id: Uuid,
    /// The bound auth method.
    pub auth_method_id: Uuid,
    /// Evaluation order among a route's bound methods.
    pub order: i32,
}

// ---------------------------------------------------------------------------
// ExecutionLog
// ---------------------------------------------------------------------------

/// A single recorded invocation outcome.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionLog {
    /// Unique identifier.
    pub id: Uuid,
    /// The function that was invoked.
    pub function_id: Uuid,
    /// HTTP status code returned to the caller.
    pub status_code: u16,
    /// Wall-clock execution time in milliseconds.
    pub execution_time_ms: u64,
    /// Request body size in bytes.
    pub request_bytes: u64,
    /// Response body size in bytes.
    pub response_bytes: u64,
    /// Error kind (from `fp_error::ErrorCode::as_str()`), if the invocation
    /// failed.
    pub error: Option<String>,
    /// Client IP as observed by the executor, if known.
    pub client_ip: Option<String>,
    /// `User-Agent` header value, if present.
    pub user_agent: Option<String>,
    /// Timestamp of the invocation.
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_function(project_id: Uuid) -> Function {
        Function {
            id: Uuid::new_v4(),
            project_id,
            name: "hello".into(),
            active: true,
            requires_api_key: false,
            api_key_hash: None,
            active_version_id: None,
            retention: None,
            schedule: None,
            execution_count: 0,
            last_executed: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn function_serde_roundtrip() {
        let f = sample_function(Uuid::new_v4());
        let json = serde_json::to_string(&f).unwrap();
        let back: Function = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, f.id);
        assert_eq!(back.name, f.name);
    }

    #[test]
    fn retention_policy_variants_serde() {
        let t = RetentionPolicy::Time { days: 30 };
        let c = RetentionPolicy::Count { limit: 1000 };
        let tj = serde_json::to_value(&t).unwrap();
        assert_eq!(tj["type"], "time");
        let cj = serde_json::to_value(&c).unwrap();
        assert_eq!(cj["type"], "count");
    }

    #[test]
    fn auth_method_config_tagged_serde() {
        let cfg = AuthMethodConfig::ApiKey {
            api_keys: vec!["k1".into()],
        };
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["type"], "api_key");
        assert_eq!(json["api_keys"][0], "k1");
    }

    #[test]
    fn jwt_mode_fixed_secret_serde() {
        let cfg = AuthMethodConfig::BearerJwt {
            mode: JwtMode::FixedSecret {
                jwt_secret: "shh".into(),
            },
            audience: Some("aud1".into()),
            issuer: None,
        };
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["jwtMode"], "fixed_secret");
        assert_eq!(json["jwt_secret"], "shh");
        assert_eq!(json["audience"], "aud1");
    }

    #[test]
    fn network_policy_rule_global_has_no_project() {
        let rule = NetworkPolicyRule {
            id: Uuid::new_v4(),
            project_id: None,
            action: PolicyAction::Deny,
            target_type: TargetType::Domain,
            target_value: "*.evil.com".into(),
            priority: 10,
            description: None,
        };
        assert!(rule.project_id.is_none());
        assert_eq!(rule.action, PolicyAction::Deny);
    }

    #[test]
    fn contract_version_is_stable() {
        assert_eq!(CONTRACT_VERSION, "fp/v1");
    }
}
