//! Unified error taxonomy with stable error codes for the function platform.
//!
//! Every platform error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag), a human-readable message, an optional cause chain, and
//! arbitrary key-value context. Use the builder returned by
//! [`PlatformError::new`] to construct errors fluently. [`ErrorCode::http_status`]
//! gives the executor and gateway a single place to decide which status code
//! a given failure surfaces as (§7 of the platform contract).
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed client input or unknown routes.
    Request,
    /// Admission / authentication / authorization failures.
    Auth,
    /// Package cache and object-store faults.
    Package,
    /// Isolate pool exhaustion or lifecycle faults.
    Isolate,
    /// Egress / network policy faults.
    Network,
    /// Uncaught handler faults.
    Handler,
    /// Gateway routing and upstream faults.
    Gateway,
    /// Configuration errors.
    Config,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Request => "request",
            Self::Auth => "auth",
            Self::Package => "package",
            Self::Isolate => "isolate",
            Self::Network => "network",
            Self::Handler => "handler",
            Self::Gateway => "gateway",
            Self::Config => "config",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that is
/// guaranteed not to change across patch releases. See §7 of the platform
/// contract for the taxonomy this mirrors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed input, unknown route, invalid auth-method config.
    BadRequest,
    /// Admission presented no or an incorrect credential.
    Unauthorized,
    /// Admission was presented but the caller lacks permission.
    Forbidden,
    /// Missing function, route, or version.
    NotFound,
    /// Requested package object does not exist in the object store.
    PackageMissing,
    /// On-disk or fetched package content does not hash to the recorded value.
    HashMismatch,
    /// The object store or metadata store is unreachable.
    StorageUnavailable,
    /// The isolate pool has no capacity and the acquire wait elapsed.
    Overloaded,
    /// Per-invocation wall-clock deadline exceeded.
    Timeout,
    /// Per-invocation memory ceiling exceeded.
    MemoryExhausted,
    /// Handler attempted an outbound connection the network policy denies.
    EgressDenied,
    /// Handler threw or its returned promise rejected before a terminal response.
    HandlerError,
    /// Gateway auth-method verification (JWKS/OIDC) exceeded its budget.
    AuthTimeout,
    /// Configuration file or value is invalid.
    ConfigInvalid,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::BadRequest => ErrorCategory::Request,
            Self::Unauthorized | Self::Forbidden | Self::AuthTimeout => ErrorCategory::Auth,
            Self::NotFound => ErrorCategory::Request,
            Self::PackageMissing | Self::HashMismatch | Self::StorageUnavailable => {
                ErrorCategory::Package
            }
            Self::Overloaded | Self::Timeout | Self::MemoryExhausted => ErrorCategory::Isolate,
            Self::EgressDenied => ErrorCategory::Network,
            Self::HandlerError => ErrorCategory::Handler,
            Self::ConfigInvalid => ErrorCategory::Config,
            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"BAD_REQUEST"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::PackageMissing => "PACKAGE_MISSING",
            Self::HashMismatch => "HASH_MISMATCH",
            Self::StorageUnavailable => "STORAGE_UNAVAILABLE",
            Self::Overloaded => "OVERLOADED",
            Self::Timeout => "TIMEOUT",
            Self::MemoryExhausted => "MEMORY_EXHAUSTED",
            Self::EgressDenied => "EGRESS_DENIED",
            Self::HandlerError => "HANDLER_ERROR",
            Self::AuthTimeout => "AUTH_TIMEOUT",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::Internal => "INTERNAL",
        }
    }

    /// The HTTP status this error kind surfaces as at the executor or
    /// gateway boundary (§6, §7). Infrastructure faults that are retried
    /// locally (`StorageUnavailable`) surface as `502` only once retries are
    /// exhausted — this is the *terminal* status, not a per-attempt one.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::PackageMissing | Self::StorageUnavailable => 502,
            Self::HashMismatch => 502,
            Self::Overloaded => 503,
            Self::Timeout | Self::AuthTimeout => 504,
            Self::MemoryExhausted | Self::HandlerError | Self::Internal | Self::ConfigInvalid => {
                500
            }
            Self::EgressDenied => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PlatformError
// ---------------------------------------------------------------------------

/// Unified platform error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use fp_error::{PlatformError, ErrorCode};
///
/// let err = PlatformError::new(ErrorCode::Timeout, "execution exceeded deadline")
///     .with_context("function_id", "f1")
///     .with_context("timeout_ms", 5_000);
/// ```
pub struct PlatformError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description. Never sent verbatim to clients for
    /// `HandlerError` — the execution log gets the detail, the client gets
    /// a redacted body (§4.4).
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics, persisted alongside the
    /// execution log entry.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl PlatformError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Shorthand for `self.code.http_status()`.
    pub fn http_status(&self) -> u16 {
        self.code.http_status()
    }

    /// The body returned to an HTTP caller. `HandlerError` and `Internal`
    /// are redacted — the real message only ever reaches the execution log
    /// via [`PlatformErrorDto`].
    pub fn client_message(&self) -> &'static str {
        match self.code {
            ErrorCode::HandlerError | ErrorCode::Internal => "internal",
            ErrorCode::BadRequest => "bad request",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::NotFound => "not found",
            ErrorCode::PackageMissing | ErrorCode::HashMismatch | ErrorCode::StorageUnavailable => {
                "bad gateway"
            }
            ErrorCode::Overloaded => "service overloaded",
            ErrorCode::Timeout => "gateway timeout",
            ErrorCode::MemoryExhausted => "internal",
            ErrorCode::EgressDenied => "internal",
            ErrorCode::AuthTimeout => "gateway timeout",
            ErrorCode::ConfigInvalid => "internal",
        }
    }
}

impl fmt::Debug for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("PlatformError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for PlatformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`PlatformError`] (without the opaque source),
/// suitable for embedding in an `ExecutionLog` row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlatformErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message (never redacted here — this is the log, not
    /// the client response).
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&PlatformError> for PlatformErrorDto {
    fn from(err: &PlatformError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<PlatformErrorDto> for PlatformError {
    fn from(dto: PlatformErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::BadRequest,
        ErrorCode::Unauthorized,
        ErrorCode::Forbidden,
        ErrorCode::NotFound,
        ErrorCode::PackageMissing,
        ErrorCode::HashMismatch,
        ErrorCode::StorageUnavailable,
        ErrorCode::Overloaded,
        ErrorCode::Timeout,
        ErrorCode::MemoryExhausted,
        ErrorCode::EgressDenied,
        ErrorCode::HandlerError,
        ErrorCode::AuthTimeout,
        ErrorCode::ConfigInvalid,
        ErrorCode::Internal,
    ];

    #[test]
    fn basic_construction() {
        let err = PlatformError::new(ErrorCode::Internal, "boom");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = PlatformError::new(ErrorCode::NotFound, "no such function");
        assert_eq!(err.to_string(), "[NOT_FOUND] no such function");
    }

    #[test]
    fn display_with_context() {
        let err = PlatformError::new(ErrorCode::Timeout, "timed out")
            .with_context("timeout_ms", 5000);
        let s = err.to_string();
        assert!(s.starts_with("[TIMEOUT] timed out"));
        assert!(s.contains("timeout_ms"));
        assert!(s.contains("5000"));
    }

    #[test]
    fn debug_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err = PlatformError::new(ErrorCode::PackageMissing, "no package").with_source(src);
        let dbg = format!("{err:?}");
        assert!(dbg.contains("source"));
        assert!(dbg.contains("file missing"));
    }

    #[test]
    fn http_status_mapping_matches_contract() {
        assert_eq!(ErrorCode::Unauthorized.http_status(), 401);
        assert_eq!(ErrorCode::Forbidden.http_status(), 403);
        assert_eq!(ErrorCode::NotFound.http_status(), 404);
        assert_eq!(ErrorCode::Overloaded.http_status(), 503);
        assert_eq!(ErrorCode::Timeout.http_status(), 504);
        assert_eq!(ErrorCode::AuthTimeout.http_status(), 504);
        assert_eq!(ErrorCode::HandlerError.http_status(), 500);
        assert_eq!(ErrorCode::StorageUnavailable.http_status(), 502);
    }

    #[test]
    fn handler_error_and_internal_are_redacted_to_clients() {
        let err = PlatformError::new(ErrorCode::HandlerError, "nil pointer at line 42");
        assert_eq!(err.client_message(), "internal");
        assert!(!err.client_message().contains("nil pointer"));
    }

    #[test]
    fn builder_with_context_multiple_keys() {
        let err = PlatformError::new(ErrorCode::Timeout, "timeout")
            .with_context("function_id", "f1")
            .with_context("timeout_ms", 30_000)
            .with_context("retries", 3);
        assert_eq!(err.context.len(), 3);
        assert_eq!(err.context["function_id"], serde_json::json!("f1"));
    }

    #[test]
    fn category_shorthand() {
        let err = PlatformError::new(ErrorCode::EgressDenied, "denied");
        assert_eq!(err.category(), ErrorCategory::Network);
    }

    #[test]
    fn error_code_serde_roundtrip() {
        let code = ErrorCode::HashMismatch;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, r#""HASH_MISMATCH""#);
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn dto_roundtrip_without_source() {
        let err =
            PlatformError::new(ErrorCode::BadRequest, "bad input").with_context("field", "path");
        let dto: PlatformErrorDto = (&err).into();
        let json = serde_json::to_string(&dto).unwrap();
        let back: PlatformErrorDto = serde_json::from_str(&json).unwrap();
        assert_eq!(dto, back);
        assert!(back.source_message.is_none());
    }

    #[test]
    fn dto_roundtrip_with_source() {
        let src = io::Error::new(io::ErrorKind::BrokenPipe, "pipe broke");
        let err = PlatformError::new(ErrorCode::StorageUnavailable, "store down").with_source(src);
        let dto: PlatformErrorDto = (&err).into();
        assert_eq!(dto.source_message.as_deref(), Some("pipe broke"));
    }

    #[test]
    fn std_error_source_chain() {
        let inner = io::Error::new(io::ErrorKind::NotFound, "not found");
        let err = PlatformError::new(ErrorCode::NotFound, "missing").with_source(inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "not found");
    }

    #[test]
    fn all_codes_have_unique_as_str() {
        let mut seen = HashSet::new();
        for code in ALL_CODES {
            assert!(seen.insert(code.as_str()));
        }
        assert_eq!(seen.len(), ALL_CODES.len());
    }

    #[test]
    fn all_codes_display_matches_as_str() {
        for code in ALL_CODES {
            assert_eq!(code.to_string(), code.as_str());
        }
    }

    #[test]
    fn error_code_count() {
        assert_eq!(ALL_CODES.len(), 15);
    }

    #[test]
    fn error_category_display() {
        assert_eq!(ErrorCategory::Request.to_string(), "request");
        assert_eq!(ErrorCategory::Internal.to_string(), "internal");
    }
}
