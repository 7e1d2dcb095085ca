// SPDX-License-Identifier: MIT OR Apache-2.0
//! Execution engine error taxonomy (§7), mapped onto [`fp_error::ErrorCode`]
//! at the boundary where a response is generated.

use fp_error::ErrorCode;
use thiserror::Error;

/// Failure modes internal to one invocation's pre-invocation pipeline or
/// dispatch. Never propagated past [`crate::ExecutionEngine::invoke`] —
/// every variant is caught and turned into an HTTP response plus an
/// execution log entry (§4.4 "Post-invocation").
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// No such function, or it is not active.
    #[error("function not found")]
    FunctionNotFound,
    /// `requires_api_key` is set and the presented credential didn't match.
    #[error("unauthorized")]
    Unauthorized,
    /// Package resolution failed (§4.1).
    #[error("package resolution: {0}")]
    Package(#[from] fp_cache::CacheError),
    /// Isolate pool could not produce an isolate in time.
    #[error("isolate pool: {0}")]
    Pool(#[from] fp_pool::PoolError),
    /// The isolate's sandboxed dispatch failed.
    #[error("sandbox: {0}")]
    Sandbox(#[from] fp_sandbox::SandboxError),
    /// The metadata store was unreachable even after retrying.
    #[error("metadata store: {0}")]
    Store(#[from] fp_store::StoreError),
}

impl From<&ExecutionError> for ErrorCode {
    fn from(err: &ExecutionError) -> Self {
        match err {
            ExecutionError::FunctionNotFound => ErrorCode::NotFound,
            ExecutionError::Unauthorized => ErrorCode::Unauthorized,
            ExecutionError::Package(e) => ErrorCode::from(e),
            ExecutionError::Pool(e) => ErrorCode::from(e),
            ExecutionError::Sandbox(e) => ErrorCode::from(e),
            ExecutionError::Store(_) => ErrorCode::StorageUnavailable,
        }
    }
}

/// Whether a `StoreError` is worth retrying locally (§7: "recoverable
/// errors...are retried locally"). `NotFound` is a user fault, never
/// retryable; anything else is treated as a transient database hiccup.
pub fn store_error_is_retryable(err: &fp_store::StoreError) -> bool {
    !matches!(err, fp_store::StoreError::NotFound(_))
}
