// SPDX-License-Identifier: MIT OR Apache-2.0
//! The execution engine (C6, §4.4): the subsystem an inbound HTTP
//! invocation actually runs through. Owns the pre-invocation pipeline
//! (metadata lookup, admission, package resolution, environment, policy
//! load), dispatches the request to a pooled isolate over the sandbox
//! protocol, and performs post-invocation bookkeeping (execution log
//! write, isolate release-or-discard).
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// API-key admission: credential extraction and constant-time comparison.
pub mod admission;
/// In-memory read caches for the pre-invocation pipeline, invalidated by
/// `fp-invalidation` events.
pub mod cache;
/// The network egress guard invoked by handler outbound-connection hooks.
pub mod egress;
/// The execution engine's own error taxonomy, mapped onto [`fp_error::ErrorCode`].
pub mod error;
/// Translates raw inbound HTTP into the sandbox bridge's `Request` shape.
pub mod http;
/// The five-step pre-invocation pipeline (§4.4 steps 1-5).
pub mod pipeline;
/// In-process invocation metrics.
pub mod telemetry;

use cache::ExecutorCache;
use error::ExecutionError;
use fp_cache::PackageCache;
use fp_invalidation::InvalidationEvent;
use fp_pool::{AcquiredIsolate, IsolateKey, IsolatePool, PoolConfig};
use fp_sandbox::{InvocationOutcome, IsolateSpec};
use fp_store::logs::ExecutionLogEntry;
use fp_store::MetadataStore;
use http::RawInvocation;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry::ExecutionMetrics;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

/// How to spawn an isolate worker process for a resolved package (§9:
/// "the choice of sandbox engine...is out of scope" — this is the one
/// knob a deployment sets to plug in whichever engine it runs).
#[derive(Clone, Debug)]
pub struct IsolateRunnerConfig {
    /// Executable to run, e.g. `node` or a wrapper script.
    pub command: String,
    /// Arguments prepended before the resolved package directory, e.g.
    /// `["--isolate-entrypoint"]`.
    pub base_args: Vec<String>,
}

/// Engine-wide tunables not already owned by [`fp_pool::PoolConfig`] or
/// [`fp_cache::PackageCacheConfig`].
#[derive(Clone, Debug)]
pub struct ExecutionEngineConfig {
    /// Per-invocation wall-clock deadline (§5, `execution_timeout_ms`).
    pub execution_timeout: Duration,
    /// How long [`IsolatePool::acquire`] waits for a free slot before
    /// surfacing `Overloaded` (§7).
    pub acquire_timeout: Duration,
    /// How to spawn a fresh isolate for a resolved package.
    pub isolate_runner: IsolateRunnerConfig,
}

/// The result of one invocation: the HTTP status/body the caller receives
/// plus the bookkeeping the post-invocation step needs to write the
/// execution log.
pub struct InvocationResult {
    /// The handler's response (or a synthesized error response).
    pub response: fp_sandbox::Response,
    /// Log lines captured during the invocation, if the handler ran.
    pub logs: Vec<String>,
    /// `Some` only when the pipeline short-circuited before dispatch —
    /// carries the error code for the execution log's `error` column.
    pub error_code: Option<fp_error::ErrorCode>,
}

/// The execution log keeps the full error text (§7: "every failure is
/// recorded in the execution log with its kind"); the HTTP response never
/// does (§4.4 post-invocation: "detail redacted from clients").
struct InvocationFailure {
    code: fp_error::ErrorCode,
    detail: String,
}

/// The execution engine (C6): binds the metadata store, package cache,
/// isolate pool, and per-request caches into one invocation entry point.
pub struct ExecutionEngine {
    store: MetadataStore,
    log_store: MetadataStore,
    cache: Arc<ExecutorCache>,
    package_cache: Arc<PackageCache>,
    pool: Arc<IsolatePool>,
    config: ExecutionEngineConfig,
    metrics: Arc<ExecutionMetrics>,
}

impl ExecutionEngine {
    /// Construct an engine. `log_store` may wrap a distinct [`sqlx::PgPool`]
    /// from `store` (§5: "invocation-logging uses a separate pool...to
    /// avoid head-of-line blocking of request-path reads").
    pub fn new(
        store: MetadataStore,
        log_store: MetadataStore,
        package_cache: Arc<PackageCache>,
        pool_config: PoolConfig,
        config: ExecutionEngineConfig,
    ) -> Self {
        Self {
            store,
            log_store,
            cache: Arc::new(ExecutorCache::new()),
            package_cache,
            pool: Arc::new(IsolatePool::new(pool_config)),
            config,
            metrics: Arc::new(ExecutionMetrics::new()),
        }
    }

    /// The engine's in-process invocation metrics.
    pub fn metrics(&self) -> &ExecutionMetrics {
        &self.metrics
    }

    /// The isolate pool, for diagnostics and the daemon's background
    /// reaping task.
    pub fn pool(&self) -> &Arc<IsolatePool> {
        &self.pool
    }

    /// Spawn a background task that applies [`InvalidationEvent`]s
    /// delivered over `rx` to this engine's caches (§4.3). Intended to run
    /// once per engine for the lifetime of the process.
    pub fn spawn_invalidation_listener(
        self: &Arc<Self>,
        rx: broadcast::Receiver<InvalidationEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        tokio::spawn(cache::run_invalidation_listener(cache, rx))
    }

    /// Run one invocation end to end: the pre-invocation pipeline,
    /// isolate dispatch, and post-invocation execution log write (§4.4).
    ///
    /// Never returns `Err` — every failure mode becomes a terminal HTTP
    /// response plus a logged `error` code, matching §7's "every failure
    /// surfaces as a well-formed response, never a closed connection".
    pub async fn invoke(&self, function_id: Uuid, raw: &RawInvocation) -> InvocationResult {
        let start = Instant::now();
        let request_bytes = raw.body.len() as u64;
        let request = http::build_request(raw);

        let outcome = self.try_invoke(function_id, &request).await;

        let (response, logs, failure) = match outcome {
            Ok((response, logs)) => (response, logs, None),
            Err(err) => {
                let code = fp_error::ErrorCode::from(&err);
                warn!(target: "fp.executor", function_id = %function_id, error = %err, code = %code, "invocation failed");
                let failure = InvocationFailure {
                    code,
                    detail: err.to_string(),
                };
                (error_response(code), Vec::new(), Some(failure))
            }
        };

        let duration_ms = start.elapsed().as_millis() as u32;
        let status_code = response.status;
        self.metrics.record_invocation(status_code, duration_ms as u64);

        let error_code = failure.as_ref().map(|f| f.code);
        self.write_execution_log(
            function_id,
            status_code,
            duration_ms,
            request_bytes,
            response.body.len() as u64,
            failure,
            raw,
        )
        .await;

        InvocationResult {
            response,
            logs,
            error_code,
        }
    }

    async fn try_invoke(
        &self,
        function_id: Uuid,
        request: &fp_sandbox::Request,
    ) -> Result<(fp_sandbox::Response, Vec<String>), ExecutionError> {
        let prepared = pipeline::prepare(
            &self.store,
            &self.cache,
            &self.package_cache,
            function_id,
            request,
        )
        .await?;

        let key = IsolateKey::new(
            prepared.function.id.to_string(),
            package_hash_of(&prepared),
        );
        let spec = self.isolate_spec(&key, prepared.package.path(), &prepared);

        let mut acquired = self
            .pool
            .acquire(key.clone(), spec, self.config.acquire_timeout)
            .await
            .map_err(ExecutionError::from)?;

        let dispatch_result = self.dispatch(&mut acquired, request).await;

        match dispatch_result {
            Ok(InvocationOutcome { response, logs }) => {
                self.pool.release(acquired).await;
                Ok((response, logs))
            }
            Err(err) => {
                // A poisoned isolate is never returned to the pool;
                // `release` discards it once `is_poisoned()` is observed.
                self.pool.release(acquired).await;
                Err(ExecutionError::from(err))
            }
        }
    }

    async fn dispatch(
        &self,
        acquired: &mut AcquiredIsolate,
        request: &fp_sandbox::Request,
    ) -> Result<InvocationOutcome, fp_sandbox::SandboxError> {
        acquired
            .client_mut()
            .invoke(request.clone(), self.config.execution_timeout)
            .await
    }

    fn isolate_spec(
        &self,
        key: &IsolateKey,
        package_dir: &std::path::Path,
        prepared: &pipeline::PreparedInvocation,
    ) -> IsolateSpec {
        let mut args = self.config.isolate_runner.base_args.clone();
        args.push(package_dir.display().to_string());

        let env: BTreeMap<String, String> = prepared
            .env_vars
            .iter()
            .map(|v| (v.key.clone(), v.value.clone()))
            .collect();

        info!(target: "fp.executor", function_id = %key.function_id, "dispatching invocation");

        IsolateSpec {
            command: self.config.isolate_runner.command.clone(),
            args,
            env,
            cwd: PathBuf::from(package_dir),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_execution_log(
        &self,
        function_id: Uuid,
        status_code: u16,
        execution_time_ms: u32,
        request_bytes: u64,
        response_bytes: u64,
        failure: Option<InvocationFailure>,
        raw: &RawInvocation,
    ) {
        // The log keeps `kind: detail` so operators can distinguish user
        // faults from platform faults without losing the handler's own
        // error text (§7) — the HTTP response the client saw carries only
        // the code, via `error_response`.
        let entry = ExecutionLogEntry {
            function_id,
            status_code,
            execution_time_ms,
            request_bytes,
            response_bytes,
            error: failure.map(|f| format!("{}: {}", f.code.as_str(), f.detail)),
            client_ip: raw.client_ip.clone(),
            user_agent: raw
                .headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("user-agent"))
                .map(|(_, v)| v.clone()),
        };

        if let Err(err) = self.log_store.insert_execution_log(entry).await {
            // A failed execution-log write never fails the invocation
            // itself (§4.4: the response has already been decided) — it's
            // logged locally and otherwise swallowed.
            warn!(target: "fp.executor", function_id = %function_id, error = %err, "failed to write execution log");
        }
    }
}

fn package_hash_of(prepared: &pipeline::PreparedInvocation) -> String {
    // `prepared.package` is already resolved against the function's active
    // version's package hash; the isolate pool keys on the same hash so
    // a version switch spins up a distinct warm pool rather than reusing
    // isolates bound to stale handler code (§4.2).
    prepared
        .package
        .path()
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

/// Build the client-facing error response for `code`. Carries only the
/// error kind, never the underlying error's message — the full detail
/// goes to the execution log instead (§4.4 post-invocation: "detail
/// redacted from clients").
fn error_response(code: fp_error::ErrorCode) -> fp_sandbox::Response {
    let body = serde_json::json!({ "error": code.as_str() });
    fp_sandbox::Response::new()
        .status(code.http_status())
        .json(&body)
        .unwrap_or_else(|_| fp_sandbox::Response::new().status(500))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_uses_error_codes_http_status() {
        let resp = error_response(fp_error::ErrorCode::NotFound);
        assert_eq!(resp.status, 404);
    }

    #[test]
    fn error_response_is_valid_json_body() {
        let resp = error_response(fp_error::ErrorCode::Unauthorized);
        let value: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(value["error"], "UNAUTHORIZED");
    }

    #[test]
    fn error_response_never_leaks_handler_detail() {
        // A `HandlerError`'s message (the handler's own uncaught exception
        // text) must never reach the client body — only its error kind.
        let resp = error_response(fp_error::ErrorCode::HandlerError);
        let value: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
        assert_eq!(value.as_object().unwrap().len(), 1);
        assert_eq!(value["error"], "HANDLER_ERROR");
    }
}
