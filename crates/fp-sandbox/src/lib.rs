// SPDX-License-Identifier: MIT OR Apache-2.0
//! The isolate sandbox contract (§4.2, §4.4): spawns an isolate worker as
//! a child process and exchanges [`Request`]/[`Response`] pairs with it
//! over a newline-delimited JSON protocol on its stdin/stdout.
//!
//! This crate defines the contract only — which engine actually executes
//! handler code inside the worker process (a V8 isolate, a WASM runtime,
//! a container) is out of scope (§1) and is whatever `command`/`args` in
//! [`IsolateSpec`] point at, so long as it speaks this protocol.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod bridge;
pub mod protocol;

pub use bridge::{empty_request, resolve_in_package_root, CookieOptions, Request, Response, SandboxBridgeError};
pub use protocol::{Envelope, JsonlCodec, ProtocolError};

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

/// Configuration for spawning an isolate worker process.
#[derive(Debug, Clone)]
pub struct IsolateSpec {
    /// Executable command to run.
    pub command: String,
    /// Arguments passed to the command (typically including the path to
    /// the extracted package's entrypoint, §4.1/§4.2).
    pub args: Vec<String>,
    /// Environment variables set for the process — the function's
    /// configured env vars (§4.4 step 4), not inherited from the host.
    pub env: BTreeMap<String, String>,
    /// Working directory; the restricted filesystem view's root.
    pub cwd: PathBuf,
}

/// Errors from isolate process management and protocol handling.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Failed to spawn the isolate process.
    #[error("failed to spawn isolate: {0}")]
    Spawn(#[source] std::io::Error),
    /// Failed to read the isolate's stdout.
    #[error("failed to read isolate stdout: {0}")]
    Stdout(#[source] std::io::Error),
    /// Failed to write to the isolate's stdin.
    #[error("failed to write isolate stdin: {0}")]
    Stdin(#[source] std::io::Error),
    /// A line didn't decode per the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// A well-formed but out-of-sequence envelope arrived.
    #[error("isolate protocol violation: {0}")]
    Violation(String),
    /// The isolate exited before completing the handshake or an invocation.
    #[error("isolate exited unexpectedly (code={code:?})")]
    Exited {
        /// The process exit code, if one was observed.
        code: Option<i32>,
    },
    /// The handler raised an uncaught error (`Fatal` envelope).
    #[error("handler error: {0}")]
    HandlerError(String),
    /// The invocation exceeded its configured timeout (§4.2 item 4). The
    /// isolate has been killed; it must not be returned to the pool.
    #[error("invocation timed out")]
    Timeout,
    /// The isolate exceeded its memory budget (§4.2 item 4, a worker-side
    /// signal delivered as a `Fatal` envelope with a recognized marker).
    /// The isolate has been killed; it must not be returned to the pool.
    #[error("isolate exceeded its memory budget")]
    MemoryExceeded,
    /// `invoke` was called on an isolate already poisoned by a prior
    /// timeout, memory violation, or protocol error.
    #[error("isolate is poisoned and must be destroyed")]
    Poisoned,
}

impl From<&SandboxError> for fp_error::ErrorCode {
    fn from(err: &SandboxError) -> Self {
        match err {
            SandboxError::Timeout => fp_error::ErrorCode::Timeout,
            SandboxError::MemoryExceeded => fp_error::ErrorCode::MemoryExhausted,
            SandboxError::HandlerError(_) => fp_error::ErrorCode::HandlerError,
            SandboxError::Spawn(_)
            | SandboxError::Stdout(_)
            | SandboxError::Stdin(_)
            | SandboxError::Protocol(_)
            | SandboxError::Violation(_)
            | SandboxError::Exited { .. }
            | SandboxError::Poisoned => fp_error::ErrorCode::Internal,
        }
    }
}

const MEMORY_EXCEEDED_MARKER: &str = "__fp_memory_exceeded__";

/// The outcome of one successful invocation.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    /// The handler's response.
    pub response: Response,
    /// Log lines captured during the invocation, in arrival order.
    pub logs: Vec<String>,
}

/// A spawned isolate worker that has completed its `hello` handshake and
/// is ready to receive invocations.
pub struct IsolateClient {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<tokio::process::ChildStdout>,
    /// The worker's reported protocol version.
    pub contract_version: String,
    poisoned: bool,
}

impl IsolateClient {
    /// Spawn an isolate worker and perform the `hello` handshake. The
    /// worker must emit a `hello` envelope as its first stdout line.
    pub async fn spawn(spec: IsolateSpec) -> Result<Self, SandboxError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .env_clear()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(SandboxError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Violation("isolate stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Violation("isolate stdout unavailable".into()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr);
                let mut line = String::new();
                loop {
                    line.clear();
                    match r.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            let s = line.trim_end();
                            if !s.is_empty() {
                                warn!(target: "fp.sandbox.stderr", "{s}");
                            }
                        }
                    }
                }
            });
        }

        let mut stdout = BufReader::new(stdout);

        let mut line = String::new();
        let n = stdout.read_line(&mut line).await.map_err(SandboxError::Stdout)?;
        if n == 0 {
            let status = child.wait().await.ok();
            return Err(SandboxError::Exited {
                code: status.and_then(|s| s.code()),
            });
        }

        let contract_version = match JsonlCodec::decode(line.trim_end())? {
            Envelope::Hello { contract_version } => contract_version,
            other => {
                return Err(SandboxError::Protocol(ProtocolError::UnexpectedMessage {
                    expected: "hello".into(),
                    got: format!("{other:?}"),
                }));
            }
        };

        Ok(Self {
            child,
            stdin,
            stdout,
            contract_version,
            poisoned: false,
        })
    }

    /// Send `request` and wait for the matching response, enforcing
    /// `timeout`. On timeout, the isolate is killed and subsequent calls
    /// to `invoke` return [`SandboxError::Poisoned`] — callers must not
    /// return a poisoned isolate to the pool (§4.2 item 4).
    pub async fn invoke(
        &mut self,
        request: Request,
        timeout: Duration,
    ) -> Result<InvocationOutcome, SandboxError> {
        if self.poisoned {
            return Err(SandboxError::Poisoned);
        }

        let id = Uuid::new_v4().to_string();
        let result = tokio::time::timeout(timeout, self.invoke_inner(&id, request)).await;

        match result {
            Ok(inner) => {
                if inner.is_err() {
                    self.poisoned = true;
                }
                inner
            }
            Err(_elapsed) => {
                self.poisoned = true;
                let _ = self.child.start_kill();
                Err(SandboxError::Timeout)
            }
        }
    }

    async fn invoke_inner(
        &mut self,
        id: &str,
        request: Request,
    ) -> Result<InvocationOutcome, SandboxError> {
        let msg = Envelope::Invoke {
            id: id.to_string(),
            request,
        };
        let line = JsonlCodec::encode(&msg)?;
        self.stdin.write_all(line.as_bytes()).await.map_err(SandboxError::Stdin)?;
        self.stdin.flush().await.map_err(SandboxError::Stdin)?;

        let mut logs = Vec::new();
        let mut buf = String::new();
        loop {
            buf.clear();
            let n = self.stdout.read_line(&mut buf).await.map_err(SandboxError::Stdout)?;
            if n == 0 {
                let status = self.child.wait().await.ok();
                return Err(SandboxError::Exited {
                    code: status.and_then(|s| s.code()),
                });
            }

            let line = buf.trim_end();
            if line.is_empty() {
                continue;
            }

            match JsonlCodec::decode(line)? {
                Envelope::Log { ref_id, line } if ref_id == id => logs.push(line),
                Envelope::Log { .. } => continue,
                Envelope::Response { ref_id, response } if ref_id == id => {
                    return Ok(InvocationOutcome { response, logs });
                }
                Envelope::Response { .. } => continue,
                Envelope::Fatal { ref_id, error } if ref_id.as_deref() == Some(id) || ref_id.is_none() => {
                    if error == MEMORY_EXCEEDED_MARKER {
                        return Err(SandboxError::MemoryExceeded);
                    }
                    return Err(SandboxError::HandlerError(error));
                }
                Envelope::Fatal { .. } => continue,
                Envelope::Hello { .. } => continue,
                other => {
                    return Err(SandboxError::Violation(format!(
                        "unexpected message during invocation: {other:?}"
                    )));
                }
            }
        }
    }

    /// Whether a prior `invoke` call left this isolate unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Forcibly terminate the isolate process (used by the pool on
    /// eviction or after a poisoning event).
    pub async fn kill(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}
