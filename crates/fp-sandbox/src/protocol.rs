//! The JSONL wire protocol spoken between the host and an isolate worker
//! process over its stdin/stdout (§9 Design Notes: "the sandbox engine is
//! out of scope; only its behavioral contract is specified"). A worker
//! speaks exactly one envelope per line, newline-delimited, UTF-8 JSON.

use crate::bridge::{Request, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single line of the isolate worker protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// First line emitted by a freshly spawned worker.
    Hello {
        /// The worker's own protocol version string.
        contract_version: String,
    },
    /// Host → worker: invoke the handler with `request`.
    Invoke {
        /// Correlates the response/log lines that follow back to this call.
        id: String,
        /// The inbound request.
        request: Request,
    },
    /// Worker → host: a line of handler output, for the invocation's
    /// execution log (not part of the HTTP response body).
    Log {
        /// The invocation this log line belongs to.
        ref_id: String,
        /// The captured line.
        line: String,
    },
    /// Worker → host: the handler returned, terminating the invocation.
    Response {
        /// The invocation this response completes.
        ref_id: String,
        /// The handler's response.
        response: Response,
    },
    /// Worker → host: the invocation failed before producing a response
    /// (an uncaught exception, a panic, a protocol violation on the
    /// worker's own side).
    Fatal {
        /// The invocation this failure belongs to, if known.
        ref_id: Option<String>,
        /// A human-readable description.
        error: String,
    },
}

/// Errors decoding or encoding [`Envelope`] lines.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A line was not well-formed JSON, or didn't decode to an [`Envelope`].
    #[error("malformed envelope: {0}")]
    Decode(#[from] serde_json::Error),
    /// A line decoded to an envelope variant the caller wasn't expecting
    /// at this point in the handshake or run.
    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage {
        /// What the caller was waiting for.
        expected: String,
        /// A debug rendering of what arrived instead.
        got: String,
    },
}

/// Encode/decode [`Envelope`]s as newline-delimited JSON.
pub struct JsonlCodec;

impl JsonlCodec {
    /// Encode an envelope as a single line, newline included.
    pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
        let mut line = serde_json::to_string(envelope)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode a single line (without its trailing newline) into an envelope.
    pub fn decode(line: &str) -> Result<Envelope, ProtocolError> {
        Ok(serde_json::from_str(line)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{Request, Response};
    use std::collections::BTreeMap;

    #[test]
    fn hello_roundtrips() {
        let env = Envelope::Hello {
            contract_version: "fp-sandbox/v1".into(),
        };
        let line = JsonlCodec::encode(&env).unwrap();
        assert!(line.ends_with('\n'));
        let decoded = JsonlCodec::decode(line.trim_end()).unwrap();
        assert!(matches!(decoded, Envelope::Hello { .. }));
    }

    #[test]
    fn invoke_roundtrips_with_request_body() {
        let request = Request {
            method: "POST".into(),
            url: "/widgets".into(),
            headers: vec![("content-type".into(), "application/json".into())],
            cookies: BTreeMap::new(),
            query: BTreeMap::new(),
            body: b"{}".to_vec(),
        };
        let env = Envelope::Invoke {
            id: "run-1".into(),
            request,
        };
        let line = JsonlCodec::encode(&env).unwrap();
        match JsonlCodec::decode(line.trim_end()).unwrap() {
            Envelope::Invoke { id, request } => {
                assert_eq!(id, "run-1");
                assert_eq!(request.method, "POST");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn response_roundtrips() {
        let response = Response::new().status(201).send(b"ok".to_vec());
        let env = Envelope::Response {
            ref_id: "run-1".into(),
            response,
        };
        let line = JsonlCodec::encode(&env).unwrap();
        match JsonlCodec::decode(line.trim_end()).unwrap() {
            Envelope::Response { ref_id, response } => {
                assert_eq!(ref_id, "run-1");
                assert_eq!(response.status, 201);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn malformed_line_is_a_decode_error() {
        let err = JsonlCodec::decode("not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }
}
