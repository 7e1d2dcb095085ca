// SPDX-License-Identifier: MIT OR Apache-2.0
//! The invalidation bus (C3): fans Postgres `LISTEN`/`NOTIFY` events out to
//! in-process subscribers with per-key debounce (§4.3).
//!
//! Two channels are used. `gateway_invalidated` carries an empty payload —
//! any gateway configuration change triggers a full route-index reload in
//! `fp-gateway`. `execution_cache_invalidated` carries a JSON
//! [`InvalidationEvent`] naming the specific cache key to drop (env vars
//! for a function, network policy rules for a project, or the global
//! policy set) so the executor doesn't have to flush its whole cache on
//! every unrelated edit.
//!
//! Delivery is at-least-once: a reconnect after a dropped connection
//! cannot recover events missed while disconnected, so instead it emits
//! one [`InvalidationEvent::FullRefresh`] telling every subscriber to
//! treat all of its cached state as stale. Listeners are expected to be
//! idempotent with respect to redundant invalidations (§4.3).
#![deny(unsafe_code)]
#![warn(missing_docs)]

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

const GATEWAY_CHANNEL: &str = "gateway_invalidated";
const EXECUTION_CACHE_CHANNEL: &str = "execution_cache_invalidated";

/// An invalidation the bus has decided to deliver (post-debounce).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum InvalidationEvent {
    /// A gateway, its routes, or its auth configuration changed. Consumed
    /// by `fp-gateway`'s route index.
    GatewayConfig,
    /// `function_environment_variables` changed for one function.
    FunctionEnvironmentVariables {
        /// The function whose env vars changed.
        function_id: Uuid,
    },
    /// `network_policy_rules` changed for one project's rules.
    NetworkPolicyRules {
        /// The project whose rules changed.
        project_id: Uuid,
    },
    /// The global (`project_id IS NULL`) network policy rules changed.
    GlobalNetworkPolicyRules,
    /// The bus lost and regained its LISTEN connection; all cached state
    /// downstream of this bus should be treated as stale.
    FullRefresh,
}

impl InvalidationEvent {
    /// The debounce key this event collapses under. Distinct events with
    /// the same key arriving inside the debounce window are coalesced
    /// into a single delivery.
    fn debounce_key(&self) -> String {
        match self {
            InvalidationEvent::GatewayConfig => "gateway".to_string(),
            InvalidationEvent::FunctionEnvironmentVariables { function_id } => {
                format!("envvars:{function_id}")
            }
            InvalidationEvent::NetworkPolicyRules { project_id } => {
                format!("netpol:{project_id}")
            }
            InvalidationEvent::GlobalNetworkPolicyRules => "netpol:global".to_string(),
            InvalidationEvent::FullRefresh => "full-refresh".to_string(),
        }
    }
}

#[derive(Deserialize)]
struct ExecutionCacheNotifyPayload {
    table: String,
    function_id: Option<Uuid>,
    project_id: Option<Uuid>,
}

/// Errors from bus setup or the listener loop.
#[derive(Debug, Error)]
pub enum InvalidationError {
    /// Failed to establish or maintain the LISTEN connection.
    #[error("listener connection error: {0}")]
    Connection(#[from] sqlx::Error),
    /// A NOTIFY payload on `execution_cache_invalidated` didn't parse as
    /// an [`InvalidationEvent`].
    #[error("malformed notify payload: {0}")]
    MalformedPayload(String),
}

impl From<&InvalidationError> for fp_error::ErrorCode {
    fn from(_: &InvalidationError) -> Self {
        fp_error::ErrorCode::StorageUnavailable
    }
}

/// How long a debounce key suppresses repeat deliveries after firing.
#[derive(Clone, Copy, Debug)]
pub struct DebounceConfig {
    /// The suppression window.
    pub window: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(200),
        }
    }
}

/// A subscribable fan-out of [`InvalidationEvent`]s, backed by a single
/// Postgres LISTEN connection.
pub struct InvalidationBus {
    debounce: DebounceConfig,
    last_fired: Arc<DashMap<String, Instant>>,
    sender: broadcast::Sender<InvalidationEvent>,
}

impl InvalidationBus {
    /// Construct a bus with its broadcast channel pre-allocated; call
    /// [`run`](Self::run) to start consuming NOTIFYs.
    pub fn new(debounce: DebounceConfig) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            debounce,
            last_fired: Arc::new(DashMap::new()),
            sender,
        }
    }

    /// Subscribe to delivered (post-debounce) invalidation events.
    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.sender.subscribe()
    }

    /// Run the LISTEN loop against `database_url` until cancelled. Never
    /// returns `Ok` under normal operation; reconnect attempts are retried
    /// internally and each successful reconnect emits
    /// [`InvalidationEvent::FullRefresh`] before resuming.
    pub async fn run(&self, database_url: &str) -> Result<(), InvalidationError> {
        loop {
            match self.listen_until_disconnected(database_url).await {
                Ok(()) => unreachable!("listen loop only exits via error"),
                Err(err) => {
                    tracing::warn!(target: "fp.invalidation", error = %err, "listener disconnected, reconnecting");
                    self.deliver(InvalidationEvent::FullRefresh);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    async fn listen_until_disconnected(&self, database_url: &str) -> Result<(), InvalidationError> {
        let mut listener = PgListener::connect(database_url).await?;
        listener.listen(GATEWAY_CHANNEL).await?;
        listener.listen(EXECUTION_CACHE_CHANNEL).await?;
        tracing::info!(target: "fp.invalidation", "listening for invalidation notifications");

        loop {
            let notification = listener.recv().await?;
            match notification.channel() {
                GATEWAY_CHANNEL => self.deliver(InvalidationEvent::GatewayConfig),
                EXECUTION_CACHE_CHANNEL => {
                    match parse_execution_cache_payload(notification.payload()) {
                        Ok(event) => self.deliver(event),
                        Err(err) => tracing::warn!(
                            target: "fp.invalidation",
                            error = %err,
                            payload = notification.payload(),
                            "dropping malformed notify payload"
                        ),
                    }
                }
                other => tracing::debug!(target: "fp.invalidation", channel = other, "ignoring unknown channel"),
            }
        }
    }

    /// Deliver an event if it's outside its debounce window; otherwise
    /// drop it silently (a recent identical invalidation already covered
    /// it).
    fn deliver(&self, event: InvalidationEvent) {
        let key = event.debounce_key();
        let now = Instant::now();
        let should_fire = match self.last_fired.get(&key) {
            Some(last) if now.duration_since(*last) < self.debounce.window => false,
            _ => true,
        };
        if !should_fire {
            return;
        }
        self.last_fired.insert(key, now);
        // No receivers is a legitimate state (nothing has subscribed yet);
        // the send error just means the event had no audience.
        let _ = self.sender.send(event);
    }
}

fn parse_execution_cache_payload(payload: &str) -> Result<InvalidationEvent, InvalidationError> {
    let decoded: ExecutionCacheNotifyPayload = serde_json::from_str(payload)
        .map_err(|e| InvalidationError::MalformedPayload(e.to_string()))?;

    match decoded.table.as_str() {
        "function_environment_variables" => {
            let function_id = decoded.function_id.ok_or_else(|| {
                InvalidationError::MalformedPayload("missing function_id".into())
            })?;
            Ok(InvalidationEvent::FunctionEnvironmentVariables { function_id })
        }
        "network_policy_rules" => match decoded.project_id {
            Some(project_id) => Ok(InvalidationEvent::NetworkPolicyRules { project_id }),
            None => Ok(InvalidationEvent::GlobalNetworkPolicyRules),
        },
        other => Err(InvalidationError::MalformedPayload(format!(
            "unrecognized table: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounce_key_distinguishes_functions_and_projects() {
        let a = InvalidationEvent::FunctionEnvironmentVariables {
            function_id: Uuid::nil(),
        };
        let b = InvalidationEvent::NetworkPolicyRules {
            project_id: Uuid::nil(),
        };
        assert_ne!(a.debounce_key(), b.debounce_key());
    }

    #[test]
    fn global_and_project_network_policy_keys_differ() {
        let global = InvalidationEvent::GlobalNetworkPolicyRules;
        let project = InvalidationEvent::NetworkPolicyRules {
            project_id: Uuid::nil(),
        };
        assert_ne!(global.debounce_key(), project.debounce_key());
    }

    #[test]
    fn parses_env_var_payload() {
        let function_id = Uuid::new_v4();
        let payload = format!(
            r#"{{"table":"function_environment_variables","function_id":"{function_id}"}}"#
        );
        let event = parse_execution_cache_payload(&payload).unwrap();
        assert_eq!(
            event,
            InvalidationEvent::FunctionEnvironmentVariables { function_id }
        );
    }

    #[test]
    fn parses_global_policy_payload_with_null_project() {
        let payload = r#"{"table":"network_policy_rules","project_id":null}"#;
        let event = parse_execution_cache_payload(payload).unwrap();
        assert_eq!(event, InvalidationEvent::GlobalNetworkPolicyRules);
    }

    #[test]
    fn rejects_unknown_table() {
        let payload = r#"{"table":"something_else"}"#;
        assert!(parse_execution_cache_payload(payload).is_err());
    }

    #[tokio::test]
    async fn deliver_suppresses_repeat_within_debounce_window() {
        let bus = InvalidationBus::new(DebounceConfig {
            window: Duration::from_secs(60),
        });
        let mut rx = bus.subscribe();

        bus.deliver(InvalidationEvent::GatewayConfig);
        bus.deliver(InvalidationEvent::GatewayConfig);

        let first = rx.try_recv();
        assert!(first.is_ok());
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn deliver_fires_again_after_debounce_window_elapses() {
        let bus = InvalidationBus::new(DebounceConfig {
            window: Duration::from_millis(10),
        });
        let mut rx = bus.subscribe();

        bus.deliver(InvalidationEvent::GatewayConfig);
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.deliver(InvalidationEvent::GatewayConfig);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
    }
}
