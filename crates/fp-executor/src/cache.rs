// SPDX-License-Identifier: MIT OR Apache-2.0
//! In-memory read caches for the pre-invocation pipeline (§4.4 steps 1, 4,
//! 5), invalidated by [`fp_invalidation::InvalidationEvent`]s delivered
//! over a broadcast channel (§4.3). Reads are copy-on-replace: a miss
//! re-fetches from the metadata store and inserts the fresh value; an
//! invalidation simply removes the entry so the next reader refetches
//! (§5 "readers see a consistent snapshot").

use dashmap::DashMap;
use fp_core::{Function, FunctionEnvironmentVariable, NetworkPolicyRule};
use fp_invalidation::InvalidationEvent;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Function metadata plus its resolved active version's package hash —
/// the two pieces of state the pre-invocation pipeline needs from C1
/// before it can touch the package cache.
#[derive(Clone, Debug)]
pub struct CachedFunction {
    /// The function row.
    pub function: Function,
    /// The active version's package hash, if one is set.
    pub package_hash: Option<String>,
}

/// Caches backing the execution engine's pre-invocation pipeline.
pub struct ExecutorCache {
    functions: DashMap<Uuid, Arc<CachedFunction>>,
    env_vars: DashMap<Uuid, Arc<Vec<FunctionEnvironmentVariable>>>,
    project_policies: DashMap<Uuid, Arc<Vec<NetworkPolicyRule>>>,
    global_policies: RwLock<Option<Arc<Vec<NetworkPolicyRule>>>>,
}

impl ExecutorCache {
    /// An empty cache; every key is a miss until first populated.
    pub fn new() -> Self {
        Self {
            functions: DashMap::new(),
            env_vars: DashMap::new(),
            project_policies: DashMap::new(),
            global_policies: RwLock::new(None),
        }
    }

    /// Look up a cached function, if present.
    pub fn get_function(&self, function_id: Uuid) -> Option<Arc<CachedFunction>> {
        self.functions.get(&function_id).map(|e| e.clone())
    }

    /// Populate the function cache entry.
    pub fn put_function(&self, function_id: Uuid, value: Arc<CachedFunction>) {
        self.functions.insert(function_id, value);
    }

    /// Look up cached env vars, if present.
    pub fn get_env_vars(&self, function_id: Uuid) -> Option<Arc<Vec<FunctionEnvironmentVariable>>> {
        self.env_vars.get(&function_id).map(|e| e.clone())
    }

    /// Populate the env var cache entry.
    pub fn put_env_vars(&self, function_id: Uuid, value: Arc<Vec<FunctionEnvironmentVariable>>) {
        self.env_vars.insert(function_id, value);
    }

    /// Look up a project's cached policy rules, if present.
    pub fn get_project_policies(&self, project_id: Uuid) -> Option<Arc<Vec<NetworkPolicyRule>>> {
        self.project_policies.get(&project_id).map(|e| e.clone())
    }

    /// Populate a project's policy cache entry.
    pub fn put_project_policies(&self, project_id: Uuid, value: Arc<Vec<NetworkPolicyRule>>) {
        self.project_policies.insert(project_id, value);
    }

    /// Invalidate everything derived from function metadata, env vars, and
    /// project policy queries, as on a full reconnect refresh
    /// ([`InvalidationEvent::FullRefresh`]).
    pub fn clear_all(&self) {
        self.functions.clear();
        self.env_vars.clear();
        self.project_policies.clear();
        *self.global_policies.write().expect("cache lock poisoned") = None;
    }

    fn invalidate_function(&self, function_id: Uuid) {
        self.functions.remove(&function_id);
        self.env_vars.remove(&function_id);
    }

    fn invalidate_project_policies(&self, project_id: Uuid) {
        self.project_policies.remove(&project_id);
    }

    fn invalidate_global_policies(&self) {
        *self.global_policies.write().expect("cache lock poisoned") = None;
    }

    /// Apply one delivered invalidation event (§4.3's debounce already
    /// happened upstream in [`fp_invalidation::InvalidationBus`] — this is
    /// the idempotent consumer side).
    pub fn apply(&self, event: &InvalidationEvent) {
        match event {
            InvalidationEvent::FunctionEnvironmentVariables { function_id } => {
                self.invalidate_function(*function_id)
            }
            InvalidationEvent::NetworkPolicyRules { project_id } => {
                self.invalidate_project_policies(*project_id)
            }
            InvalidationEvent::GlobalNetworkPolicyRules => self.invalidate_global_policies(),
            InvalidationEvent::GatewayConfig => {
                // Gateway route-index state; not this engine's concern.
            }
            InvalidationEvent::FullRefresh => self.clear_all(),
        }
    }
}

impl Default for ExecutorCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain invalidation events from `rx` and apply them to `cache` until the
/// sender side is dropped. Intended to run as a long-lived background
/// task spawned once per executor replica.
pub async fn run_invalidation_listener(
    cache: Arc<ExecutorCache>,
    mut rx: broadcast::Receiver<InvalidationEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                debug!(target: "fp.executor", ?event, "applying invalidation");
                cache.apply(&event);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // We missed events; the safe conservative move is a full
                // refresh rather than guessing which keys were affected.
                debug!(target: "fp.executor", skipped, "invalidation receiver lagged, clearing cache");
                cache.clear_all();
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Read-through accessor for the global policy slot — not a `DashMap`
/// entry because there is exactly one.
pub fn get_global_policies(cache: &ExecutorCache) -> Option<Arc<Vec<NetworkPolicyRule>>> {
    cache
        .global_policies
        .read()
        .expect("cache lock poisoned")
        .clone()
}

/// Populate the global policy slot.
pub fn put_global_policies(cache: &ExecutorCache, value: Arc<Vec<NetworkPolicyRule>>) {
    *cache.global_policies.write().expect("cache lock poisoned") = Some(value);
}
