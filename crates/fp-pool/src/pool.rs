// SPDX-License-Identifier: MIT OR Apache-2.0
//! The isolate pool (C5, §4.2): a bounded pool of warm isolate worker
//! processes, keyed per function version so a function's own handler code
//! stays resident between invocations.
//!
//! Acquiring an isolate either reuses an idle instance for the same
//! [`IsolateKey`] or spawns a fresh one, subject to a global `max_size`
//! ceiling enforced by a semaphore. A poisoned isolate (§4.2 item 4: timed
//! out, exceeded its memory budget, or hit a protocol violation) is killed
//! rather than returned to the pool; its slot is freed for a replacement.

use fp_sandbox::{IsolateClient, IsolateSpec, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Serde helper for `Duration` as milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(val: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        val.as_millis().serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms: u64 = u64::deserialize(de)?;
        Ok(Duration::from_millis(ms))
    }
}

/// Configuration for an isolate pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of warm (idle) instances [`IsolatePool::ensure_warm`] maintains
    /// per key.
    pub min_size: usize,
    /// Hard ceiling on the number of isolates (idle + busy) alive across the
    /// whole pool (§5 "hard ceiling on concurrently acquired isolates").
    pub max_size: usize,
    /// Kill idle instances that have sat unused longer than this.
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,
    /// How often callers should invoke [`IsolatePool::reap_idle`].
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 64,
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

/// Identifies the set of isolates capable of serving one function version —
/// they share the same extracted package and environment (§4.2: "a pool of
/// warm isolate instances per function version").
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IsolateKey {
    /// Owning function id.
    pub function_id: String,
    /// The active version's package hash.
    pub package_hash: String,
}

impl IsolateKey {
    /// Construct a key.
    pub fn new(function_id: impl Into<String>, package_hash: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
            package_hash: package_hash.into(),
        }
    }
}

/// Errors from pool acquisition.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No isolate became available within the caller's acquire timeout —
    /// the pool is at `max_size` and every slot is busy (`Overloaded`, §7).
    #[error("isolate pool exhausted: no slot available within the acquire timeout")]
    Overloaded,
    /// Spawning a fresh isolate failed.
    #[error("failed to spawn isolate: {0}")]
    Spawn(#[from] SandboxError),
}

impl From<&PoolError> for fp_error::ErrorCode {
    fn from(err: &PoolError) -> Self {
        match err {
            PoolError::Overloaded => fp_error::ErrorCode::Overloaded,
            PoolError::Spawn(e) => fp_error::ErrorCode::from(e),
        }
    }
}

/// Point-in-time pool occupancy, for diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolStats {
    /// Isolates currently idle across every key.
    pub idle: usize,
    /// Isolates currently checked out (acquired, not yet released).
    pub busy: usize,
    /// `max_size - (idle + busy)`, the number of fresh isolates that could
    /// still be spawned before the pool is exhausted.
    pub available_permits: usize,
}

struct IdleIsolate {
    client: IsolateClient,
    idle_since: Instant,
    permit: OwnedSemaphorePermit,
}

/// A checked-out isolate. Must be handed back to the owning
/// [`IsolatePool`] via [`IsolatePool::release`] once the invocation
/// completes; a guard dropped without release is treated as poisoned and
/// its process killed in the background, freeing its slot.
pub struct AcquiredIsolate {
    key: IsolateKey,
    client: Option<IsolateClient>,
    permit: Option<OwnedSemaphorePermit>,
}

impl AcquiredIsolate {
    /// The key this isolate serves.
    pub fn key(&self) -> &IsolateKey {
        &self.key
    }

    /// The underlying isolate client, for invocation.
    pub fn client_mut(&mut self) -> &mut IsolateClient {
        self.client.as_mut().expect("client taken before release")
    }
}

impl Drop for AcquiredIsolate {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            warn!(
                target: "fp.pool",
                function_id = %self.key.function_id,
                "isolate guard dropped without release; killing"
            );
            // `permit` drops here too, freeing the slot once the kill
            // completes; the Semaphore itself doesn't need the task alive.
            let permit = self.permit.take();
            tokio::spawn(async move {
                client.kill().await;
                drop(permit);
            });
        }
    }
}

/// Bounded pool of warm isolate worker processes, keyed per function
/// version (C5).
pub struct IsolatePool {
    config: PoolConfig,
    idle: Mutex<HashMap<IsolateKey, VecDeque<IdleIsolate>>>,
    permits: std::sync::Arc<Semaphore>,
}

impl IsolatePool {
    /// Construct an empty pool bounded by `config.max_size`.
    pub fn new(config: PoolConfig) -> Self {
        let permits = std::sync::Arc::new(Semaphore::new(config.max_size));
        Self {
            config,
            idle: Mutex::new(HashMap::new()),
            permits,
        }
    }

    /// The pool's configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Acquire an isolate for `key`, reusing a warm instance if one is
    /// idle, or spawning a fresh one per `spec` if the pool has spare
    /// capacity. Waits up to `acquire_timeout` for a slot to free up before
    /// returning [`PoolError::Overloaded`] (§7: "the pool is at capacity").
    pub async fn acquire(
        &self,
        key: IsolateKey,
        spec: IsolateSpec,
        acquire_timeout: Duration,
    ) -> Result<AcquiredIsolate, PoolError> {
        if let Some(idle) = self.pop_idle(&key) {
            debug!(target: "fp.pool", function_id = %key.function_id, "reused warm isolate");
            return Ok(AcquiredIsolate {
                key,
                client: Some(idle.client),
                permit: Some(idle.permit),
            });
        }

        let permit = match tokio::time::timeout(acquire_timeout, self.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(PoolError::Overloaded),
            Err(_elapsed) => return Err(PoolError::Overloaded),
        };

        match IsolateClient::spawn(spec).await {
            Ok(client) => {
                debug!(target: "fp.pool", function_id = %key.function_id, "spawned fresh isolate");
                Ok(AcquiredIsolate {
                    key,
                    client: Some(client),
                    permit: Some(permit),
                })
            }
            Err(err) => {
                // permit drops here, freeing the slot for the next attempt.
                Err(PoolError::Spawn(err))
            }
        }
    }

    /// Return a checked-out isolate to the pool. A poisoned isolate (§4.2
    /// item 4) is killed instead of recycled; its slot is freed once the
    /// kill completes.
    pub async fn release(&self, mut acquired: AcquiredIsolate) {
        let client = acquired.client.take().expect("client already released");
        let permit = acquired.permit.take().expect("permit already released");

        if client.is_poisoned() {
            debug!(target: "fp.pool", function_id = %acquired.key.function_id, "discarding poisoned isolate");
            client.kill().await;
            drop(permit);
            return;
        }

        let mut idle = self.idle.lock().expect("pool lock poisoned");
        idle.entry(acquired.key.clone()).or_default().push_back(IdleIsolate {
            client,
            idle_since: Instant::now(),
            permit,
        });
    }

    fn pop_idle(&self, key: &IsolateKey) -> Option<IdleIsolate> {
        let mut idle = self.idle.lock().expect("pool lock poisoned");
        let queue = idle.get_mut(key)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            idle.remove(key);
        }
        entry
    }

    /// Ensure at least `config.min_size` warm instances exist for `key`,
    /// spawning more via `spec` as needed. Used after a function's active
    /// version changes, to keep its handler resident ahead of the first
    /// request (§4.2).
    pub async fn ensure_warm(&self, key: IsolateKey, spec: impl Fn() -> IsolateSpec) {
        let current = {
            let idle = self.idle.lock().expect("pool lock poisoned");
            idle.get(&key).map(|q| q.len()).unwrap_or(0)
        };
        let deficit = self.config.min_size.saturating_sub(current);
        for _ in 0..deficit {
            let permit = match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break, // pool is at capacity; stop warming.
            };
            match IsolateClient::spawn(spec()).await {
                Ok(client) => {
                    let mut idle = self.idle.lock().expect("pool lock poisoned");
                    idle.entry(key.clone()).or_default().push_back(IdleIsolate {
                        client,
                        idle_since: Instant::now(),
                        permit,
                    });
                }
                Err(err) => {
                    warn!(target: "fp.pool", function_id = %key.function_id, error = %err, "failed to warm isolate");
                    break;
                }
            }
        }
    }

    /// Kill and discard idle isolates that have sat unused longer than
    /// `config.idle_timeout`. Intended to be called on a timer
    /// (`config.health_check_interval`) by the daemon.
    pub async fn reap_idle(&self) {
        let expired: Vec<(IsolateKey, IdleIsolate)> = {
            let mut idle = self.idle.lock().expect("pool lock poisoned");
            let now = Instant::now();
            let mut expired = Vec::new();
            for (key, queue) in idle.iter_mut() {
                let mut i = 0;
                while i < queue.len() {
                    if now.duration_since(queue[i].idle_since) > self.config.idle_timeout {
                        expired.push((key.clone(), queue.remove(i).unwrap()));
                    } else {
                        i += 1;
                    }
                }
            }
            idle.retain(|_, q| !q.is_empty());
            expired
        };

        for (key, entry) in expired {
            debug!(target: "fp.pool", function_id = %key.function_id, "reaping idle isolate past idle_timeout");
            entry.client.kill().await;
            drop(entry.permit);
        }
    }

    /// Remove (and kill) every warm instance for `key`, e.g. after a
    /// function's active version changes and its old isolates must not be
    /// reused for the new code (§4.3 invalidation).
    pub async fn evict_key(&self, key: &IsolateKey) {
        let victims: Vec<IdleIsolate> = {
            let mut idle = self.idle.lock().expect("pool lock poisoned");
            idle.remove(key).map(Vec::from).unwrap_or_default()
        };
        for entry in victims {
            entry.client.kill().await;
            drop(entry.permit);
        }
    }

    /// Current occupancy snapshot.
    pub fn stats(&self) -> PoolStats {
        let idle_count: usize = {
            let idle = self.idle.lock().expect("pool lock poisoned");
            idle.values().map(|q| q.len()).sum()
        };
        let available = self.permits.available_permits();
        let total_used = self.config.max_size.saturating_sub(available);
        PoolStats {
            idle: idle_count,
            busy: total_used.saturating_sub(idle_count),
            available_permits: available,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn echo_spec() -> IsolateSpec {
        // `cat` faithfully echoes whatever's written to its stdin back to
        // stdout, which is enough to exercise spawn/acquire/release
        // bookkeeping without a real isolate worker understanding the
        // JSONL protocol (the handshake itself will fail, which is fine —
        // these tests only exercise pool slot accounting around a
        // spawn failure).
        IsolateSpec {
            command: "false".into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn acquire_failure_frees_the_permit() {
        let pool = IsolatePool::new(PoolConfig {
            min_size: 0,
            max_size: 1,
            idle_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(60),
        });

        let key = IsolateKey::new("f1", "h1");
        let first = pool
            .acquire(key.clone(), echo_spec(), Duration::from_millis(100))
            .await;
        assert!(matches!(first, Err(PoolError::Spawn(_))));

        // The failed spawn must not have leaked the permit.
        let stats = pool.stats();
        assert_eq!(stats.available_permits, 1);
    }

    #[tokio::test]
    async fn overloaded_when_no_permit_available_within_timeout() {
        let pool = IsolatePool::new(PoolConfig {
            min_size: 0,
            max_size: 1,
            idle_timeout: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(60),
        });

        // Hold the only permit open without releasing it.
        let _permit = pool.permits.clone().try_acquire_owned().unwrap();

        let key = IsolateKey::new("f1", "h1");
        let err = pool
            .acquire(key, echo_spec(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Overloaded));
    }

    #[test]
    fn error_code_mapping() {
        assert_eq!(
            fp_error::ErrorCode::from(&PoolError::Overloaded),
            fp_error::ErrorCode::Overloaded
        );
    }
}
