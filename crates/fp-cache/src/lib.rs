// SPDX-License-Identifier: MIT OR Apache-2.0
//! On-disk LRU cache of unpacked function packages (§4.1).
//!
//! Maps `(functionId, packageHash)` to an extracted directory on local
//! disk. Materialization is single-flight per key: concurrent resolves for
//! the same key share one fetch-verify-extract, and a resolved directory
//! stays valid for its caller until the caller drops its
//! [`ResolvedPackage`] guard, even if a concurrent [`PackageCache::evict`]
//! decides the entry is stale.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use dashmap::DashMap;
use fp_objectstore::{ObjectStore, ObjectStoreError, object_key};
use fp_retry::{RetryConfig, retry_async};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// `(functionId, packageHash)` — the cache's addressing key (§4.1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    /// Owning function id.
    pub function_id: String,
    /// Hex SHA-256 of the package bytes.
    pub package_hash: String,
}

impl CacheKey {
    /// Construct a key.
    pub fn new(function_id: impl Into<String>, package_hash: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
            package_hash: package_hash.into(),
        }
    }

    fn relative_dir(&self) -> PathBuf {
        PathBuf::from(&self.function_id).join(&self.package_hash)
    }
}

/// Errors from [`PackageCache::resolve`] (§7 taxonomy).
#[derive(Debug, Error)]
pub enum CacheError {
    /// The object does not exist in the object store.
    #[error("package missing for {key:?}")]
    PackageMissing {
        /// The key that was requested.
        key: CacheKey,
    },
    /// The fetched bytes' SHA-256 does not equal `key.package_hash`. Fatal
    /// for that version until re-uploaded or the cache entry is purged
    /// (§7).
    #[error("hash mismatch for {key:?}: expected {expected}, got {actual}")]
    HashMismatch {
        /// The key that was requested.
        key: CacheKey,
        /// The hash recorded in metadata.
        expected: String,
        /// The hash actually computed from fetched bytes.
        actual: String,
    },
    /// The object store or local disk was unreachable after retries.
    #[error("storage unavailable resolving {key:?}: {reason}")]
    StorageUnavailable {
        /// The key that was requested.
        key: CacheKey,
        /// Underlying failure description.
        reason: String,
    },
    /// Extraction of the fetched tarball failed.
    #[error("extraction failed for {key:?}: {0}", key = .1)]
    Extraction(String, CacheKey),
}

impl From<&CacheError> for fp_error::ErrorCode {
    fn from(err: &CacheError) -> Self {
        match err {
            CacheError::PackageMissing { .. } => fp_error::ErrorCode::PackageMissing,
            CacheError::HashMismatch { .. } => fp_error::ErrorCode::HashMismatch,
            CacheError::StorageUnavailable { .. } | CacheError::Extraction(..) => {
                fp_error::ErrorCode::StorageUnavailable
            }
        }
    }
}

struct CacheEntry {
    dir: PathBuf,
    size_bytes: u64,
    created_at: Instant,
    last_resolved: Instant,
    readers: Arc<AtomicUsize>,
}

/// Configuration governing cache size, TTL, and retry behavior.
#[derive(Debug, Clone)]
pub struct PackageCacheConfig {
    /// Root directory under which per-key subdirectories are extracted.
    pub cache_dir: PathBuf,
    /// Evict entries once total resident bytes exceed this cap.
    pub max_cache_size_bytes: u64,
    /// Evict an entry once its age (since last resolve) exceeds this.
    pub ttl: Duration,
    /// Retry policy for object-store fetches (`StorageUnavailable`).
    pub retry: RetryConfig,
}

/// A caller's handle on a resolved, extracted package directory.
///
/// Holding this guard prevents [`PackageCache::evict`] from deleting the
/// underlying directory; drop it when the invocation using the package
/// completes.
pub struct ResolvedPackage {
    dir: PathBuf,
    readers: Arc<AtomicUsize>,
}

impl ResolvedPackage {
    /// The extracted package's root directory on local disk.
    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for ResolvedPackage {
    fn drop(&mut self) {
        self.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// On-disk LRU cache of extracted function packages (C4).
pub struct PackageCache {
    config: PackageCacheConfig,
    object_store: Arc<dyn ObjectStore>,
    entries: DashMap<CacheKey, CacheEntry>,
    inflight: DashMap<CacheKey, Arc<AsyncMutex<()>>>,
}

impl PackageCache {
    /// Construct a cache backed by `object_store`, rooted at
    /// `config.cache_dir`.
    pub fn new(config: PackageCacheConfig, object_store: Arc<dyn ObjectStore>) -> Self {
        Self {
            config,
            object_store,
            entries: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    /// Resolve `key` to an extracted package directory (§4.1).
    ///
    /// On a cache hit, refreshes LRU recency and returns immediately. On a
    /// miss, acquires a per-key single-flight lock, re-checks (another
    /// caller may have just finished), then fetches, verifies, and
    /// extracts.
    pub async fn resolve(&self, key: &CacheKey) -> Result<ResolvedPackage, CacheError> {
        if let Some(resolved) = self.try_hit(key) {
            return Ok(resolved);
        }

        let lock = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Re-check: another caller may have materialized this while we
        // waited for the lock.
        if let Some(resolved) = self.try_hit(key) {
            self.inflight.remove(key);
            return Ok(resolved);
        }

        let result = self.materialize(key).await;
        self.inflight.remove(key);
        result
    }

    fn try_hit(&self, key: &CacheKey) -> Option<ResolvedPackage> {
        let mut entry = self.entries.get_mut(key)?;
        entry.last_resolved = Instant::now();
        entry.readers.fetch_add(1, Ordering::AcqRel);
        Some(ResolvedPackage {
            dir: entry.dir.clone(),
            readers: entry.readers.clone(),
        })
    }

    async fn materialize(&self, key: &CacheKey) -> Result<ResolvedPackage, CacheError> {
        let fetch_key = object_key(&key.function_id, &key.package_hash);
        let expected_hash = key.package_hash.clone();

        let outcome = retry_async(
            &self.config.retry,
            || self.object_store.get(&fetch_key),
            |err: &ObjectStoreError| matches!(err, ObjectStoreError::Unavailable(_)),
        )
        .await
        .map_err(|e| match e {
            fp_retry::RetryError::Exhausted { last, .. } => match last {
                ObjectStoreError::NotFound { .. } => CacheError::PackageMissing { key: key.clone() },
                other => CacheError::StorageUnavailable {
                    key: key.clone(),
                    reason: other.to_string(),
                },
            },
        })?;

        let fetched = outcome.value;
        let actual_hash = hex_sha256(&fetched.bytes);
        if actual_hash != expected_hash {
            warn!(
                target: "fp.cache",
                function_id = %key.function_id,
                expected = %expected_hash,
                actual = %actual_hash,
                "package hash mismatch"
            );
            return Err(CacheError::HashMismatch {
                key: key.clone(),
                expected: expected_hash,
                actual: actual_hash,
            });
        }

        let canonical_dir = self.config.cache_dir.join(key.relative_dir());
        let staging_dir = self
            .config
            .cache_dir
            .join(".staging")
            .join(uuid::Uuid::new_v4().to_string());

        let extract_dir = staging_dir.clone();
        let bytes = fetched.bytes.clone();
        tokio::task::spawn_blocking(move || extract_tarball(&bytes, &extract_dir))
            .await
            .map_err(|e| CacheError::Extraction(e.to_string(), key.clone()))?
            .map_err(|e| CacheError::Extraction(e, key.clone()))?;

        if let Some(parent) = canonical_dir.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::Extraction(e.to_string(), key.clone()))?;
        }

        // Atomic rename into place: either the canonical dir fully exists
        // with complete contents, or it doesn't exist at all.
        match tokio::fs::rename(&staging_dir, &canonical_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists || canonical_dir.exists() => {
                // A concurrent materialization (different process or a
                // race we didn't single-flight against) already placed
                // it; discard our staging copy.
                let _ = tokio::fs::remove_dir_all(&staging_dir).await;
            }
            Err(e) => return Err(CacheError::Extraction(e.to_string(), key.clone())),
        }

        let size_bytes = dir_size(&canonical_dir).await.unwrap_or(0);
        let readers = Arc::new(AtomicUsize::new(1));
        self.entries.insert(
            key.clone(),
            CacheEntry {
                dir: canonical_dir.clone(),
                size_bytes,
                created_at: Instant::now(),
                last_resolved: Instant::now(),
                readers: readers.clone(),
            },
        );

        info!(target: "fp.cache", function_id = %key.function_id, "package materialized");
        Ok(ResolvedPackage {
            dir: canonical_dir,
            readers,
        })
    }

    /// Remove all cache entries for `function_id` (called on
    /// version-switch or deletion notifications, §4.1).
    pub fn invalidate(&self, function_id: &str) {
        let victims: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|e| e.key().function_id == function_id)
            .map(|e| e.key().clone())
            .collect();
        for key in victims {
            self.entries.remove(&key);
        }
        debug!(target: "fp.cache", function_id, "invalidated");
    }

    /// Evict least-recently-resolved entries exceeding `max_cache_size_bytes`
    /// or whose age exceeds `ttl`. Entries with at least one live
    /// [`ResolvedPackage`] reader are never evicted this pass; they are
    /// reconsidered on the next call.
    pub async fn evict(&self) {
        let now = Instant::now();
        let mut victims: Vec<CacheKey> = Vec::new();

        for entry in self.entries.iter() {
            if entry.readers.load(Ordering::Acquire) > 0 {
                continue;
            }
            if now.duration_since(entry.created_at) > self.config.ttl {
                victims.push(entry.key().clone());
            }
        }

        let mut total: u64 = self.entries.iter().map(|e| e.size_bytes).sum();
        if total > self.config.max_cache_size_bytes {
            let mut by_recency: Vec<(CacheKey, Instant, u64, usize)> = self
                .entries
                .iter()
                .map(|e| {
                    (
                        e.key().clone(),
                        e.last_resolved,
                        e.size_bytes,
                        e.readers.load(Ordering::Acquire),
                    )
                })
                .collect();
            by_recency.sort_by_key(|(_, last, _, _)| *last);
            for (key, _, size, readers) in by_recency {
                if total <= self.config.max_cache_size_bytes {
                    break;
                }
                if readers > 0 || victims.contains(&key) {
                    continue;
                }
                victims.push(key);
                total = total.saturating_sub(size);
            }
        }

        for key in victims {
            if let Some((_, entry)) = self.entries.remove(&key) {
                if entry.readers.load(Ordering::Acquire) > 0 {
                    // A reader showed up between selection and removal;
                    // put it back rather than deleting a directory that's
                    // still referenced.
                    self.entries.insert(key, entry);
                    continue;
                }
                let _ = tokio::fs::remove_dir_all(&entry.dir).await;
                debug!(target: "fp.cache", dir = %entry.dir.display(), "evicted");
            }
        }
    }

    /// Number of entries currently resident (test/diagnostic helper).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the cache has no resident entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn hex_sha256(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

fn extract_tarball(bytes: &[u8], dest: &Path) -> Result<(), String> {
    std::fs::create_dir_all(dest).map_err(|e| e.to_string())?;
    let decoder = flate2::read::GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(dest).map_err(|e| e.to_string())?;
    Ok(())
}

async fn dir_size(dir: &Path) -> std::io::Result<u64> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(&dir).into_iter().filter_map(Result::ok) {
            if entry.file_type().is_file() {
                total += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(total)
    })
    .await
    .unwrap_or(Ok(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fp_objectstore::{LocalDiskObjectStore, ObjectMetadata};
    use std::io::Write;

    fn make_tarball(entry_name: &str, contents: &[u8]) -> (Vec<u8>, String) {
        let mut tar_bytes = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tar_bytes);
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, entry_name, contents).unwrap();
            builder.finish().unwrap();
        }
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(&tar_bytes).unwrap();
        let gz_bytes = gz.finish().unwrap();
        let hash = hex_sha256(&gz_bytes);
        (gz_bytes, hash)
    }

    async fn setup() -> (tempfile::TempDir, tempfile::TempDir, PackageCache) {
        let store_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalDiskObjectStore::new(store_dir.path()));
        let cache = PackageCache::new(
            PackageCacheConfig {
                cache_dir: cache_dir.path().to_path_buf(),
                max_cache_size_bytes: 1024 * 1024,
                ttl: Duration::from_secs(3600),
                retry: RetryConfig {
                    max_retries: 1,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                    overall_timeout: Duration::from_secs(1),
                    jitter_factor: 0.0,
                },
            },
            store.clone(),
        );
        (store_dir, cache_dir, cache)
    }

    #[tokio::test]
    async fn resolve_fetches_verifies_and_extracts() {
        let (store_dir, _cache_dir, cache) = setup().await;
        let (bytes, hash) = make_tarball("index.js", b"module.exports = () => {}");
        let store = LocalDiskObjectStore::new(store_dir.path());
        let key = CacheKey::new("f1", &hash);
        store
            .put(
                &fp_objectstore::object_key("f1", &hash),
                bytes.into(),
                ObjectMetadata {
                    function_id: "f1".into(),
                    package_version: 1,
                    package_hash: hash.clone(),
                    upload_time: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();

        let resolved = cache.resolve(&key).await.unwrap();
        assert!(resolved.path().join("index.js").exists());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn resolve_missing_is_package_missing() {
        let (_store_dir, _cache_dir, cache) = setup().await;
        let key = CacheKey::new("f1", &"a".repeat(64));
        let err = cache.resolve(&key).await.unwrap_err();
        assert!(matches!(err, CacheError::PackageMissing { .. }));
    }

    #[tokio::test]
    async fn tampered_object_is_hash_mismatch() {
        let (store_dir, _cache_dir, cache) = setup().await;
        let (bytes, real_hash) = make_tarball("index.js", b"content");
        let store = LocalDiskObjectStore::new(store_dir.path());
        let claimed_hash = "f".repeat(64);
        store
            .put(
                &fp_objectstore::object_key("f1", &claimed_hash),
                bytes.into(),
                ObjectMetadata {
                    function_id: "f1".into(),
                    package_version: 1,
                    package_hash: claimed_hash.clone(),
                    upload_time: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();

        let key = CacheKey::new("f1", &claimed_hash);
        let err = cache.resolve(&key).await.unwrap_err();
        match err {
            CacheError::HashMismatch { expected, actual, .. } => {
                assert_eq!(expected, claimed_hash);
                assert_eq!(actual, real_hash);
            }
            other => panic!("expected HashMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_resolve_is_a_cache_hit() {
        let (store_dir, _cache_dir, cache) = setup().await;
        let (bytes, hash) = make_tarball("index.js", b"v1");
        let store = LocalDiskObjectStore::new(store_dir.path());
        store
            .put(
                &fp_objectstore::object_key("f1", &hash),
                bytes.into(),
                ObjectMetadata {
                    function_id: "f1".into(),
                    package_version: 1,
                    package_hash: hash.clone(),
                    upload_time: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();

        let key = CacheKey::new("f1", &hash);
        let r1 = cache.resolve(&key).await.unwrap();
        let path1 = r1.path().to_path_buf();
        drop(r1);
        let r2 = cache.resolve(&key).await.unwrap();
        assert_eq!(r2.path(), path1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn invalidate_removes_all_entries_for_function() {
        let (store_dir, _cache_dir, cache) = setup().await;
        let (bytes, hash) = make_tarball("index.js", b"v1");
        let store = LocalDiskObjectStore::new(store_dir.path());
        store
            .put(
                &fp_objectstore::object_key("f1", &hash),
                bytes.into(),
                ObjectMetadata {
                    function_id: "f1".into(),
                    package_version: 1,
                    package_hash: hash.clone(),
                    upload_time: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();
        let key = CacheKey::new("f1", &hash);
        cache.resolve(&key).await.unwrap();
        assert_eq!(cache.len(), 1);
        cache.invalidate("f1");
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn evict_skips_entries_with_live_readers() {
        let (store_dir, _cache_dir, cache) = setup().await;
        let (bytes, hash) = make_tarball("index.js", b"v1");
        let store = LocalDiskObjectStore::new(store_dir.path());
        store
            .put(
                &fp_objectstore::object_key("f1", &hash),
                bytes.into(),
                ObjectMetadata {
                    function_id: "f1".into(),
                    package_version: 1,
                    package_hash: hash.clone(),
                    upload_time: chrono::Utc::now(),
                },
            )
            .await
            .unwrap();
        let key = CacheKey::new("f1", &hash);
        let resolved = cache.resolve(&key).await.unwrap();

        // Force TTL expiry in the past without sleeping a real hour.
        if let Some(mut entry) = cache.entries.get_mut(&key) {
            entry.created_at = Instant::now() - Duration::from_secs(999_999);
        }
        cache.evict().await;
        assert_eq!(cache.len(), 1, "live reader must prevent eviction");
        drop(resolved);
        cache.evict().await;
        assert_eq!(cache.len(), 0);
    }
}
