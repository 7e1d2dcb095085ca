// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-addressed object storage for function packages (C2).
//!
//! Objects live at `functions/{functionId}/{packageHash}.tgz` in a single
//! bucket, carrying `Function-ID`, `Package-Version`, `Package-Hash`, and
//! `Upload-Time` metadata headers (§6 "Package storage layout"). This crate
//! defines the [`ObjectStore`] trait the package cache (`fp-cache`) fetches
//! through, an [`S3ObjectStore`] production backend, and a
//! [`LocalDiskObjectStore`] backend used in tests and local development.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors surfaced by an [`ObjectStore`] implementation.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    /// The requested object key does not exist (`PackageMissing`, §7).
    #[error("object not found: {key}")]
    NotFound {
        /// The key that was requested.
        key: String,
    },
    /// The backing store is unreachable or returned an unexpected error
    /// (`StorageUnavailable`, §7). Eligible for retry with jittered backoff.
    #[error("object store unavailable: {0}")]
    Unavailable(String),
    /// A local filesystem error occurred (disk backend only).
    #[error("object store io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<&ObjectStoreError> for fp_error::ErrorCode {
    fn from(err: &ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NotFound { .. } => fp_error::ErrorCode::PackageMissing,
            ObjectStoreError::Unavailable(_) | ObjectStoreError::Io(_) => {
                fp_error::ErrorCode::StorageUnavailable
            }
        }
    }
}

/// Metadata attached to a stored package object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    /// Owning function id.
    pub function_id: String,
    /// The user-facing monotonic version number.
    pub package_version: u32,
    /// Hex-encoded SHA-256 of the object's bytes.
    pub package_hash: String,
    /// ISO-8601 upload timestamp.
    pub upload_time: DateTime<Utc>,
}

impl ObjectMetadata {
    fn into_headers(self) -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("function-id".into(), self.function_id);
        m.insert("package-version".into(), self.package_version.to_string());
        m.insert("package-hash".into(), self.package_hash);
        m.insert("upload-time".into(), self.upload_time.to_rfc3339());
        m
    }

    fn from_headers(headers: &BTreeMap<String, String>) -> Option<Self> {
        Some(Self {
            function_id: headers.get("function-id")?.clone(),
            package_version: headers.get("package-version")?.parse().ok()?,
            package_hash: headers.get("package-hash")?.clone(),
            upload_time: DateTime::parse_from_rfc3339(headers.get("upload-time")?)
                .ok()?
                .with_timezone(&Utc),
        })
    }
}

/// The canonical object key for a function's package at a given hash
/// (§9 Design Notes #3: the hash, not the integer version, is the key
/// component).
pub fn object_key(function_id: &str, package_hash: &str) -> String {
    format!("functions/{function_id}/{package_hash}.tgz")
}

/// A fetched object: its bytes plus the metadata headers recorded at
/// upload time.
#[derive(Debug, Clone)]
pub struct FetchedObject {
    /// Object bytes (the gzip-compressed tar).
    pub bytes: Bytes,
    /// Metadata headers, if present and well-formed.
    pub metadata: Option<ObjectMetadata>,
}

/// Content-addressed blob storage backing function packages.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object's full bytes and metadata.
    async fn get(&self, key: &str) -> Result<FetchedObject, ObjectStoreError>;

    /// Store an object's bytes with metadata headers, overwriting any
    /// existing object at the same key (uploads are otherwise immutable —
    /// the key already encodes the content hash).
    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        metadata: ObjectMetadata,
    ) -> Result<(), ObjectStoreError>;

    /// Returns `true` if an object exists at `key` without fetching its body.
    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;
}

/// Production backend storing objects in a single S3 (or S3-compatible)
/// bucket.
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Build a store from an already-configured S3 client and bucket name.
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Build a store using the ambient AWS configuration (environment,
    /// shared config file, or instance profile).
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(S3Client::new(&config), bucket)
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get(&self, key: &str) -> Result<FetchedObject, ObjectStoreError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match e.as_service_error() {
                Some(se) if se.is_no_such_key() => ObjectStoreError::NotFound { key: key.into() },
                _ => ObjectStoreError::Unavailable(e.to_string()),
            })?;

        let headers: BTreeMap<String, String> = output
            .metadata()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .collect();
        let metadata = ObjectMetadata::from_headers(&headers);

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Unavailable(e.to_string()))?;

        Ok(FetchedObject {
            bytes: body.into_bytes(),
            metadata,
        })
    }

    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        metadata: ObjectMetadata,
    ) -> Result<(), ObjectStoreError> {
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes));
        for (k, v) in metadata.into_headers() {
            req = req.metadata(k, v);
        }
        req.send()
            .await
            .map_err(|e| ObjectStoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match e.as_service_error() {
                Some(se) if se.is_not_found() => Ok(false),
                _ => Err(ObjectStoreError::Unavailable(e.to_string())),
            },
        }
    }
}

/// A local-disk backend used in tests and local development. Mirrors the
/// key layout of [`S3ObjectStore`] underneath a root directory, storing
/// metadata headers alongside each object as a `.meta` sidecar file.
pub struct LocalDiskObjectStore {
    root: PathBuf,
}

impl LocalDiskObjectStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.meta"))
    }
}

#[async_trait]
impl ObjectStore for LocalDiskObjectStore {
    async fn get(&self, key: &str) -> Result<FetchedObject, ObjectStoreError> {
        let path = self.object_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => Bytes::from(b),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ObjectStoreError::NotFound { key: key.into() });
            }
            Err(e) => return Err(ObjectStoreError::Io(e)),
        };

        let metadata = match tokio::fs::read_to_string(self.meta_path(key)).await {
            Ok(s) => {
                let headers: BTreeMap<String, String> =
                    s.lines().filter_map(parse_meta_line).collect();
                ObjectMetadata::from_headers(&headers)
            }
            Err(_) => None,
        };

        Ok(FetchedObject { bytes, metadata })
    }

    async fn put(
        &self,
        key: &str,
        bytes: Bytes,
        metadata: ObjectMetadata,
    ) -> Result<(), ObjectStoreError> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;

        let headers = metadata.into_headers();
        let meta_body: String = headers
            .into_iter()
            .map(|(k, v)| format!("{k}={v}\n"))
            .collect();
        tokio::fs::write(self.meta_path(key), meta_body).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        Ok(tokio::fs::try_exists(self.object_path(key)).await?)
    }
}

fn parse_meta_line(line: &str) -> Option<(String, String)> {
    let (k, v) = line.split_once('=')?;
    Some((k.to_string(), v.to_string()))
}

/// Returns `true` if the path is a sensible root for [`LocalDiskObjectStore`]
/// (exists and is a directory, or can be created).
pub fn is_usable_root(path: &Path) -> bool {
    path.is_dir() || !path.exists()
}
