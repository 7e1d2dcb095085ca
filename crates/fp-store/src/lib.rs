// SPDX-License-Identifier: MIT OR Apache-2.0
//! The metadata store (C1): the authoritative relational store for
//! functions, versions, projects, env vars, network policies, gateway
//! configuration, and execution logs (§3).
//!
//! Administrative mutations to network policies, env vars, and gateway
//! tables are expected to emit an `fp_invalidation`-compatible NOTIFY
//! payload inside the same transaction that mutates the row, idiomatically
//! via a database trigger (§4.3) — see [`triggers::NOTIFY_TRIGGER_SQL`] for
//! the trigger body this crate assumes is installed by the migration
//! runner (out of scope, §1).
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod gateway;
pub mod logs;
pub mod policy;
pub mod triggers;

use fp_core::{Function, FunctionEnvironmentVariable, FunctionVersion};
use sqlx::PgPool;
use sqlx::Row;
use thiserror::Error;
use uuid::Uuid;

/// Errors from metadata store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The underlying database connection or query failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<&StoreError> for fp_error::ErrorCode {
    fn from(err: &StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => fp_error::ErrorCode::NotFound,
            StoreError::Database(_) => fp_error::ErrorCode::StorageUnavailable,
        }
    }
}

/// A handle on the metadata store's connection pool.
///
/// Per §5 ("invocation-logging uses a separate pool or a dedicated writer
/// to avoid head-of-line blocking of request-path reads"), the executor
/// constructs two [`MetadataStore`]s from distinct [`PgPool`]s — one tuned
/// for low-latency reads, one for the execution-log writer — both wrapping
/// this same type.
#[derive(Clone)]
pub struct MetadataStore {
    pool: PgPool,
}

impl MetadataStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for submodules and callers that need direct
    /// access (e.g. `fp_invalidation`'s LISTEN connection).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Fetch a function by id.
    pub async fn get_function(&self, function_id: Uuid) -> Result<Function, StoreError> {
        let row = sqlx::query(
            "SELECT id, project_id, name, active, requires_api_key, api_key_hash, \
             active_version_id, retention_days, retention_count, schedule, \
             execution_count, last_executed, created_at \
             FROM functions WHERE id = $1",
        )
        .bind(function_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("function {function_id}")))?;

        Ok(function_from_row(&row))
    }

    /// Fetch a function by project + name (used by the gateway and admin
    /// surfaces to resolve a route's `target_function_id` at creation
    /// time; invocation itself always addresses by id, §4.4).
    pub async fn get_function_by_name(
        &self,
        project_id: Uuid,
        name: &str,
    ) -> Result<Function, StoreError> {
        let row = sqlx::query(
            "SELECT id, project_id, name, active, requires_api_key, api_key_hash, \
             active_version_id, retention_days, retention_count, schedule, \
             execution_count, last_executed, created_at \
             FROM functions WHERE project_id = $1 AND name = $2",
        )
        .bind(project_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("function {project_id}/{name}")))?;

        Ok(function_from_row(&row))
    }

    /// Fetch the function's currently active version, if any (§4.4 step 1).
    pub async fn get_active_version(
        &self,
        function: &Function,
    ) -> Result<Option<FunctionVersion>, StoreError> {
        let Some(version_id) = function.active_version_id else {
            return Ok(None);
        };
        let row = sqlx::query(
            "SELECT id, function_id, version, object_name, package_hash, size_bytes, \
             created_at, uploaded_by FROM function_versions WHERE id = $1",
        )
        .bind(version_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| version_from_row(&r)))
    }

    /// Fetch a function's environment variables (§4.4 step 4), invalidated
    /// by `envvars:{function_id}` (§4.3).
    pub async fn get_env_vars(
        &self,
        function_id: Uuid,
    ) -> Result<Vec<FunctionEnvironmentVariable>, StoreError> {
        let rows = sqlx::query(
            "SELECT function_id, key, value FROM function_environment_variables \
             WHERE function_id = $1 ORDER BY key",
        )
        .bind(function_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| FunctionEnvironmentVariable {
                function_id: r.get("function_id"),
                key: r.get("key"),
                value: r.get("value"),
            })
            .collect())
    }

    /// Record a successful upload as a new, immutable version and return it.
    /// Callers must already have verified `invariant 2` (monotonic,
    /// never-reused version numbers) — see `fp_core::validate`.
    pub async fn create_version(
        &self,
        function_id: Uuid,
        version: u32,
        object_name: &str,
        package_hash: &str,
        size_bytes: u64,
        uploaded_by: &str,
    ) -> Result<FunctionVersion, StoreError> {
        let row = sqlx::query(
            "INSERT INTO function_versions \
             (id, function_id, version, object_name, package_hash, size_bytes, created_at, uploaded_by) \
             VALUES ($1, $2, $3, $4, $5, $6, now(), $7) \
             RETURNING id, function_id, version, object_name, package_hash, size_bytes, created_at, uploaded_by",
        )
        .bind(Uuid::new_v4())
        .bind(function_id)
        .bind(version as i32)
        .bind(object_name)
        .bind(package_hash)
        .bind(size_bytes as i64)
        .bind(uploaded_by)
        .fetch_one(&self.pool)
        .await?;

        Ok(version_from_row(&row))
    }

    /// Switch a function's active version, rejecting a target that
    /// doesn't belong to the function (invariant 1).
    pub async fn set_active_version(
        &self,
        function_id: Uuid,
        version_id: Uuid,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE functions SET active_version_id = $2 \
             WHERE id = $1 AND EXISTS ( \
               SELECT 1 FROM function_versions WHERE id = $2 AND function_id = $1 \
             )",
        )
        .bind(function_id)
        .bind(version_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "version {version_id} does not belong to function {function_id}"
            )));
        }
        Ok(())
    }
}

fn function_from_row(row: &sqlx::postgres::PgRow) -> Function {
    use fp_core::RetentionPolicy;
    let retention_days: Option<i32> = row.get("retention_days");
    let retention_count: Option<i32> = row.get("retention_count");
    let retention = match (retention_days, retention_count) {
        (Some(days), _) => Some(RetentionPolicy::Time { days: days as u32 }),
        (None, Some(limit)) => Some(RetentionPolicy::Count {
            limit: limit as u32,
        }),
        (None, None) => None,
    };

    Function {
        id: row.get("id"),
        project_id: row.get("project_id"),
        name: row.get("name"),
        active: row.get("active"),
        requires_api_key: row.get("requires_api_key"),
        api_key_hash: row.get("api_key_hash"),
        active_version_id: row.get("active_version_id"),
        retention,
        schedule: row.get("schedule"),
        execution_count: row.get::<i64, _>("execution_count") as u64,
        last_executed: row.get("last_executed"),
        created_at: row.get("created_at"),
    }
}

fn version_from_row(row: &sqlx::postgres::PgRow) -> FunctionVersion {
    FunctionVersion {
        id: row.get("id"),
        function_id: row.get("function_id"),
        version: row.get::<i32, _>("version") as u32,
        object_name: row.get("object_name"),
        package_hash: row.get("package_hash"),
        size_bytes: row.get::<i64, _>("size_bytes") as u64,
        created_at: row.get("created_at"),
        uploaded_by: row.get("uploaded_by"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_maps_not_found() {
        let err = StoreError::NotFound("function x".into());
        assert_eq!(fp_error::ErrorCode::from(&err), fp_error::ErrorCode::NotFound);
    }

    #[test]
    fn store_error_maps_database_to_storage_unavailable() {
        let err = StoreError::Database(sqlx::Error::RowNotFound);
        assert_eq!(
            fp_error::ErrorCode::from(&err),
            fp_error::ErrorCode::StorageUnavailable
        );
    }
}
