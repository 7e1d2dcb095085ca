//! Execution logging (§4.4 post-invocation) and execution-log retention
//! (§3 "ExecutionLogs accumulate and are pruned by a retention policy
//! (time-based or count-based; per-function override of a global
//! default)", §8 testable property #8: "after a retention sweep with
//! policy time=D, no log older than D remains; with count=N, at most N
//! logs per function remain").

use crate::{MetadataStore, StoreError};
use chrono::{DateTime, Utc};
use fp_core::{ExecutionLog, RetentionPolicy};
use sqlx::Row;
use uuid::Uuid;

/// The fields of an execution log row not yet known at record time (`id`
/// and `timestamp` are assigned by the store).
pub struct ExecutionLogEntry {
    /// The function invoked.
    pub function_id: Uuid,
    /// HTTP status code returned to the caller.
    pub status_code: u16,
    /// Wall-clock duration of the invocation, milliseconds.
    pub execution_time_ms: u32,
    /// Size of the inbound request body.
    pub request_bytes: u64,
    /// Size of the outbound response body.
    pub response_bytes: u64,
    /// Error code, if the invocation failed (§7).
    pub error: Option<String>,
    /// Caller's IP, as seen by the gateway.
    pub client_ip: Option<String>,
    /// Caller's `User-Agent` header.
    pub user_agent: Option<String>,
}

impl MetadataStore {
    /// Write an execution log row and atomically bump the function's
    /// `execution_count`/`last_executed` in the same transaction (§4.4:
    /// "An execution log is written...execution_count is incremented and
    /// last_executed is set atomically with the log insert").
    pub async fn insert_execution_log(&self, entry: ExecutionLogEntry) -> Result<ExecutionLog, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "INSERT INTO execution_logs \
             (id, function_id, status_code, execution_time_ms, request_bytes, response_bytes, \
              error, client_ip, user_agent, timestamp) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now()) \
             RETURNING id, function_id, status_code, execution_time_ms, request_bytes, \
                       response_bytes, error, client_ip, user_agent, timestamp",
        )
        .bind(Uuid::new_v4())
        .bind(entry.function_id)
        .bind(entry.status_code as i32)
        .bind(entry.execution_time_ms as i32)
        .bind(entry.request_bytes as i64)
        .bind(entry.response_bytes as i64)
        .bind(entry.error)
        .bind(entry.client_ip)
        .bind(entry.user_agent)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE functions SET execution_count = execution_count + 1, last_executed = now() \
             WHERE id = $1",
        )
        .bind(entry.function_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ExecutionLog {
            id: row.get("id"),
            function_id: row.get("function_id"),
            status_code: row.get::<i32, _>("status_code") as u16,
            execution_time_ms: row.get::<i32, _>("execution_time_ms") as u64,
            request_bytes: row.get::<i64, _>("request_bytes") as u64,
            response_bytes: row.get::<i64, _>("response_bytes") as u64,
            error: row.get("error"),
            client_ip: row.get("client_ip"),
            user_agent: row.get("user_agent"),
            timestamp: row.get("timestamp"),
        })
    }

    /// Prune a function's execution logs per its retention policy (§3,
    /// §4.4 "Retention sweep"): [`RetentionPolicy::Time`] deletes rows
    /// older than `days`; [`RetentionPolicy::Count`] keeps only the
    /// `limit` most recent rows for that function. Returns the ids of the
    /// rows that were deleted.
    pub async fn prune_execution_logs(
        &self,
        function_id: Uuid,
        policy: &RetentionPolicy,
    ) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, timestamp FROM execution_logs \
             WHERE function_id = $1 ORDER BY timestamp DESC",
        )
        .bind(function_id)
        .fetch_all(&self.pool)
        .await?;

        let logs: Vec<(Uuid, DateTime<Utc>)> = rows
            .iter()
            .map(|r| (r.get("id"), r.get("timestamp")))
            .collect();

        let victims = logs_to_prune(&logs, policy, Utc::now());
        if victims.is_empty() {
            return Ok(victims);
        }

        sqlx::query("DELETE FROM execution_logs WHERE id = ANY($1)")
            .bind(&victims)
            .execute(&self.pool)
            .await?;

        Ok(victims)
    }

    /// Every active function's id and effective retention policy, falling
    /// back to `default_policy` for functions with no per-function
    /// override (§3: "per-function override of a global default").
    /// Used by the daemon's periodic retention sweep.
    pub async fn functions_for_retention_sweep(
        &self,
        default_policy: &RetentionPolicy,
    ) -> Result<Vec<(Uuid, RetentionPolicy)>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, retention_days, retention_count FROM functions WHERE active",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let retention_days: Option<i32> = row.get("retention_days");
                let retention_count: Option<i32> = row.get("retention_count");
                let policy = match (retention_days, retention_count) {
                    (Some(days), _) => RetentionPolicy::Time { days: days as u32 },
                    (None, Some(limit)) => RetentionPolicy::Count {
                        limit: limit as u32,
                    },
                    (None, None) => default_policy.clone(),
                };
                (row.get("id"), policy)
            })
            .collect())
    }

    /// Run one retention sweep across every active function, pruning
    /// execution logs per each function's effective policy (its own
    /// override, or `default_policy`). Returns the total rows deleted.
    pub async fn sweep_execution_log_retention(
        &self,
        default_policy: &RetentionPolicy,
    ) -> Result<u64, StoreError> {
        let mut total = 0u64;
        for (function_id, policy) in self.functions_for_retention_sweep(default_policy).await? {
            total += self.prune_execution_logs(function_id, &policy).await?.len() as u64;
        }
        Ok(total)
    }
}

/// Pure retention calculation, shared by [`MetadataStore::prune_execution_logs`]
/// above and the unit tests below: [`RetentionPolicy::Time`] drops
/// anything older than `days`, and [`RetentionPolicy::Count`] keeps only
/// the `limit` most recent.
fn logs_to_prune(
    logs_by_recency_desc: &[(Uuid, DateTime<Utc>)],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<Uuid> {
    match policy {
        RetentionPolicy::Time { days } => {
            let cutoff = now - chrono::Duration::days(*days as i64);
            logs_by_recency_desc
                .iter()
                .filter(|(_, timestamp)| *timestamp < cutoff)
                .map(|(id, _)| *id)
                .collect()
        }
        RetentionPolicy::Count { limit } => logs_by_recency_desc
            .iter()
            .skip(*limit as usize)
            .map(|(id, _)| *id)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn v(id: Uuid, age_days: i64, now: DateTime<Utc>) -> (Uuid, DateTime<Utc>) {
        (id, now - Duration::days(age_days))
    }

    #[test]
    fn time_policy_prunes_only_logs_older_than_cutoff() {
        let now = Utc::now();
        let keep = Uuid::new_v4();
        let old = Uuid::new_v4();
        let logs = vec![v(keep, 1, now), v(old, 40, now)];

        let pruned = logs_to_prune(&logs, &RetentionPolicy::Time { days: 30 }, now);
        assert_eq!(pruned, vec![old]);
    }

    #[test]
    fn time_policy_keeps_logs_exactly_at_the_window_boundary() {
        // testable property #8: "no log older than D remains" — a log
        // exactly D days old is not yet older than D and must survive.
        let now = Utc::now();
        let boundary = Uuid::new_v4();
        let logs = vec![v(boundary, 30, now)];

        let pruned = logs_to_prune(&logs, &RetentionPolicy::Time { days: 30 }, now);
        assert!(pruned.is_empty());
    }

    #[test]
    fn count_policy_keeps_only_the_n_most_recent() {
        let now = Utc::now();
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let logs: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| v(*id, i as i64, now))
            .collect();

        let pruned = logs_to_prune(&logs, &RetentionPolicy::Count { limit: 2 }, now);
        assert_eq!(pruned, ids[2..]);
    }

    #[test]
    fn count_policy_under_the_limit_prunes_nothing() {
        let now = Utc::now();
        let ids: Vec<Uuid> = (0..2).map(|_| Uuid::new_v4()).collect();
        let logs: Vec<_> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| v(*id, i as i64, now))
            .collect();

        let pruned = logs_to_prune(&logs, &RetentionPolicy::Count { limit: 5 }, now);
        assert!(pruned.is_empty());
    }
}
