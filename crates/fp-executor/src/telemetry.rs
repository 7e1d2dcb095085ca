// SPDX-License-Identifier: MIT OR Apache-2.0
//! Execution engine metrics: invocation counts, status-code breakdown, and
//! a running average duration, kept in-process for cheap `/health`-style
//! reporting without a round trip to the metadata store.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

/// Atomic invocation-level metrics shared across the engine's call sites.
pub struct ExecutionMetrics {
    total_invocations: AtomicU64,
    successful_invocations: AtomicU64,
    failed_invocations: AtomicU64,
    cumulative_duration_ms: AtomicU64,
    average_duration_ms: AtomicU64,
}

impl ExecutionMetrics {
    /// A zero-initialized collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            total_invocations: AtomicU64::new(0),
            successful_invocations: AtomicU64::new(0),
            failed_invocations: AtomicU64::new(0),
            cumulative_duration_ms: AtomicU64::new(0),
            average_duration_ms: AtomicU64::new(0),
        }
    }

    /// Record one completed invocation. `status_code < 400` counts as
    /// successful — this is the status the caller actually received,
    /// whether produced by the handler or by a pre-invocation
    /// short-circuit.
    pub fn record_invocation(&self, status_code: u16, duration_ms: u64) {
        let total = self.total_invocations.fetch_add(1, Relaxed) + 1;
        if status_code < 400 {
            self.successful_invocations.fetch_add(1, Relaxed);
        } else {
            self.failed_invocations.fetch_add(1, Relaxed);
        }
        let cumulative = self.cumulative_duration_ms.fetch_add(duration_ms, Relaxed) + duration_ms;
        self.average_duration_ms.store(cumulative / total, Relaxed);
    }

    /// A point-in-time snapshot of the current metric values.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_invocations: self.total_invocations.load(Relaxed),
            successful_invocations: self.successful_invocations.load(Relaxed),
            failed_invocations: self.failed_invocations.load(Relaxed),
            average_duration_ms: self.average_duration_ms.load(Relaxed),
        }
    }
}

impl Default for ExecutionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-atomic, serializable snapshot of [`ExecutionMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Total number of invocations recorded.
    pub total_invocations: u64,
    /// Invocations that returned a status below 400.
    pub successful_invocations: u64,
    /// Invocations that returned a status of 400 or above.
    pub failed_invocations: u64,
    /// Running average invocation duration in milliseconds.
    pub average_duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_success_and_failure_buckets() {
        let metrics = ExecutionMetrics::new();
        metrics.record_invocation(200, 10);
        metrics.record_invocation(500, 30);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_invocations, 2);
        assert_eq!(snap.successful_invocations, 1);
        assert_eq!(snap.failed_invocations, 1);
        assert_eq!(snap.average_duration_ms, 20);
    }
}
