//! Network policy rule queries (§4.5 backing store).
//!
//! The evaluator in `fp-policy` is handed an already-ordered rule set; this
//! module is responsible for producing that order. Global rules
//! (`project_id IS NULL`) apply to every project and are merged in after a
//! project's own rules, both passes sorted ascending by `priority` with a
//! stable tie-break on `id` so identical priorities always evaluate in the
//! same order (§4.5 "first matching rule, by ascending priority, wins").

use crate::{MetadataStore, StoreError};
use fp_core::{NetworkPolicyRule, PolicyAction, TargetType};
use sqlx::Row;
use uuid::Uuid;

impl MetadataStore {
    /// Fetch the rules that apply to a project: its own rules plus the
    /// global rules, in evaluation order.
    pub async fn get_network_policies(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<NetworkPolicyRule>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, project_id, action, target_type, target_value, priority, description \
             FROM network_policy_rules \
             WHERE project_id = $1 OR project_id IS NULL \
             ORDER BY (project_id IS NULL), priority ASC, id ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(rule_from_row).collect())
    }

    /// Fetch only a project's own rules, ascending by priority. Split out
    /// from [`Self::get_network_policies`] so callers that cache project
    /// and global rules under separately-invalidated keys (`fp-executor`'s
    /// `ExecutorCache`, §4.3) don't have to re-fetch global rules on every
    /// project-scoped invalidation.
    pub async fn get_project_network_policies(
        &self,
        project_id: Uuid,
    ) -> Result<Vec<NetworkPolicyRule>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, project_id, action, target_type, target_value, priority, description \
             FROM network_policy_rules \
             WHERE project_id = $1 \
             ORDER BY priority ASC, id ASC",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(rule_from_row).collect())
    }

    /// Fetch only the global (`project_id IS NULL`) rules, ascending by
    /// priority.
    pub async fn get_global_network_policies(&self) -> Result<Vec<NetworkPolicyRule>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, project_id, action, target_type, target_value, priority, description \
             FROM network_policy_rules \
             WHERE project_id IS NULL \
             ORDER BY priority ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(rule_from_row).collect())
    }
}

/// Merge a project's own rules with the global rules in the same order
/// [`MetadataStore::get_network_policies`] would: project-specific rules
/// first, then global rules (§4.5 "first matching rule, by ascending
/// priority, wins" — project rules take precedence at equal priority).
pub fn merge_policies(
    project: &[NetworkPolicyRule],
    global: &[NetworkPolicyRule],
) -> Vec<NetworkPolicyRule> {
    project.iter().cloned().chain(global.iter().cloned()).collect()
}

fn rule_from_row(row: &sqlx::postgres::PgRow) -> NetworkPolicyRule {
    let action: String = row.get("action");
    let target_type: String = row.get("target_type");

    NetworkPolicyRule {
        id: row.get("id"),
        project_id: row.get("project_id"),
        action: match action.as_str() {
            "allow" => PolicyAction::Allow,
            _ => PolicyAction::Deny,
        },
        target_type: match target_type.as_str() {
            "ip" => TargetType::Ip,
            "cidr" => TargetType::Cidr,
            _ => TargetType::Domain,
        },
        target_value: row.get("target_value"),
        priority: row.get("priority"),
        description: row.get("description"),
    }
}

#[cfg(test)]
mod tests {
    // Query ordering here is exercised by `fp-policy`'s evaluator tests
    // against fixture-built `Vec<NetworkPolicyRule>`, since ordering is
    // owned by the `ORDER BY` clause above and not independently testable
    // without a live database (see `fp-policy::tests` for the evaluation
    // semantics this ordering feeds).
}
