// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! Invariant checks over the domain types (§3).
//!
//! These are pure functions over already-loaded rows; they do not touch the
//! metadata store themselves (that's `fp-store`'s job) — callers run them
//! before committing a mutation.

use crate::{Function, FunctionVersion, GatewayRoute};
use std::collections::HashMap;
use thiserror::Error;

/// A single invariant violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// `active_version_id` references a version belonging to a different
    /// function (invariant 1).
    #[error("function {function_id} active_version_id references a foreign version")]
    ActiveVersionMismatch {
        /// The function whose active version is wrong.
        function_id: uuid::Uuid,
    },
    /// `FunctionVersion.version` was reused or is not monotonically
    /// increasing for its function (invariant 2).
    #[error("function {function_id} version {version} is not monotonically increasing")]
    NonMonotonicVersion {
        /// The offending function.
        function_id: uuid::Uuid,
        /// The version number that violated monotonicity.
        version: u32,
    },
    /// Two routes within the same gateway both match some concrete
    /// `(method, path)` pair (invariant 5).
    #[error("routes {} and {} both match path template {path_template}", route_ids.0, route_ids.1)]
    AmbiguousRoutes {
        /// The conflicting route ids.
        route_ids: (uuid::Uuid, uuid::Uuid),
        /// The path template both routes share.
        path_template: String,
    },
    /// Deletion of the function's currently active version was attempted.
    #[error("function {function_id}: cannot delete the active version")]
    ActiveVersionDeletion {
        /// The function whose active version deletion was rejected.
        function_id: uuid::Uuid,
    },
}

/// Validate that `function.active_version_id`, if set, references one of
/// `versions` and that `versions` belongs to `function` (invariant 1).
pub fn validate_active_version(
    function: &Function,
    versions: &[FunctionVersion],
) -> Result<(), ValidationError> {
    let Some(active_id) = function.active_version_id else {
        return Ok(());
    };
    let found = versions
        .iter()
        .any(|v| v.id == active_id && v.function_id == function.id);
    if found {
        Ok(())
    } else {
        Err(ValidationError::ActiveVersionMismatch {
            function_id: function.id,
        })
    }
}

/// Validate that `versions` (assumed to belong to one function) never
/// reuses a version number and is strictly increasing in creation order
/// (invariant 2). `versions` must already be sorted by `created_at`.
pub fn validate_version_monotonicity(
    function_id: uuid::Uuid,
    versions: &[FunctionVersion],
) -> Result<(), ValidationError> {
    let mut last = None;
    for v in versions {
        if let Some(prev) = last {
            if v.version <= prev {
                return Err(ValidationError::NonMonotonicVersion {
                    function_id,
                    version: v.version,
                });
            }
        }
        last = Some(v.version);
    }
    Ok(())
}

/// Reject deleting a function's currently active version (lifecycle rule
/// in §3: "deletion of the active version is forbidden").
pub fn validate_version_deletable(
    function: &Function,
    version_id: uuid::Uuid,
) -> Result<(), ValidationError> {
    if function.active_version_id == Some(version_id) {
        Err(ValidationError::ActiveVersionDeletion {
            function_id: function.id,
        })
    } else {
        Ok(())
    }
}

/// Validate that no two routes within the same gateway share a path
/// template (a conservative approximation of invariant 5 — exact
/// `(method, path)` ambiguity also requires runtime matching, performed by
/// `fp-gateway`'s route index; this catches the unconditional case where
/// the templates themselves are identical and methods overlap).
pub fn validate_route_unambiguity(routes: &[GatewayRoute]) -> Result<(), ValidationError> {
    let mut by_template: HashMap<&str, &GatewayRoute> = HashMap::new();
    for route in routes {
        if let Some(existing) = by_template.get(route.path_template.as_str()) {
            if !existing.methods.is_disjoint(&route.methods) {
                return Err(ValidationError::AmbiguousRoutes {
                    route_ids: (existing.id, route.id),
                    path_template: route.path_template.clone(),
                });
            }
        }
        by_template.insert(route.path_template.as_str(), route);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GatewayRoute;
    use chrono::Utc;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn version(function_id: Uuid, version: u32) -> FunctionVersion {
        FunctionVersion {
            id: Uuid::new_v4(),
            function_id,
            version,
            object_name: format!("functions/{function_id}/h.tgz"),
            package_hash: "h".repeat(64),
            size_bytes: 10,
            created_at: Utc::now(),
            uploaded_by: "tester".into(),
        }
    }

    fn function_with_active(active_version_id: Option<Uuid>) -> Function {
        Function {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: "f".into(),
            active: true,
            requires_api_key: false,
            api_key_hash: None,
            active_version_id,
            retention: None,
            schedule: None,
            execution_count: 0,
            last_executed: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn active_version_none_is_valid() {
        let f = function_with_active(None);
        assert!(validate_active_version(&f, &[]).is_ok());
    }

    #[test]
    fn active_version_matching_is_valid() {
        let mut f = function_with_active(None);
        let v = version(f.id, 1);
        f.active_version_id = Some(v.id);
        assert!(validate_active_version(&f, &[v]).is_ok());
    }

    #[test]
    fn active_version_foreign_is_rejected() {
        let mut f = function_with_active(None);
        let foreign = version(Uuid::new_v4(), 1);
        f.active_version_id = Some(foreign.id);
        let err = validate_active_version(&f, &[foreign]).unwrap_err();
        assert!(matches!(err, ValidationError::ActiveVersionMismatch { .. }));
    }

    #[test]
    fn monotonic_versions_accepted() {
        let fid = Uuid::new_v4();
        let versions = vec![version(fid, 1), version(fid, 2), version(fid, 3)];
        assert!(validate_version_monotonicity(fid, &versions).is_ok());
    }

    #[test]
    fn reused_version_rejected() {
        let fid = Uuid::new_v4();
        let versions = vec![version(fid, 1), version(fid, 1)];
        let err = validate_version_monotonicity(fid, &versions).unwrap_err();
        assert!(matches!(err, ValidationError::NonMonotonicVersion { .. }));
    }

    #[test]
    fn active_version_deletion_rejected() {
        let mut f = function_with_active(None);
        let v = version(f.id, 1);
        f.active_version_id = Some(v.id);
        let err = validate_version_deletable(&f, v.id).unwrap_err();
        assert!(matches!(err, ValidationError::ActiveVersionDeletion { .. }));
    }

    #[test]
    fn non_active_version_deletion_allowed() {
        let f = function_with_active(None);
        assert!(validate_version_deletable(&f, Uuid::new_v4()).is_ok());
    }

    fn route(path: &str, methods: &[&str]) -> GatewayRoute {
        GatewayRoute {
            id: Uuid::new_v4(),
            gateway_id: Uuid::new_v4(),
            path_template: path.into(),
            methods: methods.iter().map(|m| m.to_string()).collect::<BTreeSet<_>>(),
            target_function_id: Uuid::new_v4(),
            path_rewrite: None,
            cors: None,
        }
    }

    #[test]
    fn distinct_templates_are_unambiguous() {
        let routes = vec![route("/a", &["GET"]), route("/b", &["GET"])];
        assert!(validate_route_unambiguity(&routes).is_ok());
    }

    #[test]
    fn same_template_disjoint_methods_is_unambiguous() {
        let routes = vec![route("/a", &["GET"]), route("/a", &["POST"])];
        assert!(validate_route_unambiguity(&routes).is_ok());
    }

    #[test]
    fn same_template_overlapping_methods_is_ambiguous() {
        let routes = vec![route("/a", &["GET"]), route("/a", &["GET", "POST"])];
        let err = validate_route_unambiguity(&routes).unwrap_err();
        assert!(matches!(err, ValidationError::AmbiguousRoutes { .. }));
    }
}
