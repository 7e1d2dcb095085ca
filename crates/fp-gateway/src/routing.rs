// SPDX-License-Identifier: MIT OR Apache-2.0
//! The gateway's in-memory route index (§4.6): keyed first by host (a
//! gateway's custom domain), then by the owning project's slug as a path
//! prefix, then by longest-path-template match within that gateway's
//! routes.
//!
//! The index is rebuilt wholesale from the metadata store and swapped in
//! as one atomic [`arc_swap`]-style copy-on-replace (§5 "readers see a
//! consistent snapshot") — here modeled with a plain `RwLock<Arc<_>>`
//! since rebuilds are rare (gateway edits) and reads are the hot path.

use fp_core::{GatewayAuthMethod, GatewayConfig, GatewayRoute, RouteAuthBinding};
use fp_store::MetadataStore;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// One gateway's routes, auth methods, and per-route auth bindings, fully
/// materialized for lookup without further store round-trips.
pub struct GatewayEntry {
    /// The gateway's own configuration.
    pub config: GatewayConfig,
    /// Routes registered on this gateway.
    pub routes: Vec<GatewayRoute>,
    /// This gateway's named auth methods, by id.
    pub auth_methods: BTreeMap<Uuid, GatewayAuthMethod>,
    /// Each route's bound auth methods, in evaluation order, by route id.
    pub bindings: BTreeMap<Uuid, Vec<RouteAuthBinding>>,
}

/// A point-in-time, fully resolved view of every enabled gateway.
#[derive(Default)]
pub struct Snapshot {
    gateways: BTreeMap<Uuid, GatewayEntry>,
    /// Custom domain (lowercased, no port) → gateway id.
    by_host: BTreeMap<String, Uuid>,
    /// Project slug → gateway id, for hosts with no custom domain match.
    by_slug: BTreeMap<String, Uuid>,
}

impl Snapshot {
    fn insert(&mut self, entry: GatewayEntry, project_slug: &str) {
        if let Some(domain) = &entry.config.custom_domain {
            self.by_host.insert(normalize_host(domain), entry.config.id);
        }
        self.by_slug.insert(project_slug.to_string(), entry.config.id);
        self.gateways.insert(entry.config.id, entry);
    }

    /// Resolve `(host, path)` to a gateway and the path remaining after
    /// stripping any slug prefix that was consumed to find it (§4.6 step 1).
    fn resolve_gateway<'a>(&'a self, host: &str, path: &'a str) -> Option<(&'a GatewayEntry, &'a str)> {
        let host = normalize_host(host);
        if let Some(gateway_id) = self.by_host.get(&host) {
            return self.gateways.get(gateway_id).map(|g| (g, path));
        }

        let trimmed = path.trim_start_matches('/');
        let (slug, rest) = trimmed.split_once('/').unwrap_or((trimmed, ""));
        let gateway_id = self.by_slug.get(slug)?;
        let entry = self.gateways.get(gateway_id)?;
        let remaining: &str = &path[path.len() - rest.len()..];
        Some((entry, if remaining.is_empty() { "/" } else { remaining }))
    }

    /// Resolve a request to the route it matches, or the reason it
    /// couldn't (§6: `404` no route, `405` wrong method).
    pub fn resolve(&self, host: &str, path: &str, method: &str) -> RouteResolution<'_> {
        let Some((entry, remaining)) = self.resolve_gateway(host, path) else {
            return RouteResolution::NoGateway;
        };
        if !entry.config.enabled {
            return RouteResolution::NoGateway;
        }

        let Some((route, params)) = match_route(&entry.routes, remaining) else {
            return RouteResolution::NoRoute;
        };

        if !route.methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
            return RouteResolution::MethodNotAllowed;
        }

        RouteResolution::Matched {
            gateway: entry,
            route,
            params,
        }
    }
}

/// The outcome of resolving one request against the current snapshot.
pub enum RouteResolution<'a> {
    /// A route matched, in a gateway accepting traffic.
    Matched {
        /// The owning gateway (for its auth methods and bindings).
        gateway: &'a GatewayEntry,
        /// The matched route.
        route: &'a GatewayRoute,
        /// Captured `{param}` values, by name.
        params: BTreeMap<String, String>,
    },
    /// No gateway matched the host/slug prefix, or the matched gateway is
    /// disabled.
    NoGateway,
    /// A gateway matched but no route matched the path.
    NoRoute,
    /// A route matched the path but not the method.
    MethodNotAllowed,
}

fn normalize_host(host: &str) -> String {
    host.split(':').next().unwrap_or(host).to_ascii_lowercase()
}

/// Match `path` against `routes`, picking the route whose template has the
/// most literal (non-`{param}`) matching segments — the "longest
/// path-template prefix" rule of §4.6. Ties are broken by the
/// lexicographically smaller template for determinism; invariant 5
/// (route unambiguity) means a true tie should never occur in practice.
fn match_route<'a>(
    routes: &'a [GatewayRoute],
    path: &str,
) -> Option<(&'a GatewayRoute, BTreeMap<String, String>)> {
    let path_segments: Vec<&str> = split_segments(path);

    let mut best: Option<(&GatewayRoute, BTreeMap<String, String>, usize)> = None;
    for route in routes {
        let template_segments: Vec<&str> = split_segments(&route.path_template);
        if template_segments.len() != path_segments.len() {
            continue;
        }

        let mut params = BTreeMap::new();
        let mut specificity = 0;
        let mut matched = true;
        for (template_seg, path_seg) in template_segments.iter().zip(path_segments.iter()) {
            if let Some(name) = template_seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                params.insert(name.to_string(), path_seg.to_string());
            } else if *template_seg == *path_seg {
                specificity += 1;
            } else {
                matched = false;
                break;
            }
        }

        if !matched {
            continue;
        }

        let is_better = match &best {
            None => true,
            Some((current, _, current_specificity)) => {
                specificity > *current_specificity
                    || (specificity == *current_specificity
                        && route.path_template < current.path_template)
            }
        };
        if is_better {
            best = Some((route, params, specificity));
        }
    }

    best.map(|(route, params, _)| (route, params))
}

fn split_segments(path: &str) -> Vec<&str> {
    path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect()
}

/// Rebuild a full [`Snapshot`] from the metadata store (§4.6: populated
/// lazily, refreshed wholesale on any `gateway_invalidated` notification).
pub async fn build_snapshot(store: &MetadataStore) -> Result<Snapshot, fp_store::StoreError> {
    let mut snapshot = Snapshot::default();

    for gw in store.list_enabled_gateways().await? {
        let routes = store.get_gateway_routes(gw.config.id).await?;
        let auth_methods = store
            .get_gateway_auth_methods(gw.config.id)
            .await?
            .into_iter()
            .map(|m| (m.id, m))
            .collect();

        let mut bindings = BTreeMap::new();
        for route in &routes {
            let route_bindings = store.get_route_auth_bindings(route.id).await?;
            bindings.insert(route.id, route_bindings);
        }

        snapshot.insert(
            GatewayEntry {
                config: gw.config,
                routes,
                auth_methods,
                bindings,
            },
            &gw.project_slug,
        );
    }

    Ok(snapshot)
}

/// A reloadable handle on the current [`Snapshot`], shared across request
/// handlers and swapped wholesale by the invalidation listener.
pub struct RouteIndex {
    inner: RwLock<Arc<Snapshot>>,
}

impl RouteIndex {
    /// Build the initial snapshot from the store.
    pub async fn load(store: &MetadataStore) -> Result<Self, fp_store::StoreError> {
        let snapshot = build_snapshot(store).await?;
        Ok(Self {
            inner: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// The current snapshot, for lock-free use across a request's
    /// lifetime.
    pub async fn current(&self) -> Arc<Snapshot> {
        self.inner.read().await.clone()
    }

    /// Rebuild from the store and atomically swap in the new snapshot.
    pub async fn refresh(&self, store: &MetadataStore) -> Result<(), fp_store::StoreError> {
        let snapshot = Arc::new(build_snapshot(store).await?);
        *self.inner.write().await = snapshot;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn route(template: &str, methods: &[&str]) -> GatewayRoute {
        GatewayRoute {
            id: Uuid::new_v4(),
            gateway_id: Uuid::new_v4(),
            path_template: template.into(),
            methods: methods.iter().map(|m| m.to_string()).collect::<BTreeSet<_>>(),
            target_function_id: Uuid::new_v4(),
            path_rewrite: None,
            cors: None,
        }
    }

    #[test]
    fn exact_literal_beats_param_segment() {
        let routes = vec![route("/widgets/{id}", &["GET"]), route("/widgets/new", &["GET"])];
        let (matched, params) = match_route(&routes, "/widgets/new").unwrap();
        assert_eq!(matched.path_template, "/widgets/new");
        assert!(params.is_empty());
    }

    #[test]
    fn param_segment_captures_value() {
        let routes = vec![route("/widgets/{id}", &["GET"])];
        let (matched, params) = match_route(&routes, "/widgets/42").unwrap();
        assert_eq!(matched.path_template, "/widgets/{id}");
        assert_eq!(params.get("id"), Some(&"42".to_string()));
    }

    #[test]
    fn segment_count_mismatch_does_not_match() {
        let routes = vec![route("/widgets/{id}", &["GET"])];
        assert!(match_route(&routes, "/widgets/42/extra").is_none());
    }

    #[test]
    fn no_route_matches_unknown_path() {
        let routes = vec![route("/widgets/{id}", &["GET"])];
        assert!(match_route(&routes, "/gadgets/1").is_none());
    }
}
