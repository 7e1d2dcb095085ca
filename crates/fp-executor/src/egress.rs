// SPDX-License-Identifier: MIT OR Apache-2.0
//! Network egress guard (§4.4 "Network egress guard", §4.5, §8 testable
//! property 1). Any outbound connection a handler attempts is checked
//! against the merged (project + global) policy rule set before dial.
//!
//! Hostname resolution happens exactly once per checked connection and the
//! resulting IP is what's evaluated against `ip`/`cidr` rules — resolving
//! again at connect time would open a TOCTOU window where the checked and
//! dialed addresses differ (§4.5 "MUST use the same resolution result").

use fp_core::{NetworkPolicyRule, PolicyAction};
use fp_policy::{evaluate, EgressTarget, PolicyDecision};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::net::lookup_host;

/// The egress guard denied a connection, or DNS resolution failed.
#[derive(Debug, Error)]
pub enum EgressError {
    /// The merged policy set denied the destination (§4.5: default-deny,
    /// or an explicit `deny` rule matched).
    #[error("egress denied to {host}")]
    Denied {
        /// The hostname or IP the handler attempted to reach.
        host: String,
    },
    /// The hostname did not resolve.
    #[error("dns resolution failed for {host}: {source}")]
    Resolution {
        /// The hostname that failed to resolve.
        host: String,
        #[source]
        source: std::io::Error,
    },
}

/// Evaluate a handler's outbound connection attempt to `host:port` against
/// `rules` (already merged project+global, ascending priority per §4.5).
/// Resolves `host` at most once and evaluates the resolved IP alongside
/// the hostname so both `domain` and `ip`/`cidr` rules can match.
pub async fn check_egress(
    rules: &[NetworkPolicyRule],
    host: &str,
    port: u16,
) -> Result<(), EgressError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        let decision = evaluate(rules, &EgressTarget::Ip(ip));
        return decision_to_result(decision, host);
    }

    let resolved: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|source| EgressError::Resolution {
            host: host.to_string(),
            source,
        })?
        .collect();

    let Some(addr) = resolved.into_iter().next() else {
        return Err(EgressError::Resolution {
            host: host.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses returned"),
        });
    };

    let target = EgressTarget::DomainWithResolvedIp {
        domain: host.to_string(),
        ip: addr.ip(),
    };
    decision_to_result(evaluate(rules, &target), host)
}

fn decision_to_result(decision: PolicyDecision, host: &str) -> Result<(), EgressError> {
    match decision.action {
        PolicyAction::Allow => Ok(()),
        PolicyAction::Deny => Err(EgressError::Denied { host: host.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_policy_denies_by_default() {
        let err = check_egress(&[], "203.0.113.5", 443).await.unwrap_err();
        assert!(matches!(err, EgressError::Denied { .. }));
    }
}
