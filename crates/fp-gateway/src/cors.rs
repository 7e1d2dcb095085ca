// SPDX-License-Identifier: MIT OR Apache-2.0
//! CORS handling for routes carrying a [`fp_core::CorsPolicy`] (§4.6 step 1:
//! "CORS preflight requests are answered directly from the route's CORS
//! policy").

use fp_core::CorsPolicy;

/// Build the response to an `OPTIONS` preflight request, or `None` if the
/// presented `Origin` isn't allowed (in which case the preflight falls
/// through to normal route resolution).
pub fn preflight_response(policy: &CorsPolicy, origin: Option<&str>) -> Option<(u16, Vec<(String, String)>)> {
    let origin = origin?;
    if !origin_allowed(policy, origin) {
        return None;
    }

    let mut headers = vec![
        ("access-control-allow-origin".to_string(), allow_origin_value(policy, origin)),
        ("access-control-allow-methods".to_string(), policy.allowed_methods.join(", ")),
        ("access-control-allow-headers".to_string(), policy.allowed_headers.join(", ")),
        ("vary".to_string(), "Origin".to_string()),
    ];
    if policy.allow_credentials {
        headers.push(("access-control-allow-credentials".to_string(), "true".to_string()));
    }
    if let Some(max_age) = policy.max_age_secs {
        headers.push(("access-control-max-age".to_string(), max_age.to_string()));
    }
    Some((204, headers))
}

/// Append CORS response headers to an already-proxied response.
pub fn apply_response_headers(policy: &CorsPolicy, origin: Option<&str>, headers: &mut Vec<(String, String)>) {
    let Some(origin) = origin else { return };
    if !origin_allowed(policy, origin) {
        return;
    }
    headers.push(("access-control-allow-origin".to_string(), allow_origin_value(policy, origin)));
    headers.push(("vary".to_string(), "Origin".to_string()));
    if policy.allow_credentials {
        headers.push(("access-control-allow-credentials".to_string(), "true".to_string()));
    }
}

fn origin_allowed(policy: &CorsPolicy, origin: &str) -> bool {
    policy.allowed_origins.iter().any(|o| o == "*" || o.eq_ignore_ascii_case(origin))
}

fn allow_origin_value(policy: &CorsPolicy, origin: &str) -> String {
    // A wildcard allow-list can't be echoed back verbatim once credentials
    // are in play (browsers reject `*` alongside `Allow-Credentials: true`).
    if !policy.allow_credentials && policy.allowed_origins.iter().any(|o| o == "*") {
        "*".to_string()
    } else {
        origin.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(origins: &[&str], allow_credentials: bool) -> CorsPolicy {
        CorsPolicy {
            allowed_origins: origins.iter().map(|s| s.to_string()).collect(),
            allowed_methods: vec!["GET".into(), "POST".into()],
            allowed_headers: vec!["content-type".into()],
            allow_credentials,
            max_age_secs: Some(600),
        }
    }

    #[test]
    fn preflight_rejects_disallowed_origin() {
        let policy = policy(&["https://allowed.example"], false);
        assert!(preflight_response(&policy, Some("https://evil.example")).is_none());
    }

    #[test]
    fn preflight_echoes_origin_when_credentials_allowed() {
        let policy = policy(&["*"], true);
        let (status, headers) = preflight_response(&policy, Some("https://app.example")).unwrap();
        assert_eq!(status, 204);
        assert!(headers.contains(&("access-control-allow-origin".to_string(), "https://app.example".to_string())));
    }

    #[test]
    fn preflight_uses_wildcard_without_credentials() {
        let policy = policy(&["*"], false);
        let (_, headers) = preflight_response(&policy, Some("https://app.example")).unwrap();
        assert!(headers.contains(&("access-control-allow-origin".to_string(), "*".to_string())));
    }
}
