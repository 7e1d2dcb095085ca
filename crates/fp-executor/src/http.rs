// SPDX-License-Identifier: MIT OR Apache-2.0
//! Translates a raw inbound HTTP request into the [`fp_sandbox::Request`]
//! bridge type (§4.4 "Invocation bridge"). The daemon's HTTP layer hands
//! us method/path/headers/body; this module owns query-string and cookie
//! parsing so that logic lives in exactly one place.

use fp_sandbox::Request;
use std::collections::BTreeMap;

/// Everything the gateway/daemon observed about an inbound call, before
/// it's translated into the sandbox's [`Request`] shape.
#[derive(Debug, Clone)]
pub struct RawInvocation {
    /// HTTP method.
    pub method: String,
    /// Path plus query string, e.g. `/invoke/f1/orders?limit=10`.
    pub url: String,
    /// Header name/value pairs as received.
    pub headers: Vec<(String, String)>,
    /// Request body.
    pub body: Vec<u8>,
    /// Caller's IP as observed by the gateway/daemon, if known.
    pub client_ip: Option<String>,
}

/// Build a sandbox [`Request`] from a raw invocation, lower-casing header
/// names and parsing the query string and `Cookie` header.
pub fn build_request(raw: &RawInvocation) -> Request {
    let headers: Vec<(String, String)> = raw
        .headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
        .collect();

    let query = raw
        .url
        .split_once('?')
        .map(|(_, qs)| parse_query(qs))
        .unwrap_or_default();

    let cookies = headers
        .iter()
        .find(|(name, _)| name == "cookie")
        .map(|(_, value)| parse_cookies(value))
        .unwrap_or_default();

    Request {
        method: raw.method.to_ascii_uppercase(),
        url: raw.url.clone(),
        headers,
        cookies,
        query,
        body: raw.body.clone(),
    }
}

/// Parse a `key=value&key=value2` query string, percent-decoding both
/// sides and collecting repeated keys into a `Vec`.
pub fn parse_query(query: &str) -> BTreeMap<String, Vec<String>> {
    let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        out.entry(key.into_owned()).or_default().push(value.into_owned());
    }
    out
}

/// Parse a `Cookie: a=1; b=2` header value into a name/value map.
pub fn parse_cookies(header_value: &str) -> BTreeMap<String, String> {
    header_value
        .split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_query_keys_collect_into_a_vec() {
        let q = parse_query("a=1&a=2&b=3");
        assert_eq!(q.get("a").unwrap(), &vec!["1".to_string(), "2".to_string()]);
        assert_eq!(q.get("b").unwrap(), &vec!["3".to_string()]);
    }

    #[test]
    fn cookies_split_on_semicolon_and_trim() {
        let c = parse_cookies("session=abc; theme = dark");
        assert_eq!(c.get("session").unwrap(), "abc");
        assert_eq!(c.get("theme").unwrap(), "dark");
    }

    #[test]
    fn build_request_lowercases_headers_and_parses_query() {
        let raw = RawInvocation {
            method: "get".into(),
            url: "/invoke/f1?x=1".into(),
            headers: vec![("X-Api-Key".into(), "secret".into())],
            body: Vec::new(),
            client_ip: Some("10.0.0.1".into()),
        };
        let req = build_request(&raw);
        assert_eq!(req.method, "GET");
        assert_eq!(req.get("x-api-key"), Some("secret"));
        assert_eq!(req.query.get("x").unwrap(), &vec!["1".to_string()]);
    }
}
