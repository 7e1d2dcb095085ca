//! The request/response capability surface handed to a function handler
//! inside the isolate (§4.2, §9 Design Notes). The wire shape is shared
//! between host and worker — both sides serialize the same [`Request`]
//! and [`Response`] structs over the JSONL protocol in [`crate::protocol`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// An inbound HTTP request, as handed to the function handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// HTTP method, upper-cased (`GET`, `POST`, ...).
    pub method: String,
    /// The request path plus query string, as received by the gateway.
    pub url: String,
    /// Header name/value pairs in arrival order. Names are lower-cased on
    /// construction so [`Request::get`] is case-insensitive.
    pub headers: Vec<(String, String)>,
    /// Cookies parsed from the `Cookie` header.
    pub cookies: BTreeMap<String, String>,
    /// Parsed query string parameters; a repeated key collects every value.
    pub query: BTreeMap<String, Vec<String>>,
    /// Raw request body bytes.
    pub body: Vec<u8>,
}

impl Request {
    /// Case-insensitive header lookup, returning the first matching value.
    pub fn get(&self, header_name: &str) -> Option<&str> {
        let needle = header_name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(name, _)| *name == needle)
            .map(|(_, value)| value.as_str())
    }

    /// Whether the request's `Content-Type` matches `mime_or_shorthand`.
    /// Accepts either a full MIME type (`application/json`) or a common
    /// shorthand (`json`, `html`, `text`, `urlencoded`), mirroring the
    /// shorthand matching of Express's `req.is()`.
    pub fn is(&self, mime_or_shorthand: &str) -> bool {
        let Some(content_type) = self.get("content-type") else {
            return false;
        };
        let content_type = content_type.split(';').next().unwrap_or("").trim();
        mime_matches(content_type, mime_or_shorthand)
    }

    /// Whether the request's `Accept` header indicates the client will
    /// take `mime_type`, implementing RFC 7231 §5.3.2 media-range
    /// matching (exact type, type wildcard `type/*`, full wildcard `*/*`)
    /// with quality-value ordering ignored for the yes/no decision.
    pub fn accepts(&self, mime_type: &str) -> bool {
        let Some(accept) = self.get("accept") else {
            return true;
        };
        accept
            .split(',')
            .map(|range| range.split(';').next().unwrap_or("").trim())
            .any(|range| media_range_matches(range, mime_type))
    }

    /// Deserialize the request body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

fn mime_matches(content_type: &str, shorthand: &str) -> bool {
    if content_type.eq_ignore_ascii_case(shorthand) {
        return true;
    }
    match shorthand.to_ascii_lowercase().as_str() {
        "json" => content_type.eq_ignore_ascii_case("application/json"),
        "html" => content_type.eq_ignore_ascii_case("text/html"),
        "text" => content_type.starts_with("text/"),
        "urlencoded" => content_type.eq_ignore_ascii_case("application/x-www-form-urlencoded"),
        _ => false,
    }
}

fn media_range_matches(range: &str, mime_type: &str) -> bool {
    if range == "*/*" {
        return true;
    }
    let Some((range_type, range_subtype)) = range.split_once('/') else {
        return false;
    };
    let Some((mime_main, mime_sub)) = mime_type.split_once('/') else {
        return false;
    };
    (range_type == "*" || range_type.eq_ignore_ascii_case(mime_main))
        && (range_subtype == "*" || range_subtype.eq_ignore_ascii_case(mime_sub))
}

/// Cookie attributes for [`Response::cookie`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CookieOptions {
    /// `Max-Age` in seconds.
    pub max_age_secs: Option<i64>,
    /// `Path` attribute; defaults to `/` when unset if omitted by the caller.
    pub path: Option<String>,
    /// `HttpOnly` attribute.
    pub http_only: bool,
    /// `Secure` attribute.
    pub secure: bool,
    /// `SameSite` attribute (`Strict`, `Lax`, or `None`).
    pub same_site: Option<String>,
}

/// A builder for the handler's HTTP response.
///
/// Every mutating method consumes and returns `self` by value so handler
/// code reads as a chain (`Response::new().status(404).json(&body)?`).
/// Once a terminal operation (`send`, `json`, `redirect`, `end`) has run,
/// [`Response::ended`] is `true` and every further mutating call becomes a
/// silent no-op — a handler that calls `send` twice, or `json` after
/// `redirect`, gets the first outcome rather than a panic or a malformed
/// double response (§4.2: "terminal operations are idempotent after the
/// first").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// Header name/value pairs in the order they were set or appended.
    pub headers: Vec<(String, String)>,
    /// `Set-Cookie` lines, rendered from [`Response::cookie`]/
    /// [`Response::clear_cookie`] calls.
    pub set_cookies: Vec<String>,
    /// Response body bytes.
    pub body: Vec<u8>,
    /// `true` once a terminal operation has run.
    pub ended: bool,
    /// `true` once headers are considered committed — mirrors
    /// `res.headersSent` — set the moment a terminal operation runs,
    /// since this bridge buffers the whole response rather than streaming.
    pub headers_sent: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self::new()
    }
}

impl Response {
    /// A fresh, empty 200 response.
    pub fn new() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            set_cookies: Vec::new(),
            body: Vec::new(),
            ended: false,
            headers_sent: false,
        }
    }

    fn if_open(mut self, f: impl FnOnce(&mut Self)) -> Self {
        if !self.ended {
            f(&mut self);
        }
        self
    }

    /// Set the status code.
    pub fn status(self, code: u16) -> Self {
        self.if_open(|r| r.status = code)
    }

    /// Set a header, replacing any existing value(s) with the same name.
    pub fn set_header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.if_open(|r| {
            let name = name.into();
            r.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
            r.headers.push((name, value.into()));
        })
    }

    /// Append an additional value for `name` without removing existing ones
    /// (used for headers like `Link` or `Set-Cookie` that may repeat).
    pub fn append_header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.if_open(|r| r.headers.push((name.into(), value.into())))
    }

    /// Remove every header matching `name`.
    pub fn remove_header(self, name: &str) -> Self {
        self.if_open(|r| r.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name)))
    }

    /// Add a `Set-Cookie` header.
    pub fn cookie(self, name: &str, value: &str, opts: CookieOptions) -> Self {
        self.if_open(|r| r.set_cookies.push(render_cookie(name, value, &opts)))
    }

    /// Expire a cookie immediately (`Max-Age=0`).
    pub fn clear_cookie(self, name: &str) -> Self {
        self.if_open(|r| {
            r.set_cookies.push(render_cookie(
                name,
                "",
                &CookieOptions {
                    max_age_secs: Some(0),
                    ..Default::default()
                },
            ))
        })
    }

    /// Set the `Content-Type` header.
    pub fn content_type(self, mime: &str) -> Self {
        self.set_header("content-type", mime)
    }

    /// Set `Content-Disposition: attachment`, optionally naming the file.
    pub fn attachment(self, filename: Option<&str>) -> Self {
        let value = match filename {
            Some(name) => format!("attachment; filename=\"{name}\""),
            None => "attachment".to_string(),
        };
        self.set_header("content-disposition", value)
    }

    /// Serialize `body` as JSON and end the response.
    pub fn json<T: Serialize>(self, body: &T) -> Result<Self, serde_json::Error> {
        if self.ended {
            return Ok(self);
        }
        let bytes = serde_json::to_vec(body)?;
        Ok(self.content_type("application/json").send(bytes))
    }

    /// Set the body and end the response.
    pub fn send(self, body: impl Into<Vec<u8>>) -> Self {
        if self.ended {
            return self;
        }
        let mut r = self;
        r.body = body.into();
        r.ended = true;
        r.headers_sent = true;
        r
    }

    /// Stream a file from disk, restricted to `package_root` — any path
    /// that escapes the package's extracted directory (via `..` or a
    /// symlink) is rejected rather than served (§4.2 "restricted
    /// filesystem view").
    pub fn send_file(self, path: &Path, package_root: &Path) -> Result<Self, SandboxBridgeError> {
        if self.ended {
            return Ok(self);
        }
        let resolved = package_root
            .join(path)
            .canonicalize()
            .map_err(|_| SandboxBridgeError::PathEscapesPackageRoot)?;
        let root = package_root
            .canonicalize()
            .map_err(|_| SandboxBridgeError::PathEscapesPackageRoot)?;
        if !resolved.starts_with(&root) {
            return Err(SandboxBridgeError::PathEscapesPackageRoot);
        }
        let bytes = std::fs::read(&resolved).map_err(SandboxBridgeError::Io)?;
        Ok(self.send(bytes))
    }

    /// Redirect to `location` (defaults to a `302 Found`).
    pub fn redirect(self, location: &str) -> Self {
        if self.ended {
            return self;
        }
        self.status(302).set_header("location", location).send(Vec::new())
    }

    /// End the response with whatever status/headers/body have been set
    /// so far, with no body change (use after `status`/`set_header` calls
    /// alone, e.g. a bare `204`).
    pub fn end(self) -> Self {
        if self.ended {
            return self;
        }
        let mut r = self;
        r.ended = true;
        r.headers_sent = true;
        r
    }
}

/// Errors from [`Response::send_file`].
#[derive(Debug, thiserror::Error)]
pub enum SandboxBridgeError {
    /// The requested path resolved outside the package root.
    #[error("path escapes the package root")]
    PathEscapesPackageRoot,
    /// The file could not be read.
    #[error("file read error: {0}")]
    Io(#[source] std::io::Error),
}

fn render_cookie(name: &str, value: &str, opts: &CookieOptions) -> String {
    let mut out = format!("{name}={value}");
    out.push_str(&format!("; Path={}", opts.path.as_deref().unwrap_or("/")));
    if let Some(max_age) = opts.max_age_secs {
        out.push_str(&format!("; Max-Age={max_age}"));
    }
    if opts.http_only {
        out.push_str("; HttpOnly");
    }
    if opts.secure {
        out.push_str("; Secure");
    }
    if let Some(same_site) = &opts.same_site {
        out.push_str(&format!("; SameSite={same_site}"));
    }
    out
}

/// Build an empty request for tests and for synthesizing handler input
/// outside a live gateway (e.g. a scheduled invocation with no HTTP body).
pub fn empty_request(method: &str, url: &str) -> Request {
    Request {
        method: method.to_string(),
        url: url.to_string(),
        headers: Vec::new(),
        cookies: BTreeMap::new(),
        query: BTreeMap::new(),
        body: Vec::new(),
    }
}

/// Resolve a package-relative path against its extraction root, used by
/// callers that need the same containment check [`Response::send_file`]
/// performs without going through a `Response`.
pub fn resolve_in_package_root(path: &Path, package_root: &Path) -> Option<PathBuf> {
    let resolved = package_root.join(path).canonicalize().ok()?;
    let root = package_root.canonicalize().ok()?;
    resolved.starts_with(&root).then_some(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req_with_headers(headers: Vec<(&str, &str)>) -> Request {
        Request {
            method: "GET".into(),
            url: "/".into(),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect(),
            cookies: BTreeMap::new(),
            query: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    #[test]
    fn get_is_case_insensitive() {
        let req = req_with_headers(vec![("Content-Type", "application/json")]);
        assert_eq!(req.get("content-type"), Some("application/json"));
        assert_eq!(req.get("CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn is_matches_shorthand_and_ignores_parameters() {
        let req = req_with_headers(vec![("content-type", "application/json; charset=utf-8")]);
        assert!(req.is("json"));
        assert!(req.is("application/json"));
        assert!(!req.is("html"));
    }

    #[test]
    fn accepts_matches_wildcards() {
        let any = req_with_headers(vec![("accept", "*/*")]);
        assert!(any.accepts("application/json"));

        let specific = req_with_headers(vec![("accept", "text/html, application/json;q=0.9")]);
        assert!(specific.accepts("application/json"));
        assert!(specific.accepts("text/html"));
        assert!(!specific.accepts("image/png"));

        let no_header = req_with_headers(vec![]);
        assert!(no_header.accepts("anything/whatever"));
    }

    #[test]
    fn response_set_header_replaces_not_appends() {
        let res = Response::new()
            .set_header("x-a", "1")
            .set_header("x-a", "2")
            .end();
        assert_eq!(res.headers, vec![("x-a".to_string(), "2".to_string())]);
    }

    #[test]
    fn response_append_header_keeps_both() {
        let res = Response::new()
            .append_header("x-a", "1")
            .append_header("x-a", "2")
            .end();
        assert_eq!(res.headers.len(), 2);
    }

    #[test]
    fn terminal_send_is_idempotent() {
        let res = Response::new().send(b"first".to_vec()).send(b"second".to_vec());
        assert_eq!(res.body, b"first".to_vec());
    }

    #[test]
    fn mutating_after_redirect_is_a_no_op() {
        let res = Response::new()
            .redirect("/elsewhere")
            .status(500)
            .set_header("x-ignored", "yes");
        assert_eq!(res.status, 302);
        assert!(!res.headers.iter().any(|(n, _)| n == "x-ignored"));
    }

    #[test]
    fn json_sets_content_type_and_ends() {
        let res = Response::new().json(&serde_json::json!({"ok": true})).unwrap();
        assert!(res.ended);
        assert_eq!(res.get_header("content-type"), Some("application/json"));
        assert_eq!(res.body, br#"{"ok":true}"#.to_vec());
    }

    #[test]
    fn clear_cookie_sets_max_age_zero() {
        let res = Response::new().clear_cookie("session").end();
        assert!(res.set_cookies[0].contains("Max-Age=0"));
    }

    #[test]
    fn send_file_rejects_path_escaping_root() {
        let root = std::env::temp_dir().join(format!("fp-sandbox-test-{}", std::process::id()));
        std::fs::create_dir_all(root.join("pkg")).unwrap();
        std::fs::write(root.join("secret.txt"), b"top secret").unwrap();
        let package_root = root.join("pkg");

        let res = Response::new().send_file(Path::new("../secret.txt"), &package_root);
        assert!(matches!(res, Err(SandboxBridgeError::PathEscapesPackageRoot)));

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn send_file_serves_file_within_root() {
        let root = std::env::temp_dir().join(format!("fp-sandbox-test-ok-{}", std::process::id()));
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("index.html"), b"<html></html>").unwrap();

        let res = Response::new()
            .send_file(Path::new("index.html"), &root)
            .unwrap();
        assert_eq!(res.body, b"<html></html>".to_vec());

        std::fs::remove_dir_all(&root).ok();
    }

    impl Response {
        fn get_header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }
    }
}
