// SPDX-License-Identifier: MIT OR Apache-2.0
//! Admission (§4.4 step 2): when a function requires an API key, extract
//! the presented credential, hash it, and compare against the stored hash
//! in constant time so the compare itself leaks nothing about where the
//! mismatch occurred (§8 testable property 7).

use fp_sandbox::Request;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Pull the presented API key from `Authorization: Bearer …` or
/// `x-api-key`, preferring the former when both are present.
pub fn extract_presented_key(req: &Request) -> Option<&str> {
    if let Some(auth) = req.get("authorization")
        && let Some(rest) = auth.strip_prefix("Bearer ")
    {
        return Some(rest.trim());
    }
    req.get("x-api-key")
}

/// Hex-encoded SHA-256 of `value`, the same digest recorded as
/// `Function.api_key_hash`.
pub fn sha256_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Constant-time string equality. Differing lengths short-circuit (a
/// length mismatch is not a secret worth protecting here — the stored
/// hash length never varies), but for equal-length inputs every byte is
/// compared.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
