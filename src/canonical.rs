//! Canonical serialization and hashing helpers.
//!
//! ## Determinism Guarantees
//!
//! - Stable field order: struct fields serialize in declaration order
//! - Stable map order: `serde_json::Map` is sorted by key
//! - Stable time format: RFC3339 with nanosecond precision, trailing zeros trimmed
//!
//! Every hash that leaves the core is rendered as `sha256:<64 lowercase hex>`.

use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use regex_lite::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Prefix carried by every rendered digest.
pub const DIGEST_PREFIX: &str = "sha256:";

/// Serialize a value to canonical JSON bytes for hashing.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// `sha256:<hex>` digest of `bytes`.
pub fn prefixed_sha256(bytes: &[u8]) -> String {
    format!("{}{}", DIGEST_PREFIX, sha256_hex(bytes))
}

/// Hex-encoded HMAC-SHA256 of `body` under `secret`.
pub fn hmac_sha256_hex(secret: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret)
        .unwrap_or_else(|_| unreachable!("hmac accepts any key size"));
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex HMAC-SHA256 signature in constant time.
pub fn verify_hmac_sha256(secret: &[u8], body: &[u8], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = <Hmac<Sha256> as Mac>::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

fn digest_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^sha256:[a-f0-9]{64}$").unwrap_or_else(|_| unreachable!("static pattern"))
    })
}

/// Whether `value` is a well-formed `sha256:<64 hex>` digest.
pub fn is_sha256_digest(value: &str) -> bool {
    digest_regex().is_match(value)
}

/// Format a timestamp as RFC3339 with up to nine fractional digits.
///
/// Trailing zeros in the fraction are dropped, and the fraction is omitted
/// entirely for whole seconds.
pub fn format_rfc3339_nano(ts: &DateTime<Utc>) -> String {
    let full = ts.to_rfc3339_opts(SecondsFormat::Nanos, true);
    // full = "YYYY-MM-DDTHH:MM:SS.nnnnnnnnnZ"
    let Some(body) = full.strip_suffix('Z') else {
        return full;
    };
    match body.split_once('.') {
        Some((secs, frac)) => {
            let frac = frac.trim_end_matches('0');
            if frac.is_empty() {
                format!("{secs}Z")
            } else {
                format!("{secs}.{frac}Z")
            }
        }
        None => full,
    }
}

/// 32-bit FNV-1a hash.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    bytes.iter().fold(OFFSET_BASIS, |hash, b| (hash ^ u32::from(*b)).wrapping_mul(PRIME))
}
