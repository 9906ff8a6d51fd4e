//! Seal hashing.
//!
//! A document's seal is the SHA-256 of its canonical rendering with the
//! top-level `hash` key removed. Sealing and verifying use the same routine,
//! so any field change (including provenance) changes the seal.

use chrono::{DateTime, SecondsFormat};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::canonical::{CanonicalError, canonicalize_value};
use crate::error::{PackError, Result};

/// Name of the self-excluded seal field.
pub const HASH_FIELD: &str = "hash";

/// Base instant for derived timestamps (2024-01-01T00:00:00Z).
const DERIVED_EPOCH_SECS: i64 = 1_704_067_200;

/// A document carrying its own seal.
pub trait Sealable: Serialize {
    fn declared_hash(&self) -> &str;
    fn set_hash(&mut self, hash: String);
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes.as_ref());
    format!("{:x}", hasher.finalize())
}

/// Whether `s` is exactly 64 lowercase-or-uppercase hex characters.
pub fn is_hex64(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Seal hash of a JSON value, excluding its top-level `hash` key.
pub fn seal_hash_value(value: &Value) -> std::result::Result<String, CanonicalError> {
    let canonical = match value {
        Value::Object(map) if map.contains_key(HASH_FIELD) => {
            let mut stripped = map.clone();
            stripped.remove(HASH_FIELD);
            canonicalize_value(&Value::Object(stripped))?
        }
        other => canonicalize_value(other)?,
    };
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Seal hash of any serializable document.
pub fn seal_hash<T: Serialize + ?Sized>(doc: &T) -> std::result::Result<String, CanonicalError> {
    let value =
        serde_json::to_value(doc).map_err(|e| CanonicalError::Unrepresentable(e.to_string()))?;
    seal_hash_value(&value)
}

/// Compute and attach the seal.
pub fn seal<T: Sealable>(mut doc: T) -> Result<T> {
    let hash = seal_hash(&doc)?;
    doc.set_hash(hash);
    Ok(doc)
}

/// Verify a typed document's seal.
pub fn verify<T: Sealable>(doc: &T) -> Result<()> {
    let computed = seal_hash(doc)?;
    check(doc.declared_hash(), computed)
}

/// Verify the seal of a raw JSON document.
///
/// A missing or non-string `hash` is reported as a mismatch against the
/// computed value.
pub fn verify_value(value: &Value) -> Result<()> {
    let declared = value
        .get(HASH_FIELD)
        .and_then(Value::as_str)
        .unwrap_or_default();
    let computed = seal_hash_value(value)?;
    check(declared, computed)
}

fn check(declared: &str, computed: String) -> Result<()> {
    if declared.eq_ignore_ascii_case(&computed) {
        Ok(())
    } else {
        Err(PackError::HashMismatch {
            declared: declared.to_string(),
            computed,
        })
    }
}

/// RFC 3339 timestamp derived from a hex digest instead of the wall clock.
///
/// Identical inputs give identical provenance, which keeps pack seals
/// reproducible. The first 8 hex digits select an offset of up to ~136 years
/// from a fixed epoch.
pub fn derived_timestamp(digest_hex: &str) -> String {
    let offset = digest_hex
        .get(..8)
        .and_then(|prefix| u32::from_str_radix(prefix, 16).ok())
        .unwrap_or(0);
    DateTime::from_timestamp(DERIVED_EPOCH_SECS + i64::from(offset), 0)
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| "2024-01-01T00:00:00Z".to_string())
}
