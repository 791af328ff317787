//! Content fingerprints: canonical JSON hashing for deduplication.

use crate::error::{CtiError, Result};
use crate::object::CtiObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Fields that describe provenance or bookkeeping rather than content.
///
/// They are stripped before hashing so that the same observation reported
/// by two sources (with different ids, timestamps or markings) collapses
/// onto a single fingerprint.
const META_FIELDS: [&str; 15] = [
    "id",
    "pid",
    "created",
    "modified",
    "valid_from",
    "valid_until",
    "revoked",
    "spec_version",
    "tlp",
    "risk",
    "origin",
    "history",
    "mtime",
    "ctime",
    "atime",
];

/// A 32-byte SHA-256 content hash; the true identity of a CTI object.
///
/// Two submissions with identical content deduplicate to one store entry
/// regardless of the ids they were submitted under.
///
/// # Examples
///
/// ```
/// use cti_core::{fingerprint, object};
///
/// let a = object::ipv4_address("1.2.3.4");
/// let b = object::ipv4_address("1.2.3.4");
/// // Different ids, same content, same fingerprint.
/// assert_ne!(a.id(), b.id());
/// assert_eq!(fingerprint::of(&a), fingerprint::of(&b));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Length of a fingerprint as a hex string.
    pub const HEX_LEN: usize = 64;

    /// Creates a fingerprint from raw bytes.
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns this fingerprint as a lowercase hex string.
    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a fingerprint from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != Self::HEX_LEN {
            return Err(CtiError::InvalidHex(format!(
                "expected {} hex chars, got {}",
                Self::HEX_LEN,
                s.len()
            )));
        }
        let bytes = hex::decode(s).map_err(|e| CtiError::InvalidHex(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CtiError::InvalidHex("invalid length".to_string()))?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}...)", &self.as_hex()[..12])
    }
}

/// Computes the content fingerprint of an object.
///
/// Top-level metadata fields are stripped, the remainder is rendered as
/// canonical JSON (keys sorted, compact separators), and the UTF-8 bytes
/// are hashed with SHA-256.
pub fn of(object: &CtiObject) -> Fingerprint {
    let canonical = canonical_content(object);
    let digest = Sha256::digest(canonical.as_bytes());
    Fingerprint::from_bytes(digest.into())
}

/// Canonical JSON of an object's non-metadata content.
pub fn canonical_content(object: &CtiObject) -> String {
    let stripped: BTreeMap<&String, &Value> = object
        .content()
        .iter()
        .filter(|(key, _)| !META_FIELDS.contains(&key.as_str()))
        .collect();

    let mut out = String::new();
    out.push('{');
    for (i, (key, value)) in stripped.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_canonical(&Value::String((*key).clone()), &mut out);
        out.push(':');
        write_canonical(value, &mut out);
    }
    out.push('}');
    out
}

/// Recursive canonical writer: object keys sorted, no extraneous whitespace.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, inner)) in sorted.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(&Value::String((*key).clone()), out);
                out.push(':');
                write_canonical(inner, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
