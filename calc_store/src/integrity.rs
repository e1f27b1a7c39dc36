//! # Integrity Codec
//!
//! Content checksums for stored records. Records are first brought into a
//! canonical form (JSON with ordered object keys) so that two semantically
//! identical records always produce the same digest, no matter how their
//! maps were built in memory.
//!
//! A failed verification is reported as `false`, never as an error; the
//! caller decides that the data is corrupted and routes to recovery.
//!
//! ## Example
//!
//! ```rust
//! use calc_store::integrity::{canonical_bytes, checksum, verify};
//! use serde_json::json;
//!
//! let a = canonical_bytes(&json!({"b": 1, "a": 2})).unwrap();
//! let b = canonical_bytes(&json!({"a": 2, "b": 1})).unwrap();
//! assert_eq!(checksum(&a), checksum(&b));
//! assert!(verify(&a, &checksum(&b)));
//! ```

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::errors::{StoreError, StoreResult};

/// Serialize a value into canonical JSON bytes.
///
/// Going through `serde_json::Value` sorts object keys, which gives a
/// stable byte representation for hashing.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> StoreResult<Vec<u8>> {
    let value = serde_json::to_value(value).map_err(StoreError::serialization)?;
    serde_json::to_vec(&value).map_err(StoreError::serialization)
}

/// SHA-256 digest of `bytes` as lowercase hex.
pub fn checksum(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Recompute the digest of `bytes` and compare it with `digest`.
pub fn verify(bytes: &[u8], digest: &str) -> bool {
    checksum(bytes).eq_ignore_ascii_case(digest.trim())
}

/// Canonicalize and hash in one step.
pub fn checksum_of<T: Serialize + ?Sized>(value: &T) -> StoreResult<String> {
    Ok(checksum(&canonical_bytes(value)?))
}
