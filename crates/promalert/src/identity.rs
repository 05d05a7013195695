//! Order-independent alert identity.
//!
//! The identity is a SHA-1 over the label pairs taken in sorted key order,
//! each field length-prefixed. It depends on label content only, so a resolved alert maps
//! to the same identity as the firing alert it resolves, and the value stays
//! stable across restarts. Collisions are not resolved; dedup is best-effort.

use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap};

/// Fingerprint a label set.
#[must_use]
pub fn fingerprint(labels: &HashMap<String, String>) -> String {
    let canonical: BTreeMap<&str, &str> = labels
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();

    let mut hasher = Sha1::new();
    for (key, value) in &canonical {
        // Length prefixes keep ("ab","c") and ("a","bc") apart.
        hasher.update((key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    }

    hex::encode(hasher.finalize())
}
