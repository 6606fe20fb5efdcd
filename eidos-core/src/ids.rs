//! Deterministic 12-hex identifiers and the persisted-timestamp clock.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Current time truncated to microsecond precision.
///
/// Persisted timestamps live in REAL columns at microsecond resolution;
/// constructing entities at the same resolution keeps save/load round trips
/// exactly equal.
#[must_use]
pub fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

/// Derive an opaque 12-hex id from a key string.
///
/// Ids are stable for identical keys, which keeps episode/step/distillation
/// ids reproducible across the pre/post two-phase write.
#[must_use]
pub fn derive_id(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut id = String::with_capacity(12);
    for byte in digest.iter().take(6) {
        use std::fmt::Write;
        let _ = write!(id, "{byte:02x}");
    }
    id
}

/// Truncate a string at a char boundary, for id key prefixes.
#[must_use]
pub fn prefix(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
