//! Job tokens
//!
//! A token fingerprints the parameters of an HLS request. Identical
//! requests from the same client share a token, and therefore a job and an
//! output directory.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::request::{format_duration, format_start};

/// Hex-encoded SHA-256 of the client key and request parameters.
pub fn compute_token(client: &str, path: &str, start: &DateTime<Utc>, duration: Duration) -> String {
    let mut hasher = Sha256::new();
    for field in [
        client,
        path,
        &format_start(start),
        &format_duration(duration),
    ] {
        hasher.update(field.as_bytes());
        // field separator, so ("ab", "c") and ("a", "bc") differ
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Whether `s` looks like a token produced by [`compute_token`].
pub fn is_valid_token(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::parse_start;

    fn start() -> DateTime<Utc> {
        parse_start("2024-05-01T08:00:00Z").unwrap()
    }

    #[test]
    fn test_token_is_deterministic() {
        let a = compute_token("10.0.0.1", "cam1", &start(), Duration::from_secs(60));
        let b = compute_token("10.0.0.1", "cam1", &start(), Duration::from_secs(60));
        assert_eq!(a, b);
        assert!(is_valid_token(&a));
    }

    #[test]
    fn test_token_depends_on_every_input() {
        let base = compute_token("10.0.0.1", "cam1", &start(), Duration::from_secs(60));
        let variants = [
            compute_token("10.0.0.2", "cam1", &start(), Duration::from_secs(60)),
            compute_token("10.0.0.1", "cam2", &start(), Duration::from_secs(60)),
            compute_token(
                "10.0.0.1",
                "cam1",
                &(start() + chrono::Duration::milliseconds(1)),
                Duration::from_secs(60),
            ),
            compute_token("10.0.0.1", "cam1", &start(), Duration::from_millis(60_001)),
        ];
        for v in &variants {
            assert_ne!(&base, v);
        }
    }

    #[test]
    fn test_token_fields_are_separated() {
        let a = compute_token("ab", "c", &start(), Duration::from_secs(1));
        let b = compute_token("a", "bc", &start(), Duration::from_secs(1));
        assert_ne!(a, b);
    }

    #[test]
    fn test_is_valid_token() {
        assert!(!is_valid_token("../etc"));
        assert!(!is_valid_token(&"A".repeat(64)));
        assert!(is_valid_token(&"a".repeat(64)));
    }
}
