//! SHA-256 digests used for cache keys.

use sha2::{Digest, Sha256};

/// Length of the truncated digest used for generation cache keys.
pub const SHORT_DIGEST_LEN: usize = 16;

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// First [`SHORT_DIGEST_LEN`] hex characters of the SHA-256 digest.
pub fn short_digest(data: &[u8]) -> String {
    let mut hex = sha256_hex(data);
    hex.truncate(SHORT_DIGEST_LEN);
    hex
}

/// Trim, collapse internal whitespace and lower-case free text so that
/// cosmetically different requests produce the same key.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}
