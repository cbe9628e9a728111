//! Integrity: SHA-256 of a downloaded archive, checked against the digest a catalog advertises.

use sha2::{Digest, Sha256};

/// Hash an archive. Returns 32-byte digest.
pub fn hash_archive(archive: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(archive);
    hasher.finalize().into()
}

/// Lowercase hex SHA-256 of an archive.
pub fn hex_digest(archive: &[u8]) -> String {
    hex::encode(hash_archive(archive))
}

/// Verify an archive against an expected hex digest (case-insensitive, surrounding whitespace ignored).
pub fn verify_archive(archive: &[u8], expected_hex: &str) -> bool {
    hex_digest(archive).eq_ignore_ascii_case(expected_hex.trim())
}
