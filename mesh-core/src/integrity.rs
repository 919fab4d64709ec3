//! Integrity: SHA-256 over whole payloads, verified once all chunks have arrived.

use sha2::{Digest, Sha256};

/// Hash a payload. Returns 32-byte digest.
pub fn checksum(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Verify payload against expected hash.
pub fn verify(payload: &[u8], expected: &[u8; 32]) -> bool {
    checksum(payload) == *expected
}

/// Lowercase hex for logs.
pub fn to_hex(digest: &[u8; 32]) -> String {
    data_encoding::HEXLOWER.encode(digest)
}
