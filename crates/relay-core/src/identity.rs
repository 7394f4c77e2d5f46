//! Certificate fingerprints.
//!
//! fingerprint = SHA-256(DER certificate), hex encoded. Used to name peers
//! in logs and to stamp bridged messages with the sender's identity.

use sha2::{Digest, Sha256};

/// Compute the full hex-encoded SHA-256 fingerprint of a DER certificate.
pub fn fingerprint(cert_der: &[u8]) -> String {
    let hash = Sha256::digest(cert_der);
    hex::encode(hash)
}

/// First `len` characters of a fingerprint, for log lines.
pub fn short_fingerprint(fp: &str, len: usize) -> &str {
    let len = len.max(4).min(fp.len());
    &fp[..len]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_hex_sha256() {
        let fp = fingerprint(b"certificate bytes");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, fingerprint(b"certificate bytes"));
        assert_ne!(fp, fingerprint(b"other bytes"));
    }

    #[test]
    fn short_fingerprint_clamps() {
        let fp = "abcdef0123456789";
        assert_eq!(short_fingerprint(fp, 8), "abcdef01");
        assert_eq!(short_fingerprint(fp, 1), "abcd");
        assert_eq!(short_fingerprint(fp, 100), fp);
    }
}
