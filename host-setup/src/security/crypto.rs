// Cryptographic utilities

use base64::Engine;
use sha2::{Digest, Sha256};

/// Symmetric key length for AES-256-GCM.
pub const KEY_BYTES: usize = 32;

/// SHA-256 base64 digest (STANDARD).
pub fn sha256_base64(input: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(Sha256::digest(input))
}

/// Compute a safe fingerprint for a secret (hash only; never store the raw secret).
pub fn secret_fingerprint(input: &[u8]) -> String {
    sha256_base64(input)
}

/// Derive the marker encryption key from a machine identifier.
///
/// The digest is truncated to the cipher key length; SHA-256 already yields exactly 32 bytes.
pub fn derive_machine_key(machine_id: &[u8]) -> [u8; KEY_BYTES] {
    let digest = Sha256::digest(machine_id);
    let mut key = [0u8; KEY_BYTES];
    key.copy_from_slice(&digest[..KEY_BYTES]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_base64_known_vector() {
        assert_eq!(
            sha256_base64(b"abc"),
            "ungWv48Bz+pBQUDeXa4iI7ADYaOWF3qctBD/YfIAFa0="
        );
    }

    #[test]
    fn machine_key_is_deterministic_and_identity_bound() {
        let a = derive_machine_key(b"machine-a");
        assert_eq!(a, derive_machine_key(b"machine-a"));
        assert_ne!(a, derive_machine_key(b"machine-b"));
    }

    #[test]
    fn fingerprint_does_not_contain_input() {
        let fp = secret_fingerprint(b"super-secret");
        assert!(!fp.contains("super-secret"));
        assert_eq!(fp.len(), 44);
    }
}
