//! Argon2id password hashing for user records.

use anyhow::{anyhow, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use ring::rand::{SecureRandom, SystemRandom};

const SALT_BYTES: usize = 16;

/// Hash a password into a PHC string (`$argon2id$v=19$...`) with a fresh random salt.
pub fn hash_password(secret: &str) -> Result<String> {
    let mut salt_bytes = [0u8; SALT_BYTES];
    SystemRandom::new()
        .fill(&mut salt_bytes)
        .map_err(|_| anyhow!("Failed to generate password salt"))?;
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| anyhow!("Failed to encode password salt: {}", e))?;

    let hash = Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| anyhow!("Password hashing failed: {}", e))?;
    Ok(hash.to_string())
}

/// Check a password against a stored PHC string. Malformed hashes never verify.
pub fn verify_password(secret: &str, phc: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(phc) else {
        return false;
    };
    Argon2::default()
        .verify_password(secret.as_bytes(), &parsed)
        .is_ok()
}
