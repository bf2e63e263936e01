//! Argon2id hashing for passwords and recovery codes.

use anyhow::{Result, anyhow};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use rand::rngs::OsRng;

/// Hashes a secret with Argon2id and a fresh random salt.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|_| anyhow!("failed to hash password"))?
        .to_string();
    Ok(hash)
}

/// Verifies a secret against a stored hash. An unparseable hash (including
/// the empty string on accounts without a password) is simply a mismatch.
#[must_use]
pub fn verify_password(stored_hash: &str, password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_round_trip() {
        let hash = hash_password("P@ssw0rd").unwrap();
        assert!(verify_password(&hash, "P@ssw0rd"));
        assert!(!verify_password(&hash, "p@ssw0rd"));
    }

    #[test]
    fn hashes_are_salted() {
        let first = hash_password("P@ssw0rd").unwrap();
        let second = hash_password("P@ssw0rd").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn empty_or_garbage_hash_never_verifies() {
        assert!(!verify_password("", "anything"));
        assert!(!verify_password("not-a-phc-string", "anything"));
    }
}
