//! TOTP provisioning/verification and recovery-code generation.
//!
//! Verification accepts the standard 6-digit, 30-second, SHA-1 flavor that
//! every authenticator app produces. Recovery codes are 10-character
//! one-time credentials; the caller hashes them before storage and consumes
//! each at most once.

use anyhow::{Result, anyhow};
use rand::Rng;
use totp_rs::{Algorithm, Secret, TOTP};

pub const RECOVERY_CODE_COUNT: usize = 10;
pub const RECOVERY_CODE_LEN: usize = 10;
const RECOVERY_CODE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// A freshly generated TOTP enrollment key. Nothing is persisted until the
/// account settings are saved with a matching code.
#[derive(Clone, Debug)]
pub struct TotpKey {
    pub secret_base32: String,
    pub url: String,
}

/// Generates a provisioning secret and otpauth URL for `account` under
/// `issuer`.
pub fn generate_totp_key(issuer: &str, account: &str) -> Result<TotpKey> {
    let secret = Secret::generate_secret();
    let secret_bytes = secret
        .to_bytes()
        .map_err(|err| anyhow!("secret generation error: {err:?}"))?;
    let totp = build(secret_bytes, Some(issuer.to_string()), account.to_string())?;
    Ok(TotpKey {
        secret_base32: totp.get_secret_base32(),
        url: totp.get_url(),
    })
}

/// Checks `code` against a base32 `secret` within the current time window.
/// Any decode or clock failure counts as a mismatch.
#[must_use]
pub fn verify_totp(secret_base32: &str, code: &str) -> bool {
    let Ok(secret_bytes) = Secret::Encoded(secret_base32.to_string()).to_bytes() else {
        return false;
    };
    let Ok(totp) = build(secret_bytes, None, "account".to_string()) else {
        return false;
    };
    totp.check_current(code).unwrap_or(false)
}

/// Generates a batch of one-time recovery codes from the provided source of
/// randomness.
pub fn generate_recovery_codes<R: Rng + ?Sized>(rng: &mut R, count: usize) -> Vec<String> {
    (0..count).map(|_| generate_code(rng)).collect()
}

fn generate_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..RECOVERY_CODE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..RECOVERY_CODE_ALPHABET.len());
            RECOVERY_CODE_ALPHABET[idx] as char
        })
        .collect()
}

fn build(secret: Vec<u8>, issuer: Option<String>, account: String) -> Result<TOTP> {
    TOTP::new(Algorithm::SHA1, 6, 1, 30, secret, issuer, account)
        .map_err(|err| anyhow!("totp init error: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn generated_key_verifies_current_code() {
        let key = generate_totp_key("Demo App", "a@a.a").unwrap();
        let secret = Secret::Encoded(key.secret_base32.clone()).to_bytes().unwrap();
        let totp = build(secret, None, "account".to_string()).unwrap();
        let code = totp.generate_current().unwrap();
        assert!(verify_totp(&key.secret_base32, &code));
        assert!(!verify_totp(&key.secret_base32, "000000"));
    }

    #[test]
    fn provisioning_url_names_the_issuer() {
        let key = generate_totp_key("DemoApp", "a@a.a").unwrap();
        assert!(key.url.starts_with("otpauth://totp/"));
        assert!(key.url.contains("DemoApp"));
    }

    #[test]
    fn invalid_secret_never_verifies() {
        assert!(!verify_totp("!!!not-base32!!!", "123456"));
    }

    #[test]
    fn recovery_codes_match_length_and_alphabet() {
        let mut rng = StdRng::seed_from_u64(7);
        let codes = generate_recovery_codes(&mut rng, RECOVERY_CODE_COUNT);
        assert_eq!(codes.len(), RECOVERY_CODE_COUNT);
        for code in &codes {
            assert_eq!(code.len(), RECOVERY_CODE_LEN);
            assert!(code.bytes().all(|b| RECOVERY_CODE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn recovery_codes_are_distinct() {
        let mut rng = StdRng::seed_from_u64(42);
        let codes = generate_recovery_codes(&mut rng, RECOVERY_CODE_COUNT);
        let mut unique = codes.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), codes.len());
    }
}
