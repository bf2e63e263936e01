//! Signed, time-boxed claim sets: refresh, access, and single-purpose
//! action tokens.
//!
//! Tokens are HS256 JWTs signed with the gate's base secret. Action tokens
//! may additionally salt the signing key with caller-supplied material;
//! password-reset tokens are salted with the current password hash, so a
//! completed reset invalidates any outstanding reset link without a
//! server-side token store. Because the salt can depend on mutable state,
//! verification of such tokens is two-phase: [`TokenCodec::unverified_claims`]
//! first, to learn which salt to verify with.

use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use serde_json::{Map, Value, json};
use std::time::{SystemTime, UNIX_EPOCH};

/// Discriminator carried in an action token's `act` claim. A token is only
/// honored by the action it names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenAction {
    Verify,
    Reset,
    EmailUpdate,
    Login,
}

impl TokenAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::Reset => "reset",
            Self::EmailUpdate => "emailupdate",
            Self::Login => "login",
        }
    }
}

impl std::fmt::Display for TokenAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token signature mismatch")]
    InvalidSignature,
    #[error("malformed token")]
    Malformed,
}

/// Verified (or deliberately unverified) claim set.
#[derive(Clone, Debug, Default)]
pub struct Claims(Map<String, Value>);

impl Claims {
    /// String claim, or `None` when absent or not a string.
    #[must_use]
    pub fn string(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

/// Creates and verifies the gate's signed tokens.
pub struct TokenCodec {
    secret: Vec<u8>,
}

impl TokenCodec {
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    /// Long-lived token binding `uid` to a revocable client id.
    pub fn create_refresh_token(
        &self,
        uid: &str,
        cid: &str,
        expiry: SystemTime,
    ) -> anyhow::Result<String> {
        let mut claims = Map::new();
        claims.insert("sub".into(), json!(uid));
        claims.insert("cid".into(), json!(cid));
        claims.insert("exp".into(), json!(unix_seconds(expiry)?));
        self.sign(&claims, "")
    }

    /// Short-lived token carrying an opaque authorization payload.
    pub fn create_access_token(
        &self,
        sub: &str,
        grants: &Value,
        expiry: SystemTime,
    ) -> anyhow::Result<String> {
        let mut claims = Map::new();
        claims.insert("sub".into(), json!(sub));
        claims.insert("grants".into(), grants.clone());
        claims.insert("exp".into(), json!(unix_seconds(expiry)?));
        self.sign(&claims, "")
    }

    /// Single-purpose token for email verification, password reset, email
    /// update, or link login.
    ///
    /// `key_salt` is appended to the signing key; pass the current password
    /// hash for reset tokens so the token self-invalidates when the password
    /// changes.
    pub fn create_action_token(
        &self,
        uid: &str,
        action: TokenAction,
        extra: &[(&str, &str)],
        expiry: SystemTime,
        key_salt: &str,
    ) -> anyhow::Result<String> {
        let mut claims = Map::new();
        claims.insert("uid".into(), json!(uid));
        claims.insert("act".into(), json!(action.as_str()));
        claims.insert("exp".into(), json!(unix_seconds(expiry)?));
        for (key, value) in extra {
            claims.insert((*key).into(), json!(value));
        }
        self.sign(&claims, key_salt)
    }

    /// Verifies signature and expiry, returning the full claim set.
    ///
    /// A stale `key_salt` (e.g. a reset token issued before a password
    /// change) surfaces as [`TokenError::InvalidSignature`].
    pub fn verify(&self, token: &str, key_salt: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let key = DecodingKey::from_secret(&self.salted_key(key_salt));
        match decode::<Map<String, Value>>(token, &key, &validation) {
            Ok(data) => Ok(Claims(data.claims)),
            Err(err) => Err(match err.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                _ => TokenError::Malformed,
            }),
        }
    }

    /// Parses claims without checking signature or expiry.
    ///
    /// Only for reading `act`/`uid` before the correct salt is known; every
    /// decision must be made against [`TokenCodec::verify`] output.
    pub fn unverified_claims(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        match decode::<Map<String, Value>>(token, &DecodingKey::from_secret(&[]), &validation) {
            Ok(data) => Ok(Claims(data.claims)),
            Err(_) => Err(TokenError::Malformed),
        }
    }

    fn sign(&self, claims: &Map<String, Value>, key_salt: &str) -> anyhow::Result<String> {
        let key = EncodingKey::from_secret(&self.salted_key(key_salt));
        encode(&Header::new(Algorithm::HS256), claims, &key)
            .map_err(|err| anyhow::anyhow!("failed to sign token: {err}"))
    }

    fn salted_key(&self, key_salt: &str) -> Vec<u8> {
        let mut key = self.secret.clone();
        key.extend_from_slice(key_salt.as_bytes());
        key
    }
}

fn unix_seconds(at: SystemTime) -> anyhow::Result<u64> {
    Ok(at
        .duration_since(UNIX_EPOCH)
        .map_err(|err| anyhow::anyhow!("expiry before unix epoch: {err}"))?
        .as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn codec() -> TokenCodec {
        TokenCodec::new(b"test-signing-secret")
    }

    fn soon() -> SystemTime {
        SystemTime::now() + Duration::from_secs(600)
    }

    #[test]
    fn refresh_token_round_trip() {
        let token = codec().create_refresh_token("u1", "cid-abc", soon()).unwrap();
        let claims = codec().verify(&token, "").unwrap();
        assert_eq!(claims.string("sub"), Some("u1"));
        assert_eq!(claims.string("cid"), Some("cid-abc"));
        assert!(claims.get("exp").is_some());
    }

    #[test]
    fn access_token_carries_grants() {
        let grants = json!({"owner": true, "role_ids": [1, 2]});
        let token = codec().create_access_token("u1", &grants, soon()).unwrap();
        let claims = codec().verify(&token, "").unwrap();
        assert_eq!(claims.get("grants"), Some(&grants));
    }

    #[test]
    fn expired_token_is_rejected() {
        let past = SystemTime::now() - Duration::from_secs(30);
        let token = codec().create_refresh_token("u1", "cid", past).unwrap();
        assert!(matches!(codec().verify(&token, ""), Err(TokenError::Expired)));
    }

    #[test]
    fn wrong_secret_is_an_invalid_signature() {
        let token = codec().create_refresh_token("u1", "cid", soon()).unwrap();
        let other = TokenCodec::new(b"another-secret");
        assert!(matches!(
            other.verify(&token, ""),
            Err(TokenError::InvalidSignature)
        ));
    }

    #[test]
    fn salted_token_fails_once_salt_changes() {
        let codec = codec();
        let token = codec
            .create_action_token("u1", TokenAction::Reset, &[], soon(), "old-password-hash")
            .unwrap();
        assert!(codec.verify(&token, "old-password-hash").is_ok());
        assert!(matches!(
            codec.verify(&token, "new-password-hash"),
            Err(TokenError::InvalidSignature)
        ));
    }

    #[test]
    fn unverified_claims_reads_without_salt() {
        let codec = codec();
        let token = codec
            .create_action_token(
                "u9",
                TokenAction::EmailUpdate,
                &[("email", "new@example.com")],
                soon(),
                "salt",
            )
            .unwrap();
        let claims = codec.unverified_claims(&token).unwrap();
        assert_eq!(claims.string("uid"), Some("u9"));
        assert_eq!(claims.string("act"), Some("emailupdate"));
        assert_eq!(claims.string("email"), Some("new@example.com"));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            codec().verify("not-a-token", ""),
            Err(TokenError::Malformed)
        ));
        assert!(matches!(
            codec().unverified_claims("still.not@token"),
            Err(TokenError::Malformed)
        ));
    }
}
