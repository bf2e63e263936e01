//! Pluggable identity storage and token collaborator interfaces.
//!
//! The core never owns identity storage; it exchanges a string-keyed field
//! map with a host-implemented [`IdentityProvider`]. Optional collaborators
//! override how client ids are minted/revoked and how access grants are
//! issued; the defaults bind a refresh token to the requesting agent and
//! keep a bounded in-memory deny-list.

use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cache::LruCache;

/// Bool-as-string flag gating login: `"1"` once the email is verified.
pub const FIELD_ACTIVE: &str = "active";
/// TOTP shared secret; empty means two-factor is disabled.
pub const FIELD_TOTP_SECRET: &str = "totpsecret";
/// Pipe-delimited hashed one-time recovery codes.
pub const FIELD_RECOVERY_CODES: &str = "recoverycodes";
/// Ephemeral 2FA/recovery code; request-only, never persisted.
pub const FIELD_CODE: &str = "code";
/// Registration consent flag; request-only.
pub const FIELD_TERMS: &str = "terms";
/// Request-only flag extending the refresh-token lifetime.
pub const FIELD_REMEMBER: &str = "remember";

/// Field keys with system meaning that hosts may not declare as account
/// fields.
pub const RESERVED_FIELDS: &[&str] = &[
    FIELD_ACTIVE,
    FIELD_TOTP_SECRET,
    FIELD_RECOVERY_CODES,
    FIELD_CODE,
    FIELD_TERMS,
];

/// Provider-owned identity snapshot exchanged as a generic field map.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IdentityRecord {
    /// Provider-assigned unique id; `None` until first save.
    pub uid: Option<String>,
    pub fields: HashMap<String, String>,
}

impl IdentityRecord {
    /// Field value, defaulting to the empty string.
    #[must_use]
    pub fn get(&self, key: &str) -> &str {
        self.fields.get(key).map_or("", String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.fields.insert(key.to_string(), value.into());
    }

    /// Reads a bool-as-string flag (`"1"` = true).
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.get(key) == "1"
    }

    pub fn set_flag(&mut self, key: &str, value: bool) {
        self.set(key, if value { "1" } else { "" });
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity not found")]
    NotFound,
    /// The identity exists but has not verified its email; carries the uid
    /// so callers can offer a resend-verification affordance.
    #[error("identity not active")]
    NotActive { uid: String },
    /// Field-scoped, user-fixable failure raised by the provider itself.
    #[error("{field}: {message}")]
    Validation { field: String, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Host-implemented identity storage.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Resolves a login identifier (email/username) to a uid. Must fail
    /// with [`IdentityError::NotFound`] for unknown identifiers and
    /// [`IdentityError::NotActive`] for identities that may not log in yet.
    async fn identity_uid(&self, id: &str) -> Result<String, IdentityError>;

    /// Loads the record for `uid`. Loading the empty uid must fail with
    /// [`IdentityError::NotFound`].
    async fn identity_load(&self, uid: &str) -> Result<IdentityRecord, IdentityError>;

    /// Creates (no uid) or updates (uid present) a record, returning its
    /// uid. Concurrent saves of the same record must not lose updates.
    async fn identity_save(&self, record: &IdentityRecord) -> Result<String, IdentityError>;
}

/// Requesting agent, as far as the default client-id derivation cares.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: String,
}

impl ClientInfo {
    /// Extracts the client IP and user agent from proxy headers
    /// (`X-Forwarded-For` takes precedence over `X-Real-IP`).
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let ip = forwarded
            .or_else(|| {
                headers
                    .get("x-real-ip")
                    .and_then(|value| value.to_str().ok())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
            })
            .unwrap_or("")
            .to_string();
        let user_agent = headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();
        Self { ip, user_agent }
    }
}

/// Mints and revokes the client id (`cid`) bound into refresh tokens.
#[async_trait]
pub trait RefreshTokenProvider: Send + Sync {
    /// Returns a fresh `cid` for a login by `uid` from `client`.
    /// `password_hash` is empty in passwordless mode.
    async fn create_client_id(
        &self,
        uid: &str,
        client: &ClientInfo,
        password_hash: &str,
    ) -> anyhow::Result<String>;

    /// Invalidates `cid` for `uid` (logout).
    async fn revoke_client_id(&self, uid: &str, cid: &str) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// The refresh token is well-formed but its client id is no longer
    /// honored; surfaces as 401, never 500.
    #[error("token denied")]
    Denied,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Validates a refresh token's `cid` and issues the access-token grants.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn grants(
        &self,
        uid: &str,
        cid: &str,
        client: &ClientInfo,
    ) -> Result<Value, AccessError>;
}

/// Derives `cid` = hex(SHA-256(ip + user-agent + key + salt)) + salt, with a
/// time-based salt so the value rotates per login and is not enumerable.
/// Folding the password hash into `key` invalidates every outstanding
/// refresh token the moment the password changes.
#[must_use]
pub fn derive_client_id(client: &ClientInfo, key: &str, salt: &str) -> String {
    let salt = if salt.is_empty() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        format!("${now}")
    } else {
        salt.to_string()
    };
    let mut hasher = Sha256::new();
    hasher.update(client.ip.as_bytes());
    hasher.update(client.user_agent.as_bytes());
    hasher.update(key.as_bytes());
    hasher.update(salt.as_bytes());
    format!("{}{salt}", hex::encode(hasher.finalize()))
}

fn deny_key(uid: &str, cid: &str) -> String {
    format!("x:{uid}{cid}")
}

/// Default refresh-token collaborator: derived client ids plus a bounded
/// best-effort deny-list for revocation.
pub(crate) struct DerivedClientIds {
    deny_list: Arc<LruCache<String, bool>>,
}

impl DerivedClientIds {
    pub(crate) fn new(deny_list: Arc<LruCache<String, bool>>) -> Self {
        Self { deny_list }
    }
}

#[async_trait]
impl RefreshTokenProvider for DerivedClientIds {
    async fn create_client_id(
        &self,
        _uid: &str,
        client: &ClientInfo,
        password_hash: &str,
    ) -> anyhow::Result<String> {
        Ok(derive_client_id(client, password_hash, ""))
    }

    async fn revoke_client_id(&self, uid: &str, cid: &str) -> anyhow::Result<()> {
        self.deny_list
            .put(deny_key(uid, cid), true, std::time::Duration::ZERO);
        Ok(())
    }
}

/// Default access-token collaborator: the presented `cid` must not be
/// revoked and must match a recomputation from the current request and the
/// current password hash, using the salt suffix carried in the `cid`
/// itself. Grants are the literal `"access"`.
pub(crate) struct DerivedAccessGrants {
    deny_list: Arc<LruCache<String, bool>>,
    provider: Arc<dyn IdentityProvider>,
    password_field: Option<String>,
}

impl DerivedAccessGrants {
    pub(crate) fn new(
        deny_list: Arc<LruCache<String, bool>>,
        provider: Arc<dyn IdentityProvider>,
        password_field: Option<String>,
    ) -> Self {
        Self {
            deny_list,
            provider,
            password_field,
        }
    }
}

#[async_trait]
impl AccessTokenProvider for DerivedAccessGrants {
    async fn grants(
        &self,
        uid: &str,
        cid: &str,
        client: &ClientInfo,
    ) -> Result<Value, AccessError> {
        if self.deny_list.get(&deny_key(uid, cid)).is_some() {
            return Err(AccessError::Denied);
        }
        let Some(salt_at) = cid.find('$') else {
            return Err(AccessError::Denied);
        };
        let password_hash = match &self.password_field {
            Some(field) => {
                let record = self
                    .provider
                    .identity_load(uid)
                    .await
                    .map_err(|err| AccessError::Other(err.into()))?;
                record.get(field).to_string()
            }
            None => String::new(),
        };
        let expected = derive_client_id(client, &password_hash, &cid[salt_at..]);
        if expected == cid {
            Ok(json!("access"))
        } else {
            Err(AccessError::Denied)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn client() -> ClientInfo {
        ClientInfo {
            ip: "1.2.3.4".to_string(),
            user_agent: "test-agent".to_string(),
        }
    }

    #[test]
    fn record_flag_round_trip() {
        let mut record = IdentityRecord::default();
        assert!(!record.flag(FIELD_ACTIVE));
        record.set_flag(FIELD_ACTIVE, true);
        assert!(record.flag(FIELD_ACTIVE));
        record.set_flag(FIELD_ACTIVE, false);
        assert!(!record.flag(FIELD_ACTIVE));
    }

    #[test]
    fn client_info_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.2.3.4, 5.6.7.8"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        headers.insert("user-agent", HeaderValue::from_static("ua"));
        let info = ClientInfo::from_headers(&headers);
        assert_eq!(info.ip, "1.2.3.4");
        assert_eq!(info.user_agent, "ua");
    }

    #[test]
    fn client_info_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("9.9.9.9"));
        assert_eq!(ClientInfo::from_headers(&headers).ip, "9.9.9.9");
    }

    #[test]
    fn derived_cid_is_stable_for_a_fixed_salt() {
        let first = derive_client_id(&client(), "pw-hash", "$1700000000");
        let second = derive_client_id(&client(), "pw-hash", "$1700000000");
        assert_eq!(first, second);
        assert!(first.ends_with("$1700000000"));
    }

    #[test]
    fn derived_cid_changes_with_key_material() {
        let salt = "$1700000000";
        let with_old = derive_client_id(&client(), "old-hash", salt);
        let with_new = derive_client_id(&client(), "new-hash", salt);
        assert_ne!(with_old, with_new);
    }

    #[test]
    fn recomputation_validates_against_embedded_salt() {
        let cid = derive_client_id(&client(), "pw-hash", "");
        let salt_at = cid.find('$').unwrap();
        let expected = derive_client_id(&client(), "pw-hash", &cid[salt_at..]);
        assert_eq!(expected, cid);
    }
}
