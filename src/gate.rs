//! The gate ties configuration, codec, limiter, revocation list, identity
//! provider, and mail sender together. Handlers stay thin; every decision
//! that spans more than one collaborator lives here.

use anyhow::{Context, Result};
use axum::http::{HeaderMap, header};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tracing::debug;

use crate::cache::{LruCache, MemoryRateLimiter, RateLimitError, RateLimiter};
use crate::config::{AuthConfig, Rate};
use crate::email::{EmailSender, default_action_email};
use crate::error::ApiError;
use crate::password;
use crate::provider::{
    AccessTokenProvider, ClientInfo, DerivedAccessGrants, DerivedClientIds, FIELD_RECOVERY_CODES,
    FIELD_TOTP_SECRET, IdentityProvider, IdentityRecord, RefreshTokenProvider,
};
use crate::token::{TokenAction, TokenCodec};
use crate::totp;

/// Capacity of the in-memory revocation deny-list. Bounded on purpose:
/// revocation is best effort and old entries age out under pressure.
const DENY_LIST_CAPACITY: usize = 500;
/// Capacity of the default in-memory rate-limit counter cache.
const RATE_CACHE_CAPACITY: usize = 10_000;

/// Host-supplied collaborator overrides; `None` selects the built-in
/// default for that concern.
#[derive(Default)]
pub struct Collaborators {
    pub email_sender: Option<Arc<dyn EmailSender>>,
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    pub refresh_tokens: Option<Arc<dyn RefreshTokenProvider>>,
    pub access_tokens: Option<Arc<dyn AccessTokenProvider>>,
}

/// The verified caller of an access-token protected endpoint.
#[derive(Clone, Debug)]
pub struct Auth {
    pub uid: String,
    pub grants: Value,
}

impl Auth {
    /// Deserializes the grants payload into a host-defined type.
    pub fn load<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.grants.clone()).context("failed to deserialize grants")
    }
}

/// Central orchestrator. Construct once with [`AuthGate::new`], share via
/// `Arc`, and mount [`crate::handlers::router`].
pub struct AuthGate {
    pub(crate) config: AuthConfig,
    pub(crate) codec: TokenCodec,
    pub(crate) provider: Arc<dyn IdentityProvider>,
    pub(crate) email_sender: Option<Arc<dyn EmailSender>>,
    rate_limiter: Arc<dyn RateLimiter>,
    pub(crate) refresh_tokens: Arc<dyn RefreshTokenProvider>,
    pub(crate) access_tokens: Arc<dyn AccessTokenProvider>,
    rng: Mutex<StdRng>,
}

impl AuthGate {
    /// Validates the configuration and resolves collaborator defaults once.
    pub fn new(
        config: AuthConfig,
        provider: Arc<dyn IdentityProvider>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let deny_list = Arc::new(LruCache::new(DENY_LIST_CAPACITY));
        let refresh_tokens = collaborators
            .refresh_tokens
            .unwrap_or_else(|| Arc::new(DerivedClientIds::new(Arc::clone(&deny_list))));
        let access_tokens = collaborators.access_tokens.unwrap_or_else(|| {
            Arc::new(DerivedAccessGrants::new(
                deny_list,
                Arc::clone(&provider),
                config.password_field.clone(),
            ))
        });
        let rate_limiter = collaborators
            .rate_limiter
            .unwrap_or_else(|| Arc::new(MemoryRateLimiter::new(RATE_CACHE_CAPACITY)));
        Ok(Self {
            codec: TokenCodec::new(&config.signing_key),
            config,
            provider,
            email_sender: collaborators.email_sender,
            rate_limiter,
            refresh_tokens,
            access_tokens,
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Counts one event for `prefix:key` against `rate`.
    pub(crate) fn rate_guard(
        &self,
        prefix: &str,
        key: &str,
        rate: Rate,
    ) -> Result<(), RateLimitError> {
        self.rate_limiter.rate_limit(
            &format!("{prefix}:{}", key.to_lowercase()),
            rate.rate,
            rate.window,
        )
    }

    /// Batch of one-time recovery codes from the gate's own RNG.
    #[must_use]
    pub fn new_recovery_codes(&self) -> Vec<String> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        totp::generate_recovery_codes(&mut *rng, totp::RECOVERY_CODE_COUNT)
    }

    /// Checks the submitted second-factor `code` against the record.
    ///
    /// Ten-character codes are tried against the stored recovery set first;
    /// a match consumes that code (the rewritten set is left on `record` and
    /// `true` is returned so the caller persists it). Anything else falls
    /// through to a TOTP window check.
    pub(crate) fn check_second_factor(
        &self,
        record: &mut IdentityRecord,
        code: &str,
    ) -> Result<bool, ApiError> {
        if code.len() == totp::RECOVERY_CODE_LEN {
            let stored = record.get(FIELD_RECOVERY_CODES).to_string();
            let hashes: Vec<&str> = stored.split('|').filter(|h| !h.is_empty()).collect();
            if let Some(at) = hashes
                .iter()
                .position(|hash| password::verify_password(hash, code))
            {
                let remaining: Vec<&str> = hashes
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| *i != at)
                    .map(|(_, h)| *h)
                    .collect();
                record.set(FIELD_RECOVERY_CODES, remaining.join("|"));
                return Ok(true);
            }
        }
        if totp::verify_totp(record.get(FIELD_TOTP_SECRET), code) {
            Ok(false)
        } else {
            Err(ApiError::field("code", "invalid"))
        }
    }

    /// Mints a client id and refresh token for a fresh login.
    pub(crate) async fn issue_refresh_token(
        &self,
        uid: &str,
        record: &IdentityRecord,
        client: &ClientInfo,
        remember: bool,
    ) -> Result<String> {
        let password_hash = self
            .config
            .password_field
            .as_deref()
            .map_or("", |field| record.get(field));
        let cid = self
            .refresh_tokens
            .create_client_id(uid, client, password_hash)
            .await?;
        let ttl = if remember {
            self.config.timeouts.refresh_token_remember
        } else {
            self.config.timeouts.refresh_token
        };
        self.codec
            .create_refresh_token(uid, &cid, SystemTime::now() + ttl)
    }

    /// Issues an action token, composes the action mail, and sends it.
    ///
    /// Returns whether a mail actually went out: `false` when no sender is
    /// configured or the action's template has an empty subject.
    pub async fn send_action_mail(
        &self,
        action: TokenAction,
        uid: &str,
        to: &str,
        extra: &[(&str, &str)],
        key_salt: &str,
    ) -> Result<bool> {
        let Some(sender) = &self.email_sender else {
            debug!(action = %action, "no email sender configured, skipping mail");
            return Ok(false);
        };
        let mut mail = self
            .config
            .action_emails
            .get(action.as_str())
            .cloned()
            .unwrap_or_else(|| default_action_email(action));
        if mail.subject.is_empty() {
            return Ok(false);
        }
        let token = self.codec.create_action_token(
            uid,
            action,
            extra,
            SystemTime::now() + self.config.timeouts.email_token,
            key_salt,
        )?;
        mail.replace_link(&self.action_link(action, &token));
        sender
            .send_email(to, &mail.subject, &mail.text_body(), &mail.html_body())
            .await
            .with_context(|| format!("failed to send {action} mail"))?;
        Ok(true)
    }

    /// Link carried in an action mail. Email-update confirmations land on
    /// the account page; everything else goes through login.
    fn action_link(&self, action: TokenAction, token: &str) -> String {
        let path = match action {
            TokenAction::EmailUpdate => &self.config.account_path,
            _ => &self.config.login_path,
        };
        format!(
            "{}{}{path}?a={action}&t={token}",
            self.config.app_url, self.config.base_path
        )
    }

    /// Authenticates a request by its access token (bearer header, or the
    /// access cookie when one is configured).
    pub fn authorized(&self, headers: &HeaderMap) -> Result<Auth, ApiError> {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::to_string);
        let token = match bearer {
            Some(token) => token,
            None => self
                .config
                .access_cookie
                .as_deref()
                .and_then(|name| cookie_value(headers, name))
                .ok_or(ApiError::Unauthorized)?,
        };
        let claims = self
            .codec
            .verify(&token, "")
            .map_err(|_| ApiError::Unauthorized)?;
        let uid = claims.string("sub").ok_or(ApiError::Unauthorized)?;
        let grants = claims.get("grants").ok_or(ApiError::Unauthorized)?;
        Ok(Auth {
            uid: uid.to_string(),
            grants: grants.clone(),
        })
    }

    /// `Set-Cookie` value for the refresh token, scoped to the refresh
    /// endpoint so it never rides along on other requests.
    pub(crate) fn refresh_cookie(&self, name: &str, token: &str, ttl: Duration) -> String {
        self.cookie(
            name,
            token,
            &format!("{}{}", self.config.base_path, self.config.refresh_path),
            ttl,
        )
    }

    pub(crate) fn access_cookie(&self, name: &str, token: &str, ttl: Duration) -> String {
        self.cookie(name, token, "/", ttl)
    }

    /// Expired variant used on logout.
    pub(crate) fn clear_cookie(&self, name: &str, path: &str) -> String {
        self.cookie(name, "", path, Duration::ZERO)
    }

    fn cookie(&self, name: &str, value: &str, path: &str, ttl: Duration) -> String {
        let secure = if self.config.secure_cookies {
            "; Secure"
        } else {
            ""
        };
        format!(
            "{name}={value}; Path={path}; Max-Age={}; HttpOnly; SameSite=Strict{secure}",
            ttl.as_secs()
        )
    }
}

/// Reads one cookie out of the `Cookie` request header.
pub(crate) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())?
        .split(';')
        .filter_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then(|| value.to_string())
        })
        .next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::IdentityError;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use serde::Deserialize;
    use serde_json::json;

    struct NoIdentities;

    #[async_trait]
    impl IdentityProvider for NoIdentities {
        async fn identity_uid(&self, _id: &str) -> Result<String, IdentityError> {
            Err(IdentityError::NotFound)
        }

        async fn identity_load(&self, _uid: &str) -> Result<IdentityRecord, IdentityError> {
            Err(IdentityError::NotFound)
        }

        async fn identity_save(&self, _record: &IdentityRecord) -> Result<String, IdentityError> {
            Err(IdentityError::Other(anyhow::anyhow!("read only")))
        }
    }

    fn gate() -> AuthGate {
        AuthGate::new(
            AuthConfig::new("Demo", "https://demo.test", b"gate-secret"),
            Arc::new(NoIdentities),
            Collaborators::default(),
        )
        .unwrap()
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let result = AuthGate::new(
            AuthConfig::new("", "https://demo.test", b"gate-secret"),
            Arc::new(NoIdentities),
            Collaborators::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn authorized_accepts_bearer_token() {
        let gate = gate();
        let token = gate
            .codec
            .create_access_token(
                "u1",
                &json!("access"),
                SystemTime::now() + Duration::from_secs(60),
            )
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        let auth = gate.authorized(&headers).unwrap();
        assert_eq!(auth.uid, "u1");
        assert_eq!(auth.grants, json!("access"));
    }

    #[test]
    fn authorized_rejects_missing_and_garbage_tokens() {
        let gate = gate();
        assert!(matches!(
            gate.authorized(&HeaderMap::new()),
            Err(ApiError::Unauthorized)
        ));
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer junk"),
        );
        assert!(matches!(
            gate.authorized(&headers),
            Err(ApiError::Unauthorized)
        ));
    }

    #[test]
    fn auth_load_deserializes_custom_grants() {
        #[derive(Deserialize)]
        struct Grants {
            owner: bool,
        }
        let auth = Auth {
            uid: "u1".to_string(),
            grants: json!({"owner": true}),
        };
        let grants: Grants = auth.load().unwrap();
        assert!(grants.owner);
    }

    #[test]
    fn second_factor_consumes_a_recovery_code_once() {
        let gate = gate();
        let code = "abcd012345";
        let hash = password::hash_password(code).unwrap();
        let other = password::hash_password("zzzz999999").unwrap();
        let mut record = IdentityRecord::default();
        record.set(FIELD_TOTP_SECRET, "JBSWY3DPEHPK3PXP");
        record.set(FIELD_RECOVERY_CODES, format!("{hash}|{other}"));

        let consumed = gate.check_second_factor(&mut record, code).unwrap();
        assert!(consumed);
        assert_eq!(record.get(FIELD_RECOVERY_CODES), other);

        // A second submission of the same code no longer matches.
        assert!(gate.check_second_factor(&mut record, code).is_err());
    }

    #[test]
    fn cookie_round_trip() {
        let gate = gate();
        let set = gate.refresh_cookie("rtoken", "tok123", Duration::from_secs(60));
        assert!(set.starts_with("rtoken=tok123; Path=/auth/refresh;"));
        assert!(set.contains("HttpOnly"));
        assert!(set.contains("SameSite=Strict"));

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("other=1; rtoken=tok123"),
        );
        assert_eq!(cookie_value(&headers, "rtoken").as_deref(), Some("tok123"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }
}
