//! Gate configuration: fields, paths, limits, lifetimes, branding.

use anyhow::{Result, bail};
use regex::Regex;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use crate::email::ActionEmail;
use crate::provider::RESERVED_FIELDS;
use crate::token::TokenAction;

const DEFAULT_LOGIN_RATE: Rate = Rate {
    rate: 10,
    window: Duration::from_secs(60 * 60),
};
const DEFAULT_REGISTER_RATE: Rate = Rate {
    rate: 5,
    window: Duration::from_secs(60 * 60),
};
const DEFAULT_RESET_LINK_RATE: Rate = Rate {
    rate: 5,
    window: Duration::from_secs(60 * 60),
};
const DEFAULT_CONFIRM_EMAIL_RATE: Rate = Rate {
    rate: 5,
    window: Duration::from_secs(60 * 60),
};

const DEFAULT_REFRESH_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_REFRESH_TOKEN_REMEMBER_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const DEFAULT_ACCESS_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_EMAIL_TOKEN_TTL: Duration = Duration::from_secs(30 * 60);

/// Validator for a single submitted field. Returns a user-facing message on
/// failure.
pub type FieldValidator = fn(&str, &HashMap<String, String>) -> Result<(), String>;

/// A host-declared account field, shown at registration unless
/// `register_only` is cleared via [`AccountField::account_only`].
#[derive(Clone)]
pub struct AccountField {
    pub id: String,
    pub label: String,
    pub validator: Option<FieldValidator>,
    /// When false the field only appears in account settings, not at
    /// registration.
    pub in_register: bool,
}

impl AccountField {
    #[must_use]
    pub fn new(id: &str, label: &str, validator: Option<FieldValidator>) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            validator,
            in_register: true,
        }
    }

    /// Excludes the field from the registration form.
    #[must_use]
    pub fn account_only(mut self) -> Self {
        self.in_register = false;
        self
    }
}

/// Events per window; the limiter rejects once `rate` is exceeded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rate {
    pub rate: u32,
    pub window: Duration,
}

/// Per-flow rate limits.
#[derive(Clone, Copy, Debug)]
pub struct RateLimits {
    pub login: Rate,
    pub register: Rate,
    pub reset_link: Rate,
    pub confirm_email: Rate,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            login: DEFAULT_LOGIN_RATE,
            register: DEFAULT_REGISTER_RATE,
            reset_link: DEFAULT_RESET_LINK_RATE,
            confirm_email: DEFAULT_CONFIRM_EMAIL_RATE,
        }
    }
}

/// Token lifetimes.
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    pub refresh_token: Duration,
    /// Used instead of `refresh_token` when the login sets `remember`.
    pub refresh_token_remember: Duration,
    pub access_token: Duration,
    pub email_token: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            refresh_token: DEFAULT_REFRESH_TOKEN_TTL,
            refresh_token_remember: DEFAULT_REFRESH_TOKEN_REMEMBER_TTL,
            access_token: DEFAULT_ACCESS_TOKEN_TTL,
            email_token: DEFAULT_EMAIL_TOKEN_TTL,
        }
    }
}

/// Full gate configuration. Built with chained `with_*` setters and checked
/// once by [`AuthConfig::validate`] when the gate is constructed.
#[derive(Clone)]
pub struct AuthConfig {
    pub app_name: String,
    pub app_url: String,
    pub(crate) signing_key: Vec<u8>,

    pub identity_field: String,
    pub email_field: String,
    /// `None` enables passwordless link login.
    pub password_field: Option<String>,
    pub account_fields: Vec<AccountField>,

    pub base_path: String,
    pub login_path: String,
    pub register_path: String,
    pub refresh_path: String,
    pub account_path: String,
    /// Registration requires `terms` consent when set.
    pub terms_url: Option<String>,

    /// Refresh-token cookie name; `None` disables the cookie.
    pub refresh_cookie: Option<String>,
    /// Optional access-token cookie set on refresh.
    pub access_cookie: Option<String>,
    pub secure_cookies: bool,

    pub disable_2fa: bool,
    /// Disables one-time recovery-code issuance.
    pub disable_recovery: bool,
    pub rate_limits: RateLimits,
    pub timeouts: Timeouts,
    pub(crate) action_emails: HashMap<&'static str, ActionEmail>,
}

impl AuthConfig {
    /// Password-mode defaults: email identity plus a strength-checked
    /// password field.
    #[must_use]
    pub fn new(app_name: &str, app_url: &str, signing_key: &[u8]) -> Self {
        Self {
            app_name: app_name.to_string(),
            app_url: app_url.to_string(),
            signing_key: signing_key.to_vec(),
            identity_field: "email".to_string(),
            email_field: "email".to_string(),
            password_field: Some("password".to_string()),
            account_fields: vec![
                AccountField::new("email", "Email", Some(required_email)),
                AccountField::new("password", "Password", Some(required_password)),
            ],
            base_path: "/auth".to_string(),
            login_path: "/login".to_string(),
            register_path: "/register".to_string(),
            refresh_path: "/refresh".to_string(),
            account_path: "/account".to_string(),
            terms_url: None,
            refresh_cookie: Some("rtoken".to_string()),
            access_cookie: None,
            secure_cookies: true,
            disable_2fa: false,
            disable_recovery: false,
            rate_limits: RateLimits::default(),
            timeouts: Timeouts::default(),
            action_emails: HashMap::new(),
        }
    }

    /// Passwordless defaults: a submitted email receives a single-use login
    /// link; no password field, no separate registration.
    #[must_use]
    pub fn passwordless(app_name: &str, app_url: &str, signing_key: &[u8]) -> Self {
        let mut config = Self::new(app_name, app_url, signing_key);
        config.password_field = None;
        config.account_fields = vec![AccountField::new("email", "Email", Some(required_email))];
        config
    }

    #[must_use]
    pub fn with_account_field(mut self, field: AccountField) -> Self {
        self.account_fields.push(field);
        self
    }

    #[must_use]
    pub fn with_base_path(mut self, path: &str) -> Self {
        self.base_path = format!("/{}", path.trim_matches('/'));
        self
    }

    #[must_use]
    pub fn with_terms_url(mut self, url: &str) -> Self {
        self.terms_url = Some(url.to_string());
        self
    }

    #[must_use]
    pub fn with_refresh_cookie(mut self, name: Option<&str>) -> Self {
        self.refresh_cookie = name.map(str::to_string);
        self
    }

    #[must_use]
    pub fn with_access_cookie(mut self, name: Option<&str>) -> Self {
        self.access_cookie = name.map(str::to_string);
        self
    }

    /// Cleartext cookies for local development only.
    #[must_use]
    pub fn with_insecure_cookies(mut self) -> Self {
        self.secure_cookies = false;
        self
    }

    #[must_use]
    pub fn with_disable_2fa(mut self) -> Self {
        self.disable_2fa = true;
        self
    }

    #[must_use]
    pub fn with_disable_recovery(mut self) -> Self {
        self.disable_recovery = true;
        self
    }

    #[must_use]
    pub fn with_rate_limits(mut self, limits: RateLimits) -> Self {
        self.rate_limits = limits;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Overrides the subject/body of one action's mail.
    #[must_use]
    pub fn with_action_email(mut self, action: TokenAction, email: ActionEmail) -> Self {
        self.action_emails.insert(action.as_str(), email);
        self
    }

    pub(crate) fn field(&self, id: &str) -> Option<&AccountField> {
        self.account_fields.iter().find(|field| field.id == id)
    }

    pub(crate) fn register_fields(&self) -> impl Iterator<Item = &AccountField> {
        self.account_fields.iter().filter(|field| field.in_register)
    }

    /// Construction-time invariants; failures here are host configuration
    /// bugs, not runtime conditions.
    pub fn validate(&self) -> Result<()> {
        if self.app_name.is_empty() {
            bail!("app_name is required");
        }
        Url::parse(&self.app_url).map_err(|err| anyhow::anyhow!("invalid app_url: {err}"))?;
        if self.signing_key.is_empty() {
            bail!("signing key is required");
        }
        let id_re = Regex::new(r"^\w+$").map_err(|err| anyhow::anyhow!("{err}"))?;
        for field in &self.account_fields {
            if !id_re.is_match(&field.id) {
                bail!("invalid field id {:?}: must be alphanumeric/_", field.id);
            }
            if RESERVED_FIELDS.contains(&field.id.as_str()) {
                bail!("field {:?} is built-in and cannot be declared", field.id);
            }
        }
        if self.field(&self.identity_field).is_none() {
            bail!("identity field {:?} not found in account fields", self.identity_field);
        }
        if !self.email_field.is_empty() && self.field(&self.email_field).is_none() {
            bail!("email field {:?} not found in account fields", self.email_field);
        }
        match &self.password_field {
            Some(field) => {
                if self.field(field).is_none() {
                    bail!("password field {field:?} not found in account fields");
                }
            }
            None => {
                // Link login delivers the identity by mail, so identity and
                // email must be the same field.
                if self.identity_field != self.email_field {
                    bail!("passwordless mode requires identity field == email field");
                }
            }
        }
        Ok(())
    }
}

/// Requires a syntactically plausible email address.
pub fn required_email(id: &str, data: &HashMap<String, String>) -> Result<(), String> {
    let value = data.get(id).map_or("", String::as_str);
    let valid = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")
        .is_ok_and(|regex| regex.is_match(value.trim()));
    if valid {
        Ok(())
    } else {
        Err("enter a valid email".to_string())
    }
}

/// Requires a non-empty value of at most 100 characters.
pub fn required_text(id: &str, data: &HashMap<String, String>) -> Result<(), String> {
    let value = data.get(id).map_or("", String::as_str);
    if value.is_empty() {
        return Err("required".to_string());
    }
    if value.chars().count() > 100 {
        return Err("too long".to_string());
    }
    Ok(())
}

/// Requires at least 7 characters with upper/lower case, a digit, and a
/// special character.
pub fn required_password(id: &str, data: &HashMap<String, String>) -> Result<(), String> {
    let value = data.get(id).map_or("", String::as_str);
    if value.is_empty() {
        return Err("required".to_string());
    }
    if value.chars().count() < 7 {
        return Err("must be 7 characters".to_string());
    }
    if !value.chars().any(char::is_uppercase) {
        return Err("must have upper case".to_string());
    }
    if !value.chars().any(char::is_lowercase) {
        return Err("must have lower case".to_string());
    }
    if !value.chars().any(char::is_numeric) {
        return Err("must have number".to_string());
    }
    if value.chars().all(char::is_alphanumeric) {
        return Err("must have special characters".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthConfig {
        AuthConfig::new("Demo", "https://demo.test", b"secret")
    }

    #[test]
    fn defaults_validate() {
        config().validate().unwrap();
        AuthConfig::passwordless("Demo", "https://demo.test", b"secret")
            .validate()
            .unwrap();
    }

    #[test]
    fn reserved_field_is_rejected() {
        let config = config().with_account_field(AccountField::new("active", "Active", None));
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("built-in"), "unexpected error: {err}");
    }

    #[test]
    fn invalid_field_id_is_rejected() {
        let config = config().with_account_field(AccountField::new("bad id", "Bad", None));
        assert!(config.validate().is_err());
    }

    #[test]
    fn passwordless_requires_matching_identity_and_email_fields() {
        let mut config = AuthConfig::passwordless("Demo", "https://demo.test", b"secret");
        config.identity_field = "username".to_string();
        config.account_fields = vec![
            AccountField::new("email", "Email", Some(required_email)),
            AccountField::new("username", "Username", Some(required_text)),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_app_url_is_rejected() {
        let config = AuthConfig::new("Demo", "not a url", b"secret");
        assert!(config.validate().is_err());
    }

    #[test]
    fn required_email_checks_shape() {
        let mut data = HashMap::new();
        data.insert("email".to_string(), "a@example.com".to_string());
        assert!(required_email("email", &data).is_ok());
        data.insert("email".to_string(), "nope".to_string());
        assert!(required_email("email", &data).is_err());
        assert!(required_email("missing", &data).is_err());
    }

    #[test]
    fn required_password_enforces_strength() {
        let check = |pw: &str| {
            let mut data = HashMap::new();
            data.insert("password".to_string(), pw.to_string());
            required_password("password", &data)
        };
        assert!(check("P@ssw0rd").is_ok());
        assert_eq!(check("").unwrap_err(), "required");
        assert_eq!(check("P@s1").unwrap_err(), "must be 7 characters");
        assert_eq!(check("p@ssw0rd").unwrap_err(), "must have upper case");
        assert_eq!(check("P@SSW0RD").unwrap_err(), "must have lower case");
        assert_eq!(check("P@ssword").unwrap_err(), "must have number");
        assert_eq!(check("Passw0rd").unwrap_err(), "must have special characters");
    }
}
