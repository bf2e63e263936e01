use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use utoipa::ToSchema;

use crate::cache::RateLimitError;
use crate::config::required_password;
use crate::error::ApiError;
use crate::gate::AuthGate;
use crate::password;
use crate::provider::{FIELD_ACTIVE, IdentityError};
use crate::token::TokenAction;
use crate::totp;

#[derive(Serialize, ToSchema)]
pub struct TotpKeyResponse {
    pub secret: String,
    pub url: String,
}

/// Side-channel operations multiplexed on the `action` field: email
/// verification, password reset, email-change confirmation, and 2FA
/// enrollment material.
#[utoipa::path(
    post,
    path = "/action",
    responses(
        (status = 200, description = "Action performed"),
        (status = 400, description = "Validation failed or unknown action"),
        (status = 401, description = "Action requires an access token"),
        (status = 403, description = "Invalid, expired, or replayed action token"),
        (status = 404, description = "Identity no longer exists"),
    ),
    tag = "auth"
)]
pub async fn action(
    gate: Extension<Arc<AuthGate>>,
    headers: HeaderMap,
    payload: Option<Json<HashMap<String, String>>>,
) -> Result<Response, ApiError> {
    let Some(Json(data)) = payload else {
        return Err(ApiError::field("payload", "required"));
    };
    let name = data.get("action").map_or("", String::as_str);
    match name {
        "verify" => verify(&gate, &data).await,
        "resetlink" => reset_link(&gate, &data).await,
        "reset" => reset(&gate, &data).await,
        "confirmemail" => confirm_email(&gate, &data).await,
        "emailupdate" => email_update(&gate, &headers, &data).await,
        "newTotpKey" if !gate.config().disable_2fa => new_totp_key(&gate, &headers, &data).await,
        "newRecovery" if !gate.config().disable_recovery => new_recovery(&gate, &headers),
        _ => Err(ApiError::field("action", "unknown action")),
    }
}

/// Activates the identity named by a `verify` token. A second click on the
/// same link finds the account already active and is rejected.
async fn verify(gate: &AuthGate, data: &HashMap<String, String>) -> Result<Response, ApiError> {
    let token = data.get("token").ok_or(ApiError::Forbidden)?;
    let claims = gate.codec.verify(token, "")?;
    if claims.string("act") != Some(TokenAction::Verify.as_str()) {
        return Err(ApiError::Forbidden);
    }
    let uid = claims.string("uid").ok_or(ApiError::Forbidden)?;
    let mut record = gate.provider.identity_load(uid).await.map_err(|err| match err {
        IdentityError::NotFound => ApiError::NotFound,
        err => err.into(),
    })?;
    if record.flag(FIELD_ACTIVE) {
        return Err(ApiError::Forbidden);
    }
    record.set_flag(FIELD_ACTIVE, true);
    gate.provider.identity_save(&record).await?;
    Ok(StatusCode::OK.into_response())
}

/// Mails a password-reset link. Always answers 200 so the endpoint cannot
/// be used to probe which addresses exist.
async fn reset_link(gate: &AuthGate, data: &HashMap<String, String>) -> Result<Response, ApiError> {
    let config = gate.config();
    let identity_field = &config.identity_field;
    let identity = data.get(identity_field).map_or("", String::as_str);
    if identity.is_empty() {
        return Err(ApiError::field(identity_field, "required"));
    }
    rate_field_guard(gate, "resetlink", identity, identity_field)?;
    match gate.provider.identity_uid(identity).await {
        Ok(uid) => {
            let record = gate.provider.identity_load(&uid).await?;
            let salt = config
                .password_field
                .as_deref()
                .map_or("", |field| record.get(field))
                .to_string();
            let email = record.get(&config.email_field).to_string();
            gate.send_action_mail(TokenAction::Reset, &uid, &email, &[], &salt)
                .await?;
        }
        Err(IdentityError::NotFound | IdentityError::NotActive { .. }) => {
            debug!("reset link requested for unknown or inactive identity");
        }
        Err(err) => return Err(err.into()),
    }
    Ok(StatusCode::OK.into_response())
}

/// Applies a password reset. The token was signed with the password hash
/// current at issue time, so completing one reset (or any password change)
/// invalidates every outstanding reset link.
async fn reset(gate: &AuthGate, data: &HashMap<String, String>) -> Result<Response, ApiError> {
    let config = gate.config();
    let Some(password_field) = config.password_field.clone() else {
        return Err(ApiError::field("action", "unknown action"));
    };
    if let Err(message) = required_password(&password_field, data) {
        return Err(ApiError::field(&password_field, &message));
    }
    let new_password = data.get(&password_field).map_or("", String::as_str).to_string();
    let confirm_field = format!("{password_field}_confirm");
    if let Some(confirm) = data.get(&confirm_field) {
        if *confirm != new_password {
            return Err(ApiError::field(&confirm_field, "passwords do not match"));
        }
    }

    let token = data.get("token").ok_or(ApiError::Forbidden)?;
    let unverified = gate.codec.unverified_claims(token)?;
    if unverified.string("act") != Some(TokenAction::Reset.as_str()) {
        return Err(ApiError::Forbidden);
    }
    let uid = unverified.string("uid").ok_or(ApiError::Forbidden)?.to_string();
    rate_field_guard(gate, "resetlink", &uid, &password_field)?;

    let mut record = gate.provider.identity_load(&uid).await.map_err(|err| match err {
        IdentityError::NotFound => ApiError::Forbidden,
        err => err.into(),
    })?;
    let claims = gate.codec.verify(token, record.get(&password_field))?;
    if claims.string("uid") != Some(uid.as_str()) {
        return Err(ApiError::Forbidden);
    }

    record.set(&password_field, password::hash_password(&new_password)?);
    gate.provider.identity_save(&record).await?;
    Ok(StatusCode::OK.into_response())
}

/// Re-sends the verification mail for a not-yet-active identity. Like
/// `resetlink`, the answer never reveals whether the identity exists.
async fn confirm_email(
    gate: &AuthGate,
    data: &HashMap<String, String>,
) -> Result<Response, ApiError> {
    let config = gate.config();
    let identity_field = &config.identity_field;
    let identity = data.get(identity_field).map_or("", String::as_str);
    if identity.is_empty() {
        return Err(ApiError::field(identity_field, "required"));
    }
    rate_field_guard(gate, "confirmemail", identity, identity_field)?;
    let uid = match gate.provider.identity_uid(identity).await {
        Ok(uid) => Some(uid),
        Err(IdentityError::NotActive { uid }) => Some(uid),
        Err(IdentityError::NotFound) => None,
        Err(err) => return Err(err.into()),
    };
    if let Some(uid) = uid {
        let record = gate.provider.identity_load(&uid).await?;
        let email = record.get(&config.email_field).to_string();
        gate.send_action_mail(TokenAction::Verify, &uid, &email, &[], "")
            .await?;
    }
    Ok(StatusCode::OK.into_response())
}

/// Applies a staged email change. Requires both a live access token and the
/// emailupdate token mailed to the new address.
async fn email_update(
    gate: &AuthGate,
    headers: &HeaderMap,
    data: &HashMap<String, String>,
) -> Result<Response, ApiError> {
    let auth = gate.authorized(headers)?;
    let token = data.get("token").ok_or(ApiError::Forbidden)?;
    let claims = gate.codec.verify(token, "")?;
    if claims.string("act") != Some(TokenAction::EmailUpdate.as_str())
        || claims.string("uid") != Some(auth.uid.as_str())
    {
        return Err(ApiError::Forbidden);
    }
    let new_email = claims.string("email").ok_or(ApiError::Forbidden)?.to_string();

    let config = gate.config();
    let mut record = gate.provider.identity_load(&auth.uid).await?;
    if record.get(&config.email_field) == new_email {
        // Already applied; the link is single-use by effect.
        return Err(ApiError::Forbidden);
    }
    record.set(&config.email_field, new_email);
    gate.provider.identity_save(&record).await?;
    Ok(StatusCode::OK.into_response())
}

/// Fresh TOTP enrollment material. Nothing is persisted until the account
/// settings are saved with a code proving possession.
async fn new_totp_key(
    gate: &AuthGate,
    headers: &HeaderMap,
    data: &HashMap<String, String>,
) -> Result<Response, ApiError> {
    let auth = gate.authorized(headers)?;
    let config = gate.config();
    let record = gate.provider.identity_load(&auth.uid).await?;
    let issuer = data
        .get("issuer")
        .filter(|issuer| !issuer.is_empty())
        .map_or(config.app_name.as_str(), String::as_str);
    let account = match record.get(&config.email_field) {
        "" => auth.uid.as_str(),
        email => email,
    };
    let key = totp::generate_totp_key(issuer, account)?;
    Ok(Json(TotpKeyResponse {
        secret: key.secret_base32,
        url: key.url,
    })
    .into_response())
}

/// Fresh batch of one-time recovery codes; persisted only when the account
/// settings are saved.
fn new_recovery(gate: &AuthGate, headers: &HeaderMap) -> Result<Response, ApiError> {
    gate.authorized(headers)?;
    Ok(Json(json!(gate.new_recovery_codes())).into_response())
}

/// Rate trips outside registration surface as field-scoped validation, not
/// a bare 429.
fn rate_field_guard(
    gate: &AuthGate,
    prefix: &str,
    key: &str,
    field: &str,
) -> Result<(), ApiError> {
    let rate = match prefix {
        "confirmemail" => gate.config().rate_limits.confirm_email,
        _ => gate.config().rate_limits.reset_link,
    };
    gate.rate_guard(prefix, key, rate).map_err(|err| match err {
        RateLimitError::Exceeded { .. } => ApiError::field(field, "try again later"),
        RateLimitError::Backend(err) => ApiError::Internal(err),
    })
}
