use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use utoipa::ToSchema;

use super::{bool_field, str_field};
use crate::cache::RateLimitError;
use crate::error::ApiError;
use crate::gate::AuthGate;
use crate::password;
use crate::provider::{
    ClientInfo, FIELD_ACTIVE, FIELD_CODE, FIELD_REMEMBER, FIELD_TOTP_SECRET, IdentityError,
    IdentityRecord,
};
use crate::token::TokenAction;

#[derive(Serialize, ToSchema)]
pub struct LoginResponse {
    pub refresh_token: String,
}

/// Password or link login, depending on the configured mode.
#[utoipa::path(
    post,
    path = "/login",
    responses(
        (status = 200, description = "Login successful", body = LoginResponse, content_type = "application/json"),
        (status = 201, description = "Login link sent"),
        (status = 400, description = "Invalid credentials or missing fields"),
        (status = 403, description = "Invalid login token"),
    ),
    tag = "auth"
)]
pub async fn login(
    gate: Extension<Arc<AuthGate>>,
    headers: HeaderMap,
    payload: Option<Json<HashMap<String, Value>>>,
) -> Result<Response, ApiError> {
    let Some(Json(data)) = payload else {
        return Err(ApiError::field("payload", "required"));
    };
    let client = ClientInfo::from_headers(&headers);
    match &gate.config().password_field {
        Some(password_field) => {
            password_login(&gate, &client, &data, &password_field.clone()).await
        }
        None => link_login(&gate, &client, &data).await,
    }
}

async fn password_login(
    gate: &AuthGate,
    client: &ClientInfo,
    data: &HashMap<String, Value>,
    password_field: &str,
) -> Result<Response, ApiError> {
    let config = gate.config();
    let identity_field = config.identity_field.clone();
    let identity = str_field(data, &identity_field);
    let submitted_password = str_field(data, password_field);
    if identity.is_empty() {
        return Err(ApiError::field(&identity_field, "required"));
    }
    if submitted_password.is_empty() {
        return Err(ApiError::field(password_field, "required"));
    }

    gate.rate_guard("login", &identity, config.rate_limits.login)
        .map_err(|err| match err {
            RateLimitError::Exceeded { .. } => ApiError::field(&identity_field, "try again later"),
            RateLimitError::Backend(err) => ApiError::Internal(err),
        })?;

    let uid = match gate.provider.identity_uid(&identity).await {
        Ok(uid) => uid,
        Err(IdentityError::NotActive { .. }) => {
            return Err(ApiError::field(&identity_field, "inactive"));
        }
        // Unknown identity and wrong password must be indistinguishable.
        Err(IdentityError::NotFound) => {
            return Err(ApiError::field(password_field, "invalid"));
        }
        Err(err) => return Err(err.into()),
    };
    let mut record = gate.provider.identity_load(&uid).await?;
    if !password::verify_password(record.get(password_field), &submitted_password) {
        debug!(%uid, "password mismatch");
        return Err(ApiError::field(password_field, "invalid"));
    }

    if !config.disable_2fa && !record.get(FIELD_TOTP_SECRET).is_empty() {
        let code = str_field(data, FIELD_CODE);
        if code.is_empty() {
            return Err(ApiError::field(FIELD_CODE, "required"));
        }
        let consumed_recovery = gate.check_second_factor(&mut record, &code)?;
        if consumed_recovery {
            gate.provider.identity_save(&record).await?;
        }
    }

    issue(gate, &uid, &record, client, bool_field(data, FIELD_REMEMBER)).await
}

/// Passwordless mode: a plain identity submission mails a single-use login
/// link; a submitted token logs in (registering the identity on first use).
async fn link_login(
    gate: &AuthGate,
    client: &ClientInfo,
    data: &HashMap<String, Value>,
) -> Result<Response, ApiError> {
    let config = gate.config();
    let identity_field = config.identity_field.clone();
    let token = str_field(data, "token");
    if token.is_empty() {
        let identity = str_field(data, &identity_field);
        if let Some(field) = config.field(&identity_field) {
            if let Some(validator) = field.validator {
                let submitted = super::string_map(data);
                if let Err(message) = validator(&identity_field, &submitted) {
                    return Err(ApiError::field(&identity_field, &message));
                }
            }
        }
        gate.rate_guard("login", &identity, config.rate_limits.login)
            .map_err(|err| match err {
                RateLimitError::Exceeded { .. } => {
                    ApiError::field(&identity_field, "try again later")
                }
                RateLimitError::Backend(err) => ApiError::Internal(err),
            })?;
        let sent = gate
            .send_action_mail(TokenAction::Login, &identity, &identity, &[], "")
            .await?;
        return Ok((StatusCode::CREATED, Json(json!({ "sent": sent }))).into_response());
    }

    let claims = gate.codec.verify(&token, "")?;
    if claims.string("act") != Some(TokenAction::Login.as_str()) {
        return Err(ApiError::Forbidden);
    }
    let identity = claims.string("uid").ok_or(ApiError::Forbidden)?.to_string();
    let uid = match gate.provider.identity_uid(&identity).await {
        Ok(uid) => uid,
        Err(IdentityError::NotFound) => {
            // First login doubles as registration.
            let mut record = IdentityRecord::default();
            record.set(&identity_field, identity.clone());
            record.set_flag(FIELD_ACTIVE, true);
            gate.provider.identity_save(&record).await?
        }
        Err(err) => return Err(err.into()),
    };
    let record = gate.provider.identity_load(&uid).await?;
    issue(gate, &uid, &record, client, bool_field(data, FIELD_REMEMBER)).await
}

async fn issue(
    gate: &AuthGate,
    uid: &str,
    record: &IdentityRecord,
    client: &ClientInfo,
    remember: bool,
) -> Result<Response, ApiError> {
    let config = gate.config();
    let token = gate
        .issue_refresh_token(uid, record, client, remember)
        .await?;
    let mut response =
        Json(LoginResponse {
            refresh_token: token.clone(),
        })
        .into_response();
    if let Some(name) = &config.refresh_cookie {
        let ttl = if remember {
            config.timeouts.refresh_token_remember
        } else {
            config.timeouts.refresh_token
        };
        let cookie = gate.refresh_cookie(name, &token, ttl);
        response.headers_mut().append(
            header::SET_COOKIE,
            cookie
                .parse()
                .map_err(|_| ApiError::Internal(anyhow::anyhow!("invalid cookie value")))?,
        );
    }
    Ok(response)
}
