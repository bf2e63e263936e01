use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;

use super::{str_field, string_map};
use crate::error::ApiError;
use crate::gate::AuthGate;
use crate::password;
use crate::provider::{
    FIELD_CODE, FIELD_RECOVERY_CODES, FIELD_TOTP_SECRET, IdentityRecord,
};
use crate::token::TokenAction;
use crate::totp;

#[derive(serde::Serialize, ToSchema)]
pub struct AccountResponse(pub HashMap<String, String>);

/// Declared account fields for the authenticated identity.
#[utoipa::path(
    get,
    path = "/account",
    responses(
        (status = 200, description = "Account fields", body = AccountResponse, content_type = "application/json"),
        (status = 401, description = "Missing or invalid access token"),
    ),
    tag = "auth"
)]
pub async fn account_show(
    gate: Extension<Arc<AuthGate>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let auth = gate.authorized(&headers)?;
    let record = gate.provider.identity_load(&auth.uid).await?;
    Ok(Json(AccountResponse(visible_fields(&gate, &record))).into_response())
}

/// Updates account fields. Password and second-factor settings get special
/// handling; an email change is only staged, pending confirmation through
/// the mailed link.
#[utoipa::path(
    post,
    path = "/account",
    responses(
        (status = 200, description = "Account updated", body = AccountResponse, content_type = "application/json"),
        (status = 201, description = "Updated; email change pending confirmation", body = AccountResponse),
        (status = 400, description = "Validation failed"),
        (status = 401, description = "Missing or invalid access token"),
    ),
    tag = "auth"
)]
pub async fn account_update(
    gate: Extension<Arc<AuthGate>>,
    headers: HeaderMap,
    payload: Option<Json<HashMap<String, Value>>>,
) -> Result<Response, ApiError> {
    let auth = gate.authorized(&headers)?;
    let Some(Json(data)) = payload else {
        return Err(ApiError::field("payload", "required"));
    };
    let config = gate.config();
    let mut record = gate.provider.identity_load(&auth.uid).await?;

    let submitted = string_map(&data);
    let mut errors = HashMap::new();
    for field in &config.account_fields {
        // Omitted fields keep their current value; an empty password
        // submission means "keep the current one".
        if !data.contains_key(&field.id) {
            continue;
        }
        let keep_password = Some(&field.id) == config.password_field.as_ref()
            && submitted.get(&field.id).map_or(true, String::is_empty);
        if keep_password {
            continue;
        }
        if let Some(validator) = field.validator {
            if let Err(message) = validator(&field.id, &submitted) {
                errors.insert(field.id.clone(), message);
            }
        }
    }
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    // Plain declared fields; password and email get dedicated handling below.
    for field in &config.account_fields {
        if Some(&field.id) == config.password_field.as_ref()
            || field.id == config.email_field
            || !data.contains_key(&field.id)
        {
            continue;
        }
        record.set(&field.id, str_field(&data, &field.id));
    }

    if let Some(password_field) = &config.password_field {
        let submitted_password = str_field(&data, password_field);
        if !submitted_password.is_empty() {
            record.set(password_field, password::hash_password(&submitted_password)?);
        }
    }

    if !config.disable_2fa {
        apply_second_factor(&mut record, &data)?;
    }

    // Email changes are staged: the new address only takes effect after its
    // owner clicks the confirmation link.
    let mut email_pending = false;
    let new_email = str_field(&data, &config.email_field);
    let current_email = record.get(&config.email_field).to_string();
    if data.contains_key(&config.email_field) && !new_email.is_empty() && new_email != current_email
    {
        gate.send_action_mail(
            TokenAction::EmailUpdate,
            &auth.uid,
            &new_email,
            &[("email", new_email.as_str())],
            "",
        )
        .await?;
        email_pending = true;
    }

    gate.provider.identity_save(&record).await?;
    let status = if email_pending {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(AccountResponse(visible_fields(&gate, &record)))).into_response())
}

/// Enabling TOTP requires a code proving possession of the new secret;
/// submitting an empty secret disables it and drops the recovery codes.
/// Submitted recovery codes arrive in plaintext and are stored hashed.
fn apply_second_factor(
    record: &mut IdentityRecord,
    data: &HashMap<String, Value>,
) -> Result<(), ApiError> {
    if data.contains_key(FIELD_TOTP_SECRET) {
        let secret = str_field(data, FIELD_TOTP_SECRET);
        if secret.is_empty() {
            record.set(FIELD_TOTP_SECRET, "");
            record.set(FIELD_RECOVERY_CODES, "");
        } else if secret != record.get(FIELD_TOTP_SECRET) {
            let code = str_field(data, FIELD_CODE);
            if !totp::verify_totp(&secret, &code) {
                return Err(ApiError::field(FIELD_CODE, "invalid"));
            }
            record.set(FIELD_TOTP_SECRET, secret);
        }
    }
    if let Some(Value::Array(codes)) = data.get(FIELD_RECOVERY_CODES) {
        let mut hashes = Vec::with_capacity(codes.len());
        for code in codes {
            let Some(code) = code.as_str() else {
                return Err(ApiError::field(FIELD_RECOVERY_CODES, "invalid"));
            };
            hashes.push(password::hash_password(code)?);
        }
        record.set(FIELD_RECOVERY_CODES, hashes.join("|"));
    }
    Ok(())
}

fn visible_fields(gate: &AuthGate, record: &IdentityRecord) -> HashMap<String, String> {
    gate.config()
        .account_fields
        .iter()
        .filter(|field| Some(&field.id) != gate.config().password_field.as_ref())
        .map(|field| (field.id.clone(), record.get(&field.id).to_string()))
        .collect()
}
