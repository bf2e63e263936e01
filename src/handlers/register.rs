use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use utoipa::ToSchema;

use super::{bool_field, str_field, string_map};
use crate::error::ApiError;
use crate::gate::AuthGate;
use crate::password;
use crate::provider::{ClientInfo, FIELD_TERMS, IdentityError, IdentityRecord};
use crate::token::TokenAction;

#[derive(Serialize, ToSchema)]
pub struct RegisterResponse {
    /// Whether a verification mail went out.
    pub sent: bool,
}

/// Creates an inactive identity and mails a verification link.
#[utoipa::path(
    post,
    path = "/register",
    responses(
        (status = 201, description = "Registered, verification mail sent", body = RegisterResponse, content_type = "application/json"),
        (status = 200, description = "Registered, no mail configured", body = RegisterResponse),
        (status = 400, description = "Validation failed"),
        (status = 429, description = "Too many registrations from this address"),
    ),
    tag = "auth"
)]
pub async fn register(
    gate: Extension<Arc<AuthGate>>,
    headers: HeaderMap,
    payload: Option<Json<HashMap<String, Value>>>,
) -> Result<Response, ApiError> {
    let Some(Json(data)) = payload else {
        return Err(ApiError::field("payload", "required"));
    };
    let config = gate.config();
    if config.password_field.is_none() {
        // Link login registers on first use; there is no separate signup.
        return Err(ApiError::NotFound);
    }

    let client = ClientInfo::from_headers(&headers);
    gate.rate_guard("register", &client.ip, config.rate_limits.register)?;

    let submitted = string_map(&data);
    let mut errors = HashMap::new();
    for field in config.register_fields() {
        if let Some(validator) = field.validator {
            if let Err(message) = validator(&field.id, &submitted) {
                errors.insert(field.id.clone(), message);
            }
        }
    }
    if config.terms_url.is_some() && !bool_field(&data, FIELD_TERMS) {
        errors.insert(FIELD_TERMS.to_string(), "required".to_string());
    }
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let identity = str_field(&data, &config.identity_field);
    match gate.provider.identity_uid(&identity).await {
        // An inactive duplicate is still a duplicate.
        Ok(_) | Err(IdentityError::NotActive { .. }) => {
            return Err(ApiError::field(&config.identity_field, "already registered"));
        }
        Err(IdentityError::NotFound) => {}
        Err(err) => return Err(err.into()),
    }

    let mut record = IdentityRecord::default();
    for field in config.register_fields() {
        if Some(&field.id) == config.password_field.as_ref() {
            continue;
        }
        record.set(&field.id, str_field(&data, &field.id));
    }
    if let Some(password_field) = &config.password_field {
        let hash = password::hash_password(&str_field(&data, password_field))?;
        record.set(password_field, hash);
    }
    let uid = gate.provider.identity_save(&record).await?;

    let email = record.get(&config.email_field).to_string();
    let sent = gate
        .send_action_mail(TokenAction::Verify, &uid, &email, &[], "")
        .await?;
    let status = if sent {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(RegisterResponse { sent })).into_response())
}
