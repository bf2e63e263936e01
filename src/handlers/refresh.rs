use axum::{
    Json,
    extract::{Extension, Query},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::gate::{AuthGate, cookie_value};
use crate::provider::ClientInfo;

#[derive(Deserialize, ToSchema)]
pub struct RefreshRequest {
    /// The refresh token; `refresh_token` is accepted as an alias.
    #[serde(alias = "refresh_token")]
    pub token: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct AccessTokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
    pub scope: String,
}

/// Exchanges a refresh token for a short-lived access token; `DELETE` (or
/// `?logout=1`) revokes the refresh token's client id instead.
#[utoipa::path(
    post,
    path = "/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Access token issued", body = AccessTokenResponse, content_type = "application/json"),
        (status = 401, description = "Missing, invalid, or revoked refresh token"),
    ),
    tag = "auth"
)]
pub async fn refresh(
    gate: Extension<Arc<AuthGate>>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    payload: Option<Json<RefreshRequest>>,
) -> Result<Response, ApiError> {
    let config = gate.config();
    let body_token = payload.and_then(|Json(request)| request.token);
    let token = match body_token {
        Some(token) if !token.is_empty() => token,
        _ => config
            .refresh_cookie
            .as_deref()
            .and_then(|name| cookie_value(&headers, name))
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::Unauthorized)?,
    };

    let claims = gate
        .codec
        .verify(&token, "")
        .map_err(|_| ApiError::Unauthorized)?;
    let uid = claims.string("sub").ok_or(ApiError::Unauthorized)?.to_string();
    let cid = claims.string("cid").ok_or(ApiError::Unauthorized)?.to_string();

    if method == Method::DELETE || query.get("logout").is_some_and(|v| v == "1") {
        gate.refresh_tokens.revoke_client_id(&uid, &cid).await?;
        let mut response = StatusCode::OK.into_response();
        if let Some(name) = &config.refresh_cookie {
            let path = format!("{}{}", config.base_path, config.refresh_path);
            append_cookie(&mut response, &gate.clear_cookie(name, &path))?;
        }
        if let Some(name) = &config.access_cookie {
            append_cookie(&mut response, &gate.clear_cookie(name, "/"))?;
        }
        return Ok(response);
    }

    let client = ClientInfo::from_headers(&headers);
    let grants = gate.access_tokens.grants(&uid, &cid, &client).await?;
    let ttl = config.timeouts.access_token;
    let access_token = gate
        .codec
        .create_access_token(&uid, &grants, SystemTime::now() + ttl)?;
    let scope = match &grants {
        Value::String(scope) => scope.clone(),
        _ => String::new(),
    };
    let mut response = Json(AccessTokenResponse {
        access_token: access_token.clone(),
        token_type: "Bearer".to_string(),
        expires_in: ttl.as_secs(),
        scope,
    })
    .into_response();
    if let Some(name) = &config.access_cookie {
        append_cookie(&mut response, &gate.access_cookie(name, &access_token, ttl))?;
    }
    Ok(response)
}

fn append_cookie(response: &mut Response, cookie: &str) -> Result<(), ApiError> {
    response.headers_mut().append(
        header::SET_COOKIE,
        cookie
            .parse()
            .map_err(|_| ApiError::Internal(anyhow::anyhow!("invalid cookie value")))?,
    );
    Ok(())
}
