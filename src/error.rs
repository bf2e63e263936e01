//! HTTP-facing error taxonomy.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::error;
use utoipa::ToSchema;

use crate::cache::RateLimitError;
use crate::provider::{AccessError, IdentityError};
use crate::token::TokenError;

/// Error body returned for every non-2xx response: a short code plus
/// optional field-scoped detail.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Field-scoped, user-fixable input failures. Always 400.
    #[error("validation failed")]
    Validation(HashMap<String, String>),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    /// Anything the caller cannot fix; detail is logged, never returned.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Single-field validation failure.
    #[must_use]
    pub fn field(field: &str, message: &str) -> Self {
        let mut data = HashMap::new();
        data.insert(field.to_string(), message.to_string());
        Self::Validation(data)
    }
}

impl From<IdentityError> for ApiError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::NotFound => Self::NotFound,
            IdentityError::NotActive { .. } => Self::Forbidden,
            IdentityError::Validation { field, message } => Self::field(&field, &message),
            IdentityError::Other(err) => Self::Internal(err),
        }
    }
}

impl From<RateLimitError> for ApiError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Exceeded { .. } => Self::RateLimited,
            RateLimitError::Backend(err) => Self::Internal(err),
        }
    }
}

impl From<TokenError> for ApiError {
    fn from(_: TokenError) -> Self {
        // Expired, forged, and malformed all read the same from outside.
        Self::Forbidden
    }
}

impl From<AccessError> for ApiError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::Denied => Self::Unauthorized,
            AccessError::Other(err) => Self::Internal(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Validation(fields) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    error: "validation".to_string(),
                    data: Some(json!(fields)),
                },
            ),
            Self::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                ErrorResponse {
                    error: "Try again later".to_string(),
                    data: None,
                },
            ),
            Self::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse {
                    error: "Unauthorized".to_string(),
                    data: None,
                },
            ),
            Self::Forbidden => (
                StatusCode::FORBIDDEN,
                ErrorResponse {
                    error: "Forbidden".to_string(),
                    data: None,
                },
            ),
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                ErrorResponse {
                    error: "Not Found".to_string(),
                    data: None,
                },
            ),
            Self::Internal(err) => {
                error!("internal error: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse {
                        error: "Internal Server Error".to_string(),
                        data: None,
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_400_with_field_data() {
        let response = ApiError::field("email", "enter a valid email").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn rate_limit_maps_to_429() {
        let err: ApiError = RateLimitError::Exceeded {
            rate: 10,
            window: std::time::Duration::from_secs(3600),
        }
        .into();
        assert_eq!(
            err.into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn token_errors_read_as_forbidden() {
        let err: ApiError = TokenError::Expired.into();
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn identity_not_found_maps_to_404() {
        let err: ApiError = IdentityError::NotFound.into();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }
}
