use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use parley_core::auth::Identity;
use parley_core::AppState;

use crate::error::ApiError;

/// Caller identity taken from the `Authorization: Bearer` header.
pub struct AuthUser {
    pub user_id: i64,
    pub username: String,
}

impl AuthUser {
    pub fn identity(&self) -> Identity {
        Identity {
            user_id: self.user_id,
            username: self.username.clone(),
        }
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::Unauthorized)?;

        let identity = state.identity.verify(token).map_err(|err| {
            tracing::debug!(error = %err, "rejected bearer token");
            ApiError::Unauthorized
        })?;

        Ok(AuthUser {
            user_id: identity.user_id,
            username: identity.username,
        })
    }
}
