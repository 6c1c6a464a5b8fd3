use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use livechat_core::auth::AuthError;
use livechat_core::AppState;
use livechat_models::role::Role;

use crate::error::ApiError;

/// Bearer-authenticated caller. The role comes from the stored account so a
/// stale token cannot carry a role the user no longer has.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser {
    pub user_id: i64,
    pub role: Role,
}

impl AuthUser {
    pub fn require_role(&self, allowed: &[Role]) -> Result<(), ApiError> {
        if allowed.contains(&self.role) {
            Ok(())
        } else {
            Err(ApiError::forbidden(format!("Forbidden for role: {}", self.role)))
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| ApiError::Unauthorized("No token provided".into()))?;

        let claims = livechat_core::auth::validate_token(token, &state.config.jwt_secret)
            .map_err(|e| match e {
                AuthError::TokenExpired => ApiError::Unauthorized("Token expired".into()),
                _ => ApiError::Unauthorized("Invalid token".into()),
            })?;

        let user = livechat_db::users::get_user_by_id(&state.db, claims.sub)
            .await?
            .ok_or_else(|| ApiError::Unauthorized("User not found".into()))?;

        Ok(AuthUser {
            user_id: user.id,
            role: user.role,
        })
    }
}
