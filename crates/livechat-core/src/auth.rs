use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use livechat_models::role::Role;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token expired")]
    TokenExpired,
    #[error("invalid token")]
    InvalidToken,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Access-token claims issued by the identity service.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(alias = "userId")]
    pub sub: i64,
    pub role: Role,
    pub exp: usize,
    pub iat: usize,
}

/// Authenticated caller attached to a connection or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub role: Role,
}

impl From<&Claims> for Identity {
    fn from(claims: &Claims) -> Self {
        Self {
            user_id: claims.sub,
            role: claims.role,
        }
    }
}

pub fn create_token(
    user_id: i64,
    role: Role,
    secret: &str,
    expiry_secs: u64,
) -> Result<String, AuthError> {
    let now = chrono::Utc::now().timestamp() as usize;
    let claims = Claims {
        sub: user_id,
        role,
        iat: now,
        exp: now + expiry_secs as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Internal(e.to_string()))
}

pub fn validate_token(token: &str, secret: &str) -> Result<Claims, AuthError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        _ => AuthError::InvalidToken,
    })
}

/// Verify a bearer credential and resolve the caller's identity.
pub fn authenticate(token: &str, secret: &str) -> Result<Identity, AuthError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::InvalidToken);
    }
    validate_token(token, secret).map(|claims| Identity::from(&claims))
}
