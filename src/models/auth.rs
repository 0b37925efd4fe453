use serde::{Deserialize, Serialize};

/// Access/refresh token pair for one authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// Coarse flags kept alongside the tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionFlags {
    pub email: Option<String>,
    pub is_superuser: bool,
}

/// Claims carried by backend-issued JWTs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    pub sub: String,
    /// Expiry in epoch seconds.
    pub exp: i64,
    #[serde(rename = "type", default)]
    pub token_type: Option<String>,
}

/// Response of `POST /api/auth/login`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub is_superuser: bool,
}

/// Response of `POST /api/auth/refresh`. The refresh token is not rotated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

/// Backend error body.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}
