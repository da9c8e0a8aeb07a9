use axum::{
    Router,
    extract::{Json, State},
    http::{HeaderMap, header::AUTHORIZATION},
    response::IntoResponse,
    routing::post,
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use bcrypt::verify;
use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqliteConnection;

use crate::{
    config::Config,
    error::{ApiJson, ApiResult, forbidden, internal_error, unauthorized},
    models::{LoginUser, RefreshRequest, TokenPair, User},
    state::AppState,
};

const PASSWORD_RESET_HOURS: i64 = 24;
const EMAIL_VERIFICATION_DAYS: i64 = 3;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    pub token_type: String,
    /// Binds one-off tokens to the state they were issued against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fp: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
    PasswordReset,
    EmailVerification,
}

impl TokenKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
            Self::PasswordReset => "password_reset",
            Self::EmailVerification => "email_verification",
        }
    }
}

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/token/", post(obtain_token))
        .route("/token/refresh/", post(refresh_token))
}

async fn obtain_token(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<LoginUser>,
) -> ApiResult<impl IntoResponse> {
    let invalid = || unauthorized("No active account found with the given credentials");

    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
        .bind(input.username.trim())
        .fetch_optional(&state.pool)
        .await
        .map_err(internal_error)?
        .ok_or_else(invalid)?;

    let valid = verify(&input.password, &user.hashed_password).map_err(internal_error)?;
    if !valid || !user.is_active {
        return Err(invalid());
    }

    tracing::info!(user_id = user.id, "issued token pair");
    Ok(Json(issue_token_pair(&state.config, &user)?))
}

async fn refresh_token(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<RefreshRequest>,
) -> ApiResult<impl IntoResponse> {
    let claims = decode_token(&state.config, &input.refresh, TokenKind::Refresh)
        .ok_or_else(|| unauthorized("Token is invalid or expired"))?;

    let user = load_token_user(&state, &claims)
        .await?
        .ok_or_else(|| unauthorized("Token is invalid or expired"))?;

    Ok(Json(issue_token_pair(&state.config, &user)?))
}

pub fn issue_token(
    config: &Config,
    user_id: i64,
    kind: TokenKind,
    ttl: chrono::Duration,
    fingerprint: Option<String>,
) -> ApiResult<String> {
    let expiration = Utc::now()
        .checked_add_signed(ttl)
        .ok_or_else(|| internal_error("token expiry out of range"))?
        .timestamp() as usize;

    let claims = Claims {
        sub: user_id.to_string(),
        exp: expiration,
        token_type: kind.as_str().to_string(),
        fp: fingerprint,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.secret_key.as_bytes()),
    )
    .map_err(internal_error)
}

pub fn issue_token_pair(config: &Config, user: &User) -> ApiResult<TokenPair> {
    Ok(TokenPair {
        access: issue_token(config, user.id, TokenKind::Access, config.access_token_ttl, None)?,
        refresh: issue_token(config, user.id, TokenKind::Refresh, config.refresh_token_ttl, None)?,
    })
}

/// Valid, unexpired claims of the expected kind; anything else is `None`.
pub fn decode_token(config: &Config, token: &str, kind: TokenKind) -> Option<Claims> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.secret_key.as_bytes()),
        &Validation::default(),
    )
    .ok()?;

    (data.claims.token_type == kind.as_str()).then_some(data.claims)
}

fn fingerprint(value: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(value.as_bytes()))
}

pub fn encode_uid(user_id: i64) -> String {
    URL_SAFE_NO_PAD.encode(user_id.to_string())
}

pub fn decode_uid(uid: &str) -> Option<i64> {
    let bytes = URL_SAFE_NO_PAD.decode(uid).ok()?;
    String::from_utf8(bytes).ok()?.parse().ok()
}

/// Reset tokens die as soon as the password (and so its hash) changes.
pub fn password_reset_token(config: &Config, user: &User) -> ApiResult<String> {
    issue_token(
        config,
        user.id,
        TokenKind::PasswordReset,
        chrono::Duration::hours(PASSWORD_RESET_HOURS),
        Some(fingerprint(&user.hashed_password)),
    )
}

pub fn check_password_reset_token(config: &Config, user: &User, token: &str) -> bool {
    decode_token(config, token, TokenKind::PasswordReset).is_some_and(|claims| {
        claims.sub == user.id.to_string()
            && claims.fp.as_deref() == Some(fingerprint(&user.hashed_password).as_str())
    })
}

/// Verification tokens are tied to the address they were sent to.
pub fn email_verification_token(config: &Config, user: &User) -> ApiResult<String> {
    issue_token(
        config,
        user.id,
        TokenKind::EmailVerification,
        chrono::Duration::days(EMAIL_VERIFICATION_DAYS),
        Some(fingerprint(&user.email)),
    )
}

pub fn check_email_verification_token(config: &Config, user: &User, token: &str) -> bool {
    decode_token(config, token, TokenKind::EmailVerification).is_some_and(|claims| {
        claims.sub == user.id.to_string()
            && claims.fp.as_deref() == Some(fingerprint(&user.email).as_str())
    })
}

pub async fn find_user(conn: &mut SqliteConnection, user_id: i64) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(conn)
        .await
}

async fn load_token_user(state: &AppState, claims: &Claims) -> ApiResult<Option<User>> {
    let Ok(user_id) = claims.sub.parse::<i64>() else {
        return Ok(None);
    };
    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let user = find_user(&mut conn, user_id).await.map_err(internal_error)?;
    Ok(user.filter(|user| user.is_active))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

pub async fn extract_current_user(state: &AppState, headers: &HeaderMap) -> ApiResult<User> {
    let token = bearer_token(headers)
        .ok_or_else(|| unauthorized("Authentication credentials were not provided."))?;

    let claims = decode_token(&state.config, token, TokenKind::Access)
        .ok_or_else(|| unauthorized("Given token not valid for any token type"))?;

    load_token_user(state, &claims)
        .await?
        .ok_or_else(|| unauthorized("User not found"))
}

pub async fn extract_optional_user(state: &AppState, headers: &HeaderMap) -> ApiResult<Option<User>> {
    let Some(token) = bearer_token(headers) else {
        return Ok(None);
    };
    let Some(claims) = decode_token(&state.config, token, TokenKind::Access) else {
        return Ok(None);
    };
    load_token_user(state, &claims).await
}

pub async fn extract_admin_user(state: &AppState, headers: &HeaderMap) -> ApiResult<User> {
    let user = extract_current_user(state, headers).await?;
    if !user.is_admin() {
        return Err(forbidden("You do not have permission to perform this action."));
    }
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ROLE_USER;

    fn config() -> Config {
        Config {
            secret_key: "test-secret".to_string(),
            ..Config::default()
        }
    }

    fn user() -> User {
        User {
            id: 42,
            username: "ada".to_string(),
            email: "ada@example.org".to_string(),
            hashed_password: "$2b$04$abcdefghijklmnopqrstuu".to_string(),
            role: ROLE_USER.to_string(),
            email_verified: false,
            affiliation: String::new(),
            is_active: true,
            date_joined: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn refresh_token_is_not_an_access_token() {
        let config = config();
        let pair = issue_token_pair(&config, &user()).expect("pair");

        assert!(decode_token(&config, &pair.access, TokenKind::Access).is_some());
        assert!(decode_token(&config, &pair.refresh, TokenKind::Access).is_none());
        assert!(decode_token(&config, &pair.refresh, TokenKind::Refresh).is_some());
    }

    #[test]
    fn tokens_signed_with_another_secret_are_rejected() {
        let pair = issue_token_pair(&config(), &user()).expect("pair");
        let other = Config {
            secret_key: "other".to_string(),
            ..Config::default()
        };
        assert!(decode_token(&other, &pair.access, TokenKind::Access).is_none());
    }

    #[test]
    fn reset_token_dies_with_password_change() {
        let config = config();
        let mut user = user();
        let token = password_reset_token(&config, &user).expect("token");
        assert!(check_password_reset_token(&config, &user, &token));

        user.hashed_password = "$2b$04$zyxwvutsrqponmlkjihgff".to_string();
        assert!(!check_password_reset_token(&config, &user, &token));
    }

    #[test]
    fn verification_token_is_bound_to_email() {
        let config = config();
        let mut user = user();
        let token = email_verification_token(&config, &user).expect("token");
        assert!(check_email_verification_token(&config, &user, &token));
        assert!(!check_password_reset_token(&config, &user, &token));

        user.email = "ada@elsewhere.org".to_string();
        assert!(!check_email_verification_token(&config, &user, &token));
    }

    #[test]
    fn uid_round_trips_and_rejects_garbage() {
        assert_eq!(decode_uid(&encode_uid(17)), Some(17));
        assert_eq!(decode_uid("!!"), None);
    }
}
