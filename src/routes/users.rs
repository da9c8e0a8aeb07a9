use axum::{
    Router,
    extract::{Json, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
};
use bcrypt::hash;
use chrono::Utc;
use serde_json::{Value, json};

use crate::{
    error::{ApiJson, ApiResult, ValidationErrors, bad_request, internal_error, not_found},
    mail::{self, contact_email, password_reset_email, verification_email, welcome_email},
    models::{
        EmailRequest, PasswordResetConfirm, ROLE_ADMIN, ROLE_USER, RegisterUser, UpdateProfile,
        UpdateRole, User, UserResponse,
    },
    routes::auth::{
        check_email_verification_token, check_password_reset_token, decode_uid,
        email_verification_token, encode_uid, extract_admin_user, extract_current_user,
        find_user, password_reset_token,
    },
    state::AppState,
    validation::{
        is_valid_email, normalize_email, str_field, validate_contact_fields, validate_password,
        validate_username,
    },
};

const AFFILIATION_MAX: usize = 200;
const RESET_SENT: &str = "If an account exists with this email, a password reset link has been sent.";
const VERIFICATION_SENT: &str =
    "If an account exists with this email, a verification link has been sent.";

/// Mounted under `/api` alongside the token endpoints.
pub fn users_routes() -> Router<AppState> {
    Router::new()
        .route("/users/", get(list_users))
        .route("/users/register/", post(register))
        .route("/users/me/", get(me).patch(update_me))
        .route("/users/contact/", post(contact))
        .route("/users/password/reset/", post(request_password_reset))
        .route(
            "/users/password/reset/confirm/{uid}/{token}/",
            post(confirm_password_reset),
        )
        .route("/users/verify-email/{uid}/{token}/", get(verify_email))
        .route("/users/resend-verification/", post(resend_verification))
        .route("/users/{id}/", get(get_user))
        .route("/users/{id}/verify/", post(toggle_verified))
        .route("/users/{id}/role/", put(update_role))
}

async fn find_user_by_email(state: &AppState, email: &str) -> ApiResult<Option<User>> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ? AND is_active = TRUE")
        .bind(normalize_email(email))
        .fetch_optional(&state.pool)
        .await
        .map_err(internal_error)
}

async fn email_taken(state: &AppState, email: &str, except: Option<i64>) -> ApiResult<bool> {
    let taken: Option<(i64,)> = sqlx::query_as("SELECT id FROM users WHERE email = ? AND id != ?")
        .bind(email)
        .bind(except.unwrap_or(0))
        .fetch_optional(&state.pool)
        .await
        .map_err(internal_error)?;
    Ok(taken.is_some())
}

fn send_verification(state: &AppState, user: &User) -> ApiResult<()> {
    let token = email_verification_token(&state.config, user)?;
    let link = format!(
        "{}/verify-email/{}/{}",
        state.config.frontend_url.trim_end_matches('/'),
        encode_uid(user.id),
        token
    );
    mail::dispatch(
        &state.mailer,
        verification_email(&state.config, &user.email, &user.username, &link),
    );
    Ok(())
}

async fn register(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<RegisterUser>,
) -> ApiResult<impl IntoResponse> {
    let username = input.username.trim();
    let email = normalize_email(&input.email);
    let affiliation = input.affiliation.as_deref().unwrap_or_default().trim();

    let mut errors = ValidationErrors::new();
    validate_username(&mut errors, username);
    if email.is_empty() {
        errors.add("email", "This field is required.");
    } else if !is_valid_email(&email) {
        errors.add("email", "Enter a valid email address.");
    }
    validate_password(&mut errors, "password", &input.password);
    if input.password != input.password2 {
        errors.add("password", "Password fields didn't match.");
    }
    if affiliation.chars().count() > AFFILIATION_MAX {
        errors.add("affiliation", "Affiliation cannot exceed 200 characters.");
    }

    if !errors.has("username") {
        let taken: Option<(i64,)> = sqlx::query_as("SELECT id FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&state.pool)
            .await
            .map_err(internal_error)?;
        if taken.is_some() {
            errors.add("username", "A user with that username already exists.");
        }
    }
    if !errors.has("email") && email_taken(&state, &email, None).await? {
        errors.add("email", "A user with this email already exists.");
    }
    errors.into_result()?;

    let hashed = hash(&input.password, state.config.bcrypt_cost).map_err(internal_error)?;
    let user = sqlx::query_as::<_, User>(
        "INSERT INTO users (username, email, hashed_password, role, affiliation, date_joined) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING *",
    )
    .bind(username)
    .bind(&email)
    .bind(&hashed)
    .bind(ROLE_USER)
    .bind(affiliation)
    .bind(Utc::now())
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    mail::dispatch(
        &state.mailer,
        welcome_email(&state.config, &user.email, &user.username),
    );
    send_verification(&state, &user)?;

    tracing::info!(user_id = user.id, username = %user.username, "registered user");
    Ok((StatusCode::CREATED, Json(UserResponse::from(user))))
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<impl IntoResponse> {
    let user = extract_current_user(&state, &headers).await?;
    Ok(Json(UserResponse::from(user)))
}

async fn update_me(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(input): ApiJson<UpdateProfile>,
) -> ApiResult<impl IntoResponse> {
    let user = extract_current_user(&state, &headers).await?;

    let mut errors = ValidationErrors::new();
    let affiliation = input
        .affiliation
        .as_deref()
        .map(str::trim)
        .unwrap_or(&user.affiliation)
        .to_string();
    if affiliation.chars().count() > AFFILIATION_MAX {
        errors.add("affiliation", "Affiliation cannot exceed 200 characters.");
    }

    let email = input
        .email
        .as_deref()
        .map(normalize_email)
        .unwrap_or_else(|| user.email.clone());
    let email_changed = email != user.email;
    if email_changed {
        if !is_valid_email(&email) {
            errors.add("email", "Enter a valid email address.");
        } else if email_taken(&state, &email, Some(user.id)).await? {
            errors.add("email", "A user with this email already exists.");
        }
    }
    errors.into_result()?;

    let updated = sqlx::query_as::<_, User>(
        "UPDATE users SET email = ?, affiliation = ?, \
         email_verified = CASE WHEN ? THEN FALSE ELSE email_verified END, updated_at = ? \
         WHERE id = ? RETURNING *",
    )
    .bind(&email)
    .bind(&affiliation)
    .bind(email_changed)
    .bind(Utc::now())
    .bind(user.id)
    .fetch_one(&state.pool)
    .await
    .map_err(internal_error)?;

    if email_changed {
        tracing::info!(user_id = updated.id, "email changed, verification reset");
        send_verification(&state, &updated)?;
    }
    Ok(Json(UserResponse::from(updated)))
}

async fn list_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    extract_admin_user(&state, &headers).await?;

    let users = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY date_joined DESC, id DESC")
        .fetch_all(&state.pool)
        .await
        .map_err(internal_error)?;

    let responses: Vec<UserResponse> = users.into_iter().map(UserResponse::from).collect();
    Ok(Json(responses))
}

async fn load_user(state: &AppState, user_id: i64) -> ApiResult<User> {
    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    find_user(&mut conn, user_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("User not found"))
}

async fn get_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    extract_current_user(&state, &headers).await?;
    Ok(Json(UserResponse::from(load_user(&state, user_id).await?)))
}

async fn toggle_verified(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let admin = extract_admin_user(&state, &headers).await?;

    let updated = sqlx::query_as::<_, User>(
        "UPDATE users SET email_verified = NOT email_verified, updated_at = ? WHERE id = ? RETURNING *",
    )
    .bind(Utc::now())
    .bind(user_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or_else(|| not_found("User not found"))?;

    tracing::info!(
        user_id,
        admin_id = admin.id,
        email_verified = updated.email_verified,
        "toggled email verification"
    );
    Ok(Json(UserResponse::from(updated)))
}

async fn update_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
    ApiJson(input): ApiJson<UpdateRole>,
) -> ApiResult<impl IntoResponse> {
    let admin = extract_admin_user(&state, &headers).await?;

    let role = input.role.trim().to_lowercase();
    if role != ROLE_USER && role != ROLE_ADMIN {
        let mut errors = ValidationErrors::new();
        errors.add("role", format!("\"{}\" is not a valid choice.", input.role));
        return Err(errors.into_api_error());
    }

    let updated = sqlx::query_as::<_, User>(
        "UPDATE users SET role = ?, updated_at = ? WHERE id = ? RETURNING *",
    )
    .bind(&role)
    .bind(Utc::now())
    .bind(user_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or_else(|| not_found("User not found"))?;

    tracing::info!(user_id, admin_id = admin.id, role = %role, "changed user role");
    Ok(Json(UserResponse::from(updated)))
}

async fn request_password_reset(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<EmailRequest>,
) -> ApiResult<impl IntoResponse> {
    if input.email.trim().is_empty() {
        let mut errors = ValidationErrors::new();
        errors.add("email", "This field is required.");
        return Err(errors.into_api_error());
    }

    if let Some(user) = find_user_by_email(&state, &input.email).await? {
        let token = password_reset_token(&state.config, &user)?;
        let link = format!(
            "{}/reset-password/{}/{}",
            state.config.frontend_url.trim_end_matches('/'),
            encode_uid(user.id),
            token
        );
        mail::dispatch(
            &state.mailer,
            password_reset_email(&state.config, &user.email, &link),
        );
        tracing::info!(user_id = user.id, "password reset requested");
    }

    Ok(Json(json!({ "detail": RESET_SENT })))
}

async fn confirm_password_reset(
    State(state): State<AppState>,
    Path((uid, token)): Path<(String, String)>,
    ApiJson(input): ApiJson<PasswordResetConfirm>,
) -> ApiResult<impl IntoResponse> {
    let invalid = || bad_request("Invalid or expired reset link");

    let user_id = decode_uid(&uid).ok_or_else(invalid)?;
    let user = {
        let mut conn = state.pool.acquire().await.map_err(internal_error)?;
        find_user(&mut conn, user_id)
            .await
            .map_err(internal_error)?
            .filter(|user| user.is_active)
            .ok_or_else(invalid)?
    };
    if !check_password_reset_token(&state.config, &user, &token) {
        return Err(invalid());
    }

    let mut errors = ValidationErrors::new();
    validate_password(&mut errors, "new_password", &input.new_password);
    errors.into_result()?;

    let hashed = hash(&input.new_password, state.config.bcrypt_cost).map_err(internal_error)?;
    sqlx::query("UPDATE users SET hashed_password = ?, updated_at = ? WHERE id = ?")
        .bind(&hashed)
        .bind(Utc::now())
        .bind(user.id)
        .execute(&state.pool)
        .await
        .map_err(internal_error)?;

    tracing::info!(user_id = user.id, "password reset completed");
    Ok(Json(json!({ "detail": "Password has been reset successfully." })))
}

async fn verify_email(
    State(state): State<AppState>,
    Path((uid, token)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let invalid = || bad_request("Invalid or expired verification link");

    let user_id = decode_uid(&uid).ok_or_else(invalid)?;
    let user = load_user(&state, user_id).await.map_err(|_| invalid())?;
    if !check_email_verification_token(&state.config, &user, &token) {
        return Err(invalid());
    }

    if !user.email_verified {
        sqlx::query("UPDATE users SET email_verified = TRUE, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(user.id)
            .execute(&state.pool)
            .await
            .map_err(internal_error)?;
        tracing::info!(user_id = user.id, "email verified");
    }

    Ok(Json(json!({ "detail": "Email verified successfully." })))
}

async fn resend_verification(
    State(state): State<AppState>,
    ApiJson(input): ApiJson<EmailRequest>,
) -> ApiResult<impl IntoResponse> {
    if let Some(user) = find_user_by_email(&state, &input.email).await? {
        if !user.email_verified {
            send_verification(&state, &user)?;
        }
    }
    Ok(Json(json!({ "detail": VERIFICATION_SENT })))
}

async fn contact(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<Value>,
) -> ApiResult<impl IntoResponse> {
    let mut errors = ValidationErrors::new();
    validate_contact_fields(&mut errors, &body);
    errors.into_result()?;

    let email = str_field(&body, "email").trim();
    mail::dispatch(
        &state.mailer,
        contact_email(
            &state.config,
            str_field(&body, "name").trim(),
            email,
            str_field(&body, "subject").trim(),
            str_field(&body, "message").trim(),
        ),
    );

    tracing::info!(from = %email, "contact form submitted");
    Ok(Json(json!({ "detail": "Your message has been sent successfully." })))
}
