use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const ROLE_USER: &str = "user";
pub const ROLE_ADMIN: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub role: String,
    pub email_verified: bool,
    pub affiliation: String,
    pub is_active: bool,
    pub date_joined: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UserResponse {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub role: String,
    pub email_verified: bool,
    pub affiliation: String,
    pub is_active: bool,
    pub is_admin: bool,
    pub date_joined: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            is_admin: user.is_admin(),
            id: user.id,
            username: user.username,
            email: user.email,
            role: user.role,
            email_verified: user.email_verified,
            affiliation: user.affiliation,
            is_active: user.is_active,
            date_joined: user.date_joined,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterUser {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub password2: String,
    pub affiliation: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginUser {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh: String,
}

#[derive(Debug, Serialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfile {
    pub email: Option<String>,
    pub affiliation: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateRole {
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetConfirm {
    #[serde(default)]
    pub new_password: String,
}
