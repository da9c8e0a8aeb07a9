use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::identity::AuthorView;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Comment {
    pub id: i64,
    pub post_id: i64,
    pub content: String,
    pub author_id: Option<i64>,
    pub guest_name: Option<String>,
    pub guest_affiliation: Option<String>,
    #[serde(skip_serializing)]
    pub guest_email: Option<String>,
    #[serde(skip_serializing)]
    pub guest_identifier: Option<String>,
    pub likes_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct CommentResponse {
    pub id: i64,
    #[serde(rename = "post")]
    pub post_id: i64,
    pub content: String,
    pub author_id: Option<i64>,
    pub author: AuthorView,
    pub likes_count: i64,
    pub is_liked: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CreateComment {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateComment {
    #[serde(default)]
    pub content: String,
}
