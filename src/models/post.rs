use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::comment::CommentResponse;
use crate::identity::AuthorView;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ForumPost {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub author_id: Option<i64>,
    pub guest_name: Option<String>,
    pub guest_affiliation: Option<String>,
    #[serde(skip_serializing)]
    pub guest_email: Option<String>,
    #[serde(skip_serializing)]
    pub guest_identifier: Option<String>,
    pub is_pinned: bool,
    pub likes_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct PostResponse {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub author_id: Option<i64>,
    pub author: AuthorView,
    pub tags: Vec<String>,
    pub likes_count: i64,
    pub comments_count: i64,
    pub is_liked: bool,
    pub is_pinned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<Vec<CommentResponse>>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePost {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePost {
    pub title: Option<String>,
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ForumTag {
    pub id: i64,
    pub name: String,
    pub usage_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct LikeResponse {
    pub action: &'static str,
    pub likes_count: i64,
    pub is_liked: bool,
}
