//! Forum storage: posts, comments and tags.
//!
//! Posts and comments are attributed either to a user or to a guest; the
//! stored columns are derived from an [`Actor`] in one place. Tag usage
//! counters are kept in step with the join table inside the caller's
//! transaction.

use std::collections::HashMap;

use chrono::Utc;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection};

use crate::{
    error::ValidationErrors,
    identity::{Actor, ActorKey, AuthorSummary, AuthorView},
    likes::liked_ids,
    models::{Comment, CommentResponse, ForumPost, ForumTag, PostResponse},
    search::normalize_names,
};

pub const MAX_TAGS_PER_POST: usize = 10;
pub const TAG_NAME_MAX: usize = 50;

/// Lower-cased, de-duplicated tag names; problems are recorded under `tags`.
pub fn normalize_tags(errors: &mut ValidationErrors, raw: &[String]) -> Vec<String> {
    let tags = normalize_names(raw.iter().map(String::as_str));
    if tags.len() > MAX_TAGS_PER_POST {
        errors.add("tags", format!("A post can have at most {MAX_TAGS_PER_POST} tags."));
    }
    if tags.iter().any(|tag| tag.chars().count() > TAG_NAME_MAX) {
        errors.add("tags", format!("Tags cannot exceed {TAG_NAME_MAX} characters."));
    }
    tags
}

/// Column values identifying who wrote a post or comment.
struct Attribution<'a> {
    author_id: Option<i64>,
    guest_name: Option<&'a str>,
    guest_affiliation: Option<&'a str>,
    guest_email: Option<&'a str>,
    guest_identifier: Option<&'a str>,
}

impl<'a> From<&'a Actor> for Attribution<'a> {
    fn from(actor: &'a Actor) -> Self {
        match actor {
            Actor::Authenticated(user) => Self {
                author_id: Some(user.id),
                guest_name: None,
                guest_affiliation: None,
                guest_email: None,
                guest_identifier: None,
            },
            Actor::Guest(guest) => Self {
                author_id: None,
                guest_name: Some(&guest.name),
                guest_affiliation: Some(&guest.affiliation),
                guest_email: guest.email.as_deref(),
                guest_identifier: Some(&guest.identifier),
            },
        }
    }
}

fn push_id_list(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[i64]) {
    qb.push(" IN (");
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    qb.push(")");
}

pub async fn find_post(conn: &mut SqliteConnection, post_id: i64) -> Result<Option<ForumPost>, sqlx::Error> {
    sqlx::query_as::<_, ForumPost>("SELECT * FROM forum_posts WHERE id = ?")
        .bind(post_id)
        .fetch_optional(conn)
        .await
}

pub async fn find_comment(
    conn: &mut SqliteConnection,
    comment_id: i64,
) -> Result<Option<Comment>, sqlx::Error> {
    sqlx::query_as::<_, Comment>("SELECT * FROM forum_comments WHERE id = ?")
        .bind(comment_id)
        .fetch_optional(conn)
        .await
}

async fn attach_tags(conn: &mut SqliteConnection, post_id: i64, tags: &[String]) -> Result<(), sqlx::Error> {
    let now = Utc::now();
    for name in tags {
        sqlx::query(
            "INSERT INTO forum_tags (name, usage_count, created_at) VALUES (?, 0, ?) \
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        let (tag_id,): (i64,) = sqlx::query_as("SELECT id FROM forum_tags WHERE name = ?")
            .bind(name)
            .fetch_one(&mut *conn)
            .await?;

        let linked = sqlx::query(
            "INSERT INTO forum_post_tags (post_id, tag_id, created_at) VALUES (?, ?, ?) \
             ON CONFLICT DO NOTHING",
        )
        .bind(post_id)
        .bind(tag_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        if linked.rows_affected() > 0 {
            sqlx::query("UPDATE forum_tags SET usage_count = usage_count + 1 WHERE id = ?")
                .bind(tag_id)
                .execute(&mut *conn)
                .await?;
        }
    }
    Ok(())
}

async fn detach_tags(conn: &mut SqliteConnection, post_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE forum_tags SET usage_count = MAX(usage_count - 1, 0) \
         WHERE id IN (SELECT tag_id FROM forum_post_tags WHERE post_id = ?)",
    )
    .bind(post_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query("DELETE FROM forum_post_tags WHERE post_id = ?")
        .bind(post_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Inserts a post with its tags. Run inside a transaction.
pub async fn create_post(
    conn: &mut SqliteConnection,
    title: &str,
    content: &str,
    actor: &Actor,
    tags: &[String],
) -> Result<ForumPost, sqlx::Error> {
    let by = Attribution::from(actor);
    let result = sqlx::query(
        r#"INSERT INTO forum_posts
           (title, content, author_id, guest_name, guest_affiliation, guest_email,
            guest_identifier, is_pinned, likes_count, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, FALSE, 0, ?)"#,
    )
    .bind(title)
    .bind(content)
    .bind(by.author_id)
    .bind(by.guest_name)
    .bind(by.guest_affiliation)
    .bind(by.guest_email)
    .bind(by.guest_identifier)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    let post_id = result.last_insert_rowid();
    attach_tags(conn, post_id, tags).await?;

    tracing::info!(post_id, author_id = ?by.author_id, guest = by.guest_identifier.is_some(), "created forum post");
    find_post(conn, post_id).await?.ok_or(sqlx::Error::RowNotFound)
}

/// Applies the given changes; `tags` replaces the whole tag set. Run inside a transaction.
pub async fn update_post(
    conn: &mut SqliteConnection,
    post: &ForumPost,
    title: Option<&str>,
    content: Option<&str>,
    tags: Option<&[String]>,
) -> Result<ForumPost, sqlx::Error> {
    sqlx::query("UPDATE forum_posts SET title = ?, content = ?, updated_at = ? WHERE id = ?")
        .bind(title.unwrap_or(&post.title))
        .bind(content.unwrap_or(&post.content))
        .bind(Utc::now())
        .bind(post.id)
        .execute(&mut *conn)
        .await?;

    if let Some(tags) = tags {
        detach_tags(conn, post.id).await?;
        attach_tags(conn, post.id, tags).await?;
    }

    find_post(conn, post.id).await?.ok_or(sqlx::Error::RowNotFound)
}

/// Removes a post; comments and likes go with it. Run inside a transaction.
pub async fn delete_post(conn: &mut SqliteConnection, post_id: i64) -> Result<(), sqlx::Error> {
    detach_tags(conn, post_id).await?;
    sqlx::query("DELETE FROM forum_posts WHERE id = ?")
        .bind(post_id)
        .execute(&mut *conn)
        .await?;
    tracing::info!(post_id, "deleted forum post");
    Ok(())
}

/// Flips `is_pinned` and returns the new value.
pub async fn toggle_pin(conn: &mut SqliteConnection, post_id: i64) -> Result<Option<bool>, sqlx::Error> {
    let row: Option<(bool,)> = sqlx::query_as(
        "UPDATE forum_posts SET is_pinned = NOT is_pinned WHERE id = ? RETURNING is_pinned",
    )
    .bind(post_id)
    .fetch_optional(conn)
    .await?;
    Ok(row.map(|(pinned,)| pinned))
}

pub async fn list_tags(conn: &mut SqliteConnection) -> Result<Vec<ForumTag>, sqlx::Error> {
    sqlx::query_as::<_, ForumTag>("SELECT * FROM forum_tags ORDER BY usage_count DESC, name ASC")
        .fetch_all(conn)
        .await
}

pub async fn create_comment(
    conn: &mut SqliteConnection,
    post_id: i64,
    content: &str,
    actor: &Actor,
) -> Result<Comment, sqlx::Error> {
    let by = Attribution::from(actor);
    let result = sqlx::query(
        r#"INSERT INTO forum_comments
           (post_id, content, author_id, guest_name, guest_affiliation, guest_email,
            guest_identifier, likes_count, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)"#,
    )
    .bind(post_id)
    .bind(content)
    .bind(by.author_id)
    .bind(by.guest_name)
    .bind(by.guest_affiliation)
    .bind(by.guest_email)
    .bind(by.guest_identifier)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    find_comment(conn, result.last_insert_rowid())
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

pub async fn update_comment(
    conn: &mut SqliteConnection,
    comment_id: i64,
    content: &str,
) -> Result<Comment, sqlx::Error> {
    sqlx::query("UPDATE forum_comments SET content = ?, updated_at = ? WHERE id = ?")
        .bind(content)
        .bind(Utc::now())
        .bind(comment_id)
        .execute(&mut *conn)
        .await?;
    find_comment(conn, comment_id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

pub async fn delete_comment(conn: &mut SqliteConnection, comment_id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM forum_comments WHERE id = ?")
        .bind(comment_id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Newest first, like the post listing.
pub async fn list_comments(conn: &mut SqliteConnection, post_id: i64) -> Result<Vec<Comment>, sqlx::Error> {
    sqlx::query_as::<_, Comment>(
        "SELECT * FROM forum_comments WHERE post_id = ? ORDER BY created_at DESC, id DESC",
    )
    .bind(post_id)
    .fetch_all(conn)
    .await
}

async fn load_authors(
    conn: &mut SqliteConnection,
    ids: impl IntoIterator<Item = i64>,
) -> Result<HashMap<i64, AuthorSummary>, sqlx::Error> {
    let mut ids: Vec<i64> = ids.into_iter().collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let mut qb = QueryBuilder::<Sqlite>::new("SELECT id, username, affiliation FROM users WHERE id");
    push_id_list(&mut qb, &ids);
    let authors = qb.build_query_as::<AuthorSummary>().fetch_all(conn).await?;
    Ok(authors.into_iter().map(|author| (author.id, author)).collect())
}

#[derive(FromRow)]
struct PostTagRow {
    post_id: i64,
    name: String,
}

pub async fn hydrate_comments(
    conn: &mut SqliteConnection,
    comments: Vec<Comment>,
    viewer: ActorKey<'_>,
) -> Result<Vec<CommentResponse>, sqlx::Error> {
    let ids: Vec<i64> = comments.iter().map(|comment| comment.id).collect();
    let authors = load_authors(&mut *conn, comments.iter().filter_map(|c| c.author_id)).await?;
    let liked = liked_ids(conn, true, &ids, viewer).await?;

    Ok(comments
        .into_iter()
        .map(|comment| CommentResponse {
            author: AuthorView::resolve(
                comment.author_id,
                comment.guest_name.as_deref(),
                comment.guest_affiliation.as_deref(),
                &authors,
            ),
            is_liked: liked.contains(&comment.id),
            id: comment.id,
            post_id: comment.post_id,
            content: comment.content,
            author_id: comment.author_id,
            likes_count: comment.likes_count,
            created_at: comment.created_at,
            updated_at: comment.updated_at,
        })
        .collect())
}

/// Attaches author, tags, comment count and the viewer's like state.
pub async fn hydrate_posts(
    conn: &mut SqliteConnection,
    posts: Vec<ForumPost>,
    viewer: ActorKey<'_>,
) -> Result<Vec<PostResponse>, sqlx::Error> {
    if posts.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<i64> = posts.iter().map(|post| post.id).collect();
    let authors = load_authors(&mut *conn, posts.iter().filter_map(|p| p.author_id)).await?;

    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT pt.post_id, t.name FROM forum_post_tags pt \
         JOIN forum_tags t ON t.id = pt.tag_id WHERE pt.post_id",
    );
    push_id_list(&mut qb, &ids);
    qb.push(" ORDER BY t.name");
    let tag_rows = qb.build_query_as::<PostTagRow>().fetch_all(&mut *conn).await?;
    let mut tags: HashMap<i64, Vec<String>> = HashMap::new();
    for row in tag_rows {
        tags.entry(row.post_id).or_default().push(row.name);
    }

    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT post_id, COUNT(*) FROM forum_comments WHERE post_id",
    );
    push_id_list(&mut qb, &ids);
    qb.push(" GROUP BY post_id");
    let counts: HashMap<i64, i64> = qb
        .build_query_as::<(i64, i64)>()
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .collect();

    let liked = liked_ids(conn, false, &ids, viewer).await?;

    Ok(posts
        .into_iter()
        .map(|post| PostResponse {
            author: AuthorView::resolve(
                post.author_id,
                post.guest_name.as_deref(),
                post.guest_affiliation.as_deref(),
                &authors,
            ),
            tags: tags.remove(&post.id).unwrap_or_default(),
            comments_count: counts.get(&post.id).copied().unwrap_or(0),
            is_liked: liked.contains(&post.id),
            id: post.id,
            title: post.title,
            content: post.content,
            author_id: post.author_id,
            likes_count: post.likes_count,
            is_pinned: post.is_pinned,
            created_at: post.created_at,
            updated_at: post.updated_at,
            comments: None,
        })
        .collect())
}

/// A single post with its comments inlined.
pub async fn post_detail(
    conn: &mut SqliteConnection,
    post: ForumPost,
    viewer: ActorKey<'_>,
) -> Result<PostResponse, sqlx::Error> {
    let post_id = post.id;
    let mut hydrated = hydrate_posts(&mut *conn, vec![post], viewer).await?;
    let mut detail = hydrated.pop().ok_or(sqlx::Error::RowNotFound)?;

    let comments = list_comments(&mut *conn, post_id).await?;
    detail.comments = Some(hydrate_comments(conn, comments, viewer).await?);
    Ok(detail)
}
