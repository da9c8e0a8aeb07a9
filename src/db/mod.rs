use std::str::FromStr;

use chrono::Utc;
use sqlx::{
    Sqlite, SqlitePool, Transaction,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

/// Categories every fresh database starts with.
const DEFAULT_KEYWORD_CATEGORIES: &[(&str, &str)] = &[
    (
        "Conceptual Development",
        "Keywords related to conceptual frameworks and theoretical development",
    ),
    (
        "Latin America",
        "Keywords related to Latin American regions, countries, and contexts",
    ),
];

pub async fn init_db(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .with_regexp();

    let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
    if database_url.contains(":memory:") {
        // An in-memory database lives only as long as its connection.
        pool_options = pool_options.idle_timeout(None).max_lifetime(None);
    }
    let pool = pool_options.connect_with(options).await?;

    create_schema(&pool).await?;
    seed_keyword_categories(&pool).await?;

    Ok(pool)
}

/// Opens a transaction that holds the write lock from its first statement.
///
/// A deferred transaction that reads before writing has to upgrade its lock
/// later, and two of those racing each other fail with `SQLITE_BUSY`.
pub async fn begin_write(pool: &SqlitePool) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
    pool.begin_with("BEGIN IMMEDIATE").await
}

async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL UNIQUE,
            hashed_password TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'user' CHECK (role IN ('user', 'admin')),
            email_verified BOOLEAN NOT NULL DEFAULT FALSE,
            affiliation TEXT NOT NULL DEFAULT '',
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            date_joined TEXT NOT NULL,
            updated_at TEXT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS keyword_categories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS keywords (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            category_id INTEGER NULL REFERENCES keyword_categories(id) ON DELETE SET NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS authors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            affiliation TEXT NOT NULL DEFAULT '',
            email TEXT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS research_papers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            slug TEXT NOT NULL UNIQUE,
            abstract TEXT NOT NULL,
            publication_year INTEGER NOT NULL CHECK (publication_year BETWEEN 1900 AND 2100),
            journal TEXT NOT NULL DEFAULT '',
            doi TEXT NULL,
            url TEXT NOT NULL DEFAULT '',
            methodology_type TEXT NOT NULL DEFAULT '',
            citation_count INTEGER NOT NULL DEFAULT 0 CHECK (citation_count >= 0),
            citation_trend TEXT NOT NULL DEFAULT 'stable'
                CHECK (citation_trend IN ('increasing', 'decreasing', 'stable')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS paper_authors (
            paper_id INTEGER NOT NULL REFERENCES research_papers(id) ON DELETE CASCADE,
            author_id INTEGER NOT NULL REFERENCES authors(id) ON DELETE CASCADE,
            PRIMARY KEY (paper_id, author_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS paper_keywords (
            paper_id INTEGER NOT NULL REFERENCES research_papers(id) ON DELETE CASCADE,
            keyword_id INTEGER NOT NULL REFERENCES keywords(id) ON DELETE CASCADE,
            PRIMARY KEY (paper_id, keyword_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS forum_posts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            author_id INTEGER NULL REFERENCES users(id) ON DELETE CASCADE,
            guest_name TEXT NULL,
            guest_affiliation TEXT NULL,
            guest_email TEXT NULL,
            guest_identifier TEXT NULL,
            is_pinned BOOLEAN NOT NULL DEFAULT FALSE,
            likes_count INTEGER NOT NULL DEFAULT 0 CHECK (likes_count >= 0),
            created_at TEXT NOT NULL,
            updated_at TEXT NULL,
            CHECK (author_id IS NOT NULL OR guest_name IS NOT NULL)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS forum_tags (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            usage_count INTEGER NOT NULL DEFAULT 0 CHECK (usage_count >= 0),
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS forum_post_tags (
            post_id INTEGER NOT NULL REFERENCES forum_posts(id) ON DELETE CASCADE,
            tag_id INTEGER NOT NULL REFERENCES forum_tags(id) ON DELETE CASCADE,
            created_at TEXT NOT NULL,
            PRIMARY KEY (post_id, tag_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS forum_comments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            post_id INTEGER NOT NULL REFERENCES forum_posts(id) ON DELETE CASCADE,
            content TEXT NOT NULL,
            author_id INTEGER NULL REFERENCES users(id) ON DELETE CASCADE,
            guest_name TEXT NULL,
            guest_affiliation TEXT NULL,
            guest_email TEXT NULL,
            guest_identifier TEXT NULL,
            likes_count INTEGER NOT NULL DEFAULT 0 CHECK (likes_count >= 0),
            created_at TEXT NOT NULL,
            updated_at TEXT NULL,
            CHECK (author_id IS NOT NULL OR guest_name IS NOT NULL)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS likes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            post_id INTEGER NULL REFERENCES forum_posts(id) ON DELETE CASCADE,
            comment_id INTEGER NULL REFERENCES forum_comments(id) ON DELETE CASCADE,
            user_id INTEGER NULL REFERENCES users(id) ON DELETE CASCADE,
            guest_identifier TEXT NULL,
            created_at TEXT NOT NULL,
            CHECK ((post_id IS NULL) <> (comment_id IS NULL)),
            CHECK ((user_id IS NULL) <> (guest_identifier IS NULL))
        )
        "#,
    )
    .execute(pool)
    .await?;

    const INDEXES: &[&str] = &[
        "CREATE INDEX IF NOT EXISTS idx_papers_year ON research_papers (publication_year)",
        "CREATE INDEX IF NOT EXISTS idx_papers_citations ON research_papers (citation_count)",
        "CREATE INDEX IF NOT EXISTS idx_paper_keywords_keyword ON paper_keywords (keyword_id)",
        "CREATE INDEX IF NOT EXISTS idx_paper_authors_author ON paper_authors (author_id)",
        "CREATE INDEX IF NOT EXISTS idx_forum_posts_listing ON forum_posts (is_pinned, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_forum_post_tags_tag ON forum_post_tags (tag_id)",
        "CREATE INDEX IF NOT EXISTS idx_forum_comments_post ON forum_comments (post_id, created_at)",
        "CREATE UNIQUE INDEX IF NOT EXISTS uq_likes_post_user ON likes (post_id, user_id) \
         WHERE post_id IS NOT NULL AND user_id IS NOT NULL",
        "CREATE UNIQUE INDEX IF NOT EXISTS uq_likes_post_guest ON likes (post_id, guest_identifier) \
         WHERE post_id IS NOT NULL AND guest_identifier IS NOT NULL",
        "CREATE UNIQUE INDEX IF NOT EXISTS uq_likes_comment_user ON likes (comment_id, user_id) \
         WHERE comment_id IS NOT NULL AND user_id IS NOT NULL",
        "CREATE UNIQUE INDEX IF NOT EXISTS uq_likes_comment_guest ON likes (comment_id, guest_identifier) \
         WHERE comment_id IS NOT NULL AND guest_identifier IS NOT NULL",
    ];

    for statement in INDEXES {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}

async fn seed_keyword_categories(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for (name, description) in DEFAULT_KEYWORD_CATEGORIES {
        sqlx::query(
            "INSERT INTO keyword_categories (name, description) VALUES (?, ?) \
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(description)
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Grants the admin role to `username`, if such a user exists.
pub async fn promote_admin(pool: &SqlitePool, username: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE users SET role = 'admin', updated_at = ? WHERE username = ?")
        .bind(Utc::now())
        .bind(username)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_is_idempotent_and_seeded() {
        let pool = init_db("sqlite::memory:", 1).await.expect("db");
        create_schema(&pool).await.expect("second run");
        seed_keyword_categories(&pool).await.expect("second seed");

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM keyword_categories")
            .fetch_one(&pool)
            .await
            .expect("count");
        assert_eq!(count, DEFAULT_KEYWORD_CATEGORIES.len() as i64);
    }

    #[tokio::test]
    async fn like_rows_need_exactly_one_target_and_owner() {
        let pool = init_db("sqlite::memory:", 1).await.expect("db");
        let now = Utc::now();

        let rejected = sqlx::query(
            "INSERT INTO likes (post_id, comment_id, user_id, guest_identifier, created_at) \
             VALUES (NULL, NULL, NULL, 'ip:1.2.3.4', ?)",
        )
        .bind(now)
        .execute(&pool)
        .await;
        assert!(rejected.is_err());
    }

    #[tokio::test]
    async fn promote_admin_reports_missing_user() {
        let pool = init_db("sqlite::memory:", 1).await.expect("db");
        assert!(!promote_admin(&pool, "nobody").await.expect("update"));
    }
}
