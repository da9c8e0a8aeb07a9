//! Like toggling for posts and comments.
//!
//! A toggle is a single transaction: try to delete the actor's like; if a
//! row went away the target is now unliked, otherwise insert (ignoring a
//! concurrent duplicate) and the target is now liked. Counters move only
//! when a row actually changed, so they stay equal to the number of like
//! rows and never go negative.

use std::collections::HashSet;

use chrono::Utc;
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::identity::ActorKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeTarget {
    Post(i64),
    Comment(i64),
}

impl LikeTarget {
    fn column(self) -> &'static str {
        match self {
            Self::Post(_) => "post_id",
            Self::Comment(_) => "comment_id",
        }
    }

    fn table(self) -> &'static str {
        match self {
            Self::Post(_) => "forum_posts",
            Self::Comment(_) => "forum_comments",
        }
    }

    fn id(self) -> i64 {
        match self {
            Self::Post(id) | Self::Comment(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LikeAction {
    Liked,
    Unliked,
}

impl LikeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Liked => "liked",
            Self::Unliked => "unliked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikeOutcome {
    pub action: LikeAction,
    pub likes_count: i64,
}

impl LikeOutcome {
    pub fn is_liked(&self) -> bool {
        self.action == LikeAction::Liked
    }
}

fn push_owner(qb: &mut QueryBuilder<'_, Sqlite>, actor: ActorKey<'_>) {
    match actor {
        ActorKey::User(user_id) => {
            qb.push("user_id = ").push_bind(user_id);
        }
        ActorKey::Guest(identifier) => {
            qb.push("guest_identifier = ").push_bind(identifier.to_string());
        }
    }
}

/// Flips the like state of `target` for `actor`. Call inside a transaction
/// opened with [`crate::db::begin_write`].
///
/// Returns `None` when the target does not exist.
pub async fn toggle_like(
    conn: &mut SqliteConnection,
    target: LikeTarget,
    actor: ActorKey<'_>,
) -> Result<Option<LikeOutcome>, sqlx::Error> {
    let exists: Option<(i64,)> = sqlx::query_as(&format!("SELECT id FROM {} WHERE id = ?", target.table()))
        .bind(target.id())
        .fetch_optional(&mut *conn)
        .await?;
    if exists.is_none() {
        return Ok(None);
    }

    let mut delete = QueryBuilder::<Sqlite>::new("DELETE FROM likes WHERE ");
    delete
        .push(target.column())
        .push(" = ")
        .push_bind(target.id())
        .push(" AND ");
    push_owner(&mut delete, actor);
    let removed = delete.build().execute(&mut *conn).await?.rows_affected();

    let action = if removed > 0 {
        sqlx::query(&format!(
            "UPDATE {} SET likes_count = MAX(likes_count - 1, 0) WHERE id = ?",
            target.table()
        ))
        .bind(target.id())
        .execute(&mut *conn)
        .await?;
        LikeAction::Unliked
    } else {
        let (user_id, guest_identifier) = match actor {
            ActorKey::User(user_id) => (Some(user_id), None),
            ActorKey::Guest(identifier) => (None, Some(identifier)),
        };
        let (post_id, comment_id) = match target {
            LikeTarget::Post(id) => (Some(id), None),
            LikeTarget::Comment(id) => (None, Some(id)),
        };

        let inserted = sqlx::query(
            "INSERT INTO likes (post_id, comment_id, user_id, guest_identifier, created_at) \
             VALUES (?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(post_id)
        .bind(comment_id)
        .bind(user_id)
        .bind(guest_identifier)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if inserted > 0 {
            sqlx::query(&format!(
                "UPDATE {} SET likes_count = likes_count + 1 WHERE id = ?",
                target.table()
            ))
            .bind(target.id())
            .execute(&mut *conn)
            .await?;
        }
        LikeAction::Liked
    };

    let (likes_count,): (i64,) =
        sqlx::query_as(&format!("SELECT likes_count FROM {} WHERE id = ?", target.table()))
            .bind(target.id())
            .fetch_one(&mut *conn)
            .await?;

    tracing::debug!(?target, action = action.as_str(), likes_count, "toggled like");
    Ok(Some(LikeOutcome {
        action,
        likes_count,
    }))
}

/// Which of `ids` (posts or comments, per `comments`) `actor` has liked.
pub async fn liked_ids(
    conn: &mut SqliteConnection,
    comments: bool,
    ids: &[i64],
    actor: ActorKey<'_>,
) -> Result<HashSet<i64>, sqlx::Error> {
    if ids.is_empty() {
        return Ok(HashSet::new());
    }
    let column = if comments { "comment_id" } else { "post_id" };

    let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {column} FROM likes WHERE "));
    push_owner(&mut qb, actor);
    qb.push(format!(" AND {column} IN ("));
    {
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
    }
    qb.push(")");

    let rows: Vec<(i64,)> = qb.build_query_as().fetch_all(conn).await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    async fn seeded() -> sqlx::SqlitePool {
        let pool = init_db("sqlite::memory:", 1).await.expect("db");
        sqlx::query(
            "INSERT INTO forum_posts (id, title, content, guest_name, guest_affiliation, created_at) \
             VALUES (1, 'Seed saving', 'How do you store seeds?', 'Ana', 'Co-op', ?)",
        )
        .bind(Utc::now())
        .execute(&pool)
        .await
        .expect("post");
        pool
    }

    #[tokio::test]
    async fn toggle_flips_state_and_counter() {
        let pool = seeded().await;
        let mut conn = pool.acquire().await.expect("conn");
        let actor = ActorKey::Guest("session:abc");

        let first = toggle_like(&mut conn, LikeTarget::Post(1), actor)
            .await
            .expect("toggle")
            .expect("post exists");
        assert_eq!(first.action, LikeAction::Liked);
        assert_eq!(first.likes_count, 1);

        let second = toggle_like(&mut conn, LikeTarget::Post(1), actor)
            .await
            .expect("toggle")
            .expect("post exists");
        assert_eq!(second.action, LikeAction::Unliked);
        assert_eq!(second.likes_count, 0);

        let third = toggle_like(&mut conn, LikeTarget::Post(1), actor)
            .await
            .expect("toggle")
            .expect("post exists");
        assert!(third.is_liked());
        assert_eq!(third.likes_count, 1);
    }

    #[tokio::test]
    async fn actors_are_counted_separately() {
        let pool = seeded().await;
        let mut conn = pool.acquire().await.expect("conn");

        toggle_like(&mut conn, LikeTarget::Post(1), ActorKey::Guest("ip:1.1.1.1"))
            .await
            .expect("toggle");
        let outcome = toggle_like(&mut conn, LikeTarget::Post(1), ActorKey::Guest("ip:2.2.2.2"))
            .await
            .expect("toggle")
            .expect("post exists");
        assert_eq!(outcome.likes_count, 2);

        let liked = liked_ids(&mut conn, false, &[1, 2], ActorKey::Guest("ip:1.1.1.1"))
            .await
            .expect("liked");
        assert!(liked.contains(&1));
        assert!(!liked.contains(&2));
    }

    #[tokio::test]
    async fn missing_target_is_reported() {
        let pool = seeded().await;
        let mut conn = pool.acquire().await.expect("conn");
        let outcome = toggle_like(&mut conn, LikeTarget::Comment(99), ActorKey::User(1))
            .await
            .expect("query");
        assert!(outcome.is_none());
    }
}
