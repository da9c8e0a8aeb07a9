use axum::{
    Router,
    extract::{Json, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::{Value, json};

use crate::{
    db,
    error::{ApiJson, ApiResult, ValidationErrors, forbidden, internal_error, not_found, too_many_requests},
    forum,
    identity::{Actor, ClientIdentity, GuestDetails, resolve_actor},
    likes::{LikeTarget, toggle_like},
    models::{CreatePost, ForumPost, LikeResponse, PostResponse, UpdatePost, User},
    routes::auth::{extract_admin_user, extract_current_user},
    search::{Paginated, PostFilters, PostListParams, search_posts},
    security::FORUM_POST_WINDOW,
    state::AppState,
    validation::{
        str_field, validate_content, validate_guest_fields, validate_post_title,
        validate_title_not_repeated,
    },
};

pub fn forum_routes() -> Router<AppState> {
    Router::new()
        .route("/posts/", get(list_posts).post(create_post))
        .route(
            "/posts/{id}/",
            get(get_post).patch(update_post).delete(delete_post),
        )
        .route("/posts/{id}/like/", post(like_post))
        .route("/posts/{id}/pin/", post(pin_post))
        .route("/guest/posts/", post(create_guest_post))
        .route("/tags/", get(list_tags))
}

/// Whoever is looking: a signed-in user, or the guest behind this session/IP.
pub async fn viewer(state: &AppState, headers: &HeaderMap, client: &ClientIdentity) -> ApiResult<Actor> {
    resolve_actor(state, headers, client, GuestDetails::default()).await
}

/// Authors may change their own content; admins may change anything.
pub fn ensure_can_modify(user: &User, author_id: Option<i64>) -> ApiResult<()> {
    if user.is_admin() || author_id == Some(user.id) {
        Ok(())
    } else {
        Err(forbidden("You do not have permission to perform this action."))
    }
}

async fn throttle_post_creation(state: &AppState, actor: &Actor) -> ApiResult<()> {
    let allowed = state
        .limiter
        .allow(
            "forum_posts",
            &actor.throttle_key(),
            state.config.forum_posts_per_hour,
            FORUM_POST_WINDOW,
        )
        .await;
    if allowed {
        Ok(())
    } else {
        tracing::warn!(actor = %actor.throttle_key(), "forum post creation throttled");
        Err(too_many_requests())
    }
}

fn validate_post_body(errors: &mut ValidationErrors, title: &str, content: &str) {
    validate_post_title(errors, title);
    validate_content(errors, content);
    if errors.is_empty() {
        validate_title_not_repeated(errors, title, content);
    }
}

async fn load_post(state: &AppState, post_id: i64) -> ApiResult<ForumPost> {
    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    forum::find_post(&mut conn, post_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Post not found"))
}

async fn list_posts(
    State(state): State<AppState>,
    headers: HeaderMap,
    client: ClientIdentity,
    axum_extra::extract::Query(params): axum_extra::extract::Query<PostListParams>,
) -> ApiResult<impl IntoResponse> {
    let viewer = viewer(&state, &headers, &client).await?;
    let filters = PostFilters::from_params(&params);

    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let (posts, pagination) = search_posts(&mut conn, &filters, params.page_request())
        .await
        .map_err(internal_error)?;
    let results = forum::hydrate_posts(&mut conn, posts, viewer.key())
        .await
        .map_err(internal_error)?;

    Ok(Json(Paginated {
        results,
        pagination,
    }))
}

async fn insert_post(
    state: &AppState,
    actor: &Actor,
    title: &str,
    content: &str,
    tags: &[String],
) -> ApiResult<(StatusCode, Json<PostResponse>)> {
    let mut tx = db::begin_write(&state.pool).await.map_err(internal_error)?;
    let post = forum::create_post(&mut tx, title.trim(), content, actor, tags)
        .await
        .map_err(internal_error)?;
    let response = forum::post_detail(&mut tx, post, actor.key())
        .await
        .map_err(internal_error)?;
    tx.commit().await.map_err(internal_error)?;

    Ok((StatusCode::CREATED, Json(response)))
}

async fn create_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(input): ApiJson<CreatePost>,
) -> ApiResult<impl IntoResponse> {
    let user = extract_current_user(&state, &headers).await?;
    let actor = Actor::Authenticated(user);
    throttle_post_creation(&state, &actor).await?;

    let mut errors = ValidationErrors::new();
    validate_post_body(&mut errors, &input.title, &input.content);
    let tags = forum::normalize_tags(&mut errors, &input.tags);
    errors.into_result()?;

    insert_post(&state, &actor, &input.title, &input.content, &tags).await
}

fn tags_from_body(body: &Value) -> Vec<String> {
    match body.get("tags") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(ToString::to_string)
            .collect(),
        Some(Value::String(list)) => list.split(',').map(ToString::to_string).collect(),
        _ => Vec::new(),
    }
}

/// Guest details come first so a missing name is reported before anything else.
async fn create_guest_post(
    State(state): State<AppState>,
    client: ClientIdentity,
    ApiJson(body): ApiJson<Value>,
) -> ApiResult<impl IntoResponse> {
    let mut errors = ValidationErrors::new();
    validate_guest_fields(&mut errors, &body);
    errors.into_result()?;

    let details = GuestDetails {
        name: Some(str_field(&body, "guest_name").to_string()),
        affiliation: Some(str_field(&body, "guest_affiliation").to_string()),
        email: Some(str_field(&body, "guest_email").to_string()),
    };
    let actor = Actor::resolve(None, &client, details);
    throttle_post_creation(&state, &actor).await?;

    let title = str_field(&body, "title");
    let content = str_field(&body, "content");
    let mut errors = ValidationErrors::new();
    validate_post_body(&mut errors, title, content);
    let tags = forum::normalize_tags(&mut errors, &tags_from_body(&body));
    errors.into_result()?;

    insert_post(&state, &actor, title, content, &tags).await
}

async fn get_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    client: ClientIdentity,
    Path(post_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let viewer = viewer(&state, &headers, &client).await?;
    let post = load_post(&state, post_id).await?;

    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let detail = forum::post_detail(&mut conn, post, viewer.key())
        .await
        .map_err(internal_error)?;
    Ok(Json(detail))
}

async fn update_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(post_id): Path<i64>,
    ApiJson(input): ApiJson<UpdatePost>,
) -> ApiResult<impl IntoResponse> {
    let user = extract_current_user(&state, &headers).await?;
    let post = load_post(&state, post_id).await?;
    ensure_can_modify(&user, post.author_id)?;

    let title = input.title.as_deref().unwrap_or(&post.title);
    let content = input.content.as_deref().unwrap_or(&post.content);
    let mut errors = ValidationErrors::new();
    validate_post_body(&mut errors, title, content);
    let tags = input
        .tags
        .as_deref()
        .map(|tags| forum::normalize_tags(&mut errors, tags));
    errors.into_result()?;

    let actor = Actor::Authenticated(user);
    let mut tx = db::begin_write(&state.pool).await.map_err(internal_error)?;
    let updated = forum::update_post(
        &mut tx,
        &post,
        input.title.as_deref().map(str::trim),
        input.content.as_deref(),
        tags.as_deref(),
    )
    .await
    .map_err(internal_error)?;
    let detail = forum::post_detail(&mut tx, updated, actor.key())
        .await
        .map_err(internal_error)?;
    tx.commit().await.map_err(internal_error)?;

    Ok(Json(detail))
}

async fn delete_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(post_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let user = extract_current_user(&state, &headers).await?;
    let post = load_post(&state, post_id).await?;
    ensure_can_modify(&user, post.author_id)?;

    let mut tx = db::begin_write(&state.pool).await.map_err(internal_error)?;
    forum::delete_post(&mut tx, post.id)
        .await
        .map_err(internal_error)?;
    tx.commit().await.map_err(internal_error)?;

    Ok(StatusCode::NO_CONTENT)
}

/// Shared by post and comment likes.
pub async fn toggle(
    state: &AppState,
    headers: &HeaderMap,
    client: &ClientIdentity,
    target: LikeTarget,
) -> ApiResult<LikeResponse> {
    let actor = viewer(state, headers, client).await?;

    let mut tx = db::begin_write(&state.pool).await.map_err(internal_error)?;
    let outcome = toggle_like(&mut tx, target, actor.key())
        .await
        .map_err(internal_error)?
        .ok_or_else(|| match target {
            LikeTarget::Post(_) => not_found("Post not found"),
            LikeTarget::Comment(_) => not_found("Comment not found"),
        })?;
    tx.commit().await.map_err(internal_error)?;

    Ok(LikeResponse {
        action: outcome.action.as_str(),
        likes_count: outcome.likes_count,
        is_liked: outcome.is_liked(),
    })
}

async fn like_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    client: ClientIdentity,
    Path(post_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(toggle(&state, &headers, &client, LikeTarget::Post(post_id)).await?))
}

async fn pin_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(post_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let admin = extract_admin_user(&state, &headers).await?;

    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let is_pinned = forum::toggle_pin(&mut conn, post_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Post not found"))?;

    tracing::info!(post_id, is_pinned, admin_id = admin.id, "toggled post pin");
    Ok(Json(json!({ "id": post_id, "is_pinned": is_pinned })))
}

async fn list_tags(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let tags = forum::list_tags(&mut conn).await.map_err(internal_error)?;
    Ok(Json(tags))
}
