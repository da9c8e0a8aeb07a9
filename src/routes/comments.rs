use axum::{
    Router,
    extract::{Json, Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
};
use serde_json::Value;

use crate::{
    error::{ApiJson, ApiResult, ValidationErrors, internal_error, not_found},
    forum,
    identity::{Actor, ClientIdentity, GuestDetails},
    likes::LikeTarget,
    models::{Comment, CommentResponse, CreateComment, UpdateComment},
    routes::{
        auth::extract_current_user,
        forum::{ensure_can_modify, toggle, viewer},
    },
    state::AppState,
    validation::{require_fields, str_field, validate_content, validate_guest_fields},
};

pub fn comments_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/posts/{id}/comments/",
            get(list_comments).post(create_comment),
        )
        .route(
            "/comments/{id}/",
            patch(update_comment).delete(delete_comment),
        )
        .route("/comments/{id}/like/", post(like_comment))
        .route("/guest/comments/", post(create_guest_comment))
}

async fn ensure_post_exists(state: &AppState, post_id: i64) -> ApiResult<()> {
    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    forum::find_post(&mut conn, post_id)
        .await
        .map_err(internal_error)?
        .map(|_| ())
        .ok_or_else(|| not_found("Post not found"))
}

async fn load_comment(state: &AppState, comment_id: i64) -> ApiResult<Comment> {
    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    forum::find_comment(&mut conn, comment_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Comment not found"))
}

async fn list_comments(
    State(state): State<AppState>,
    headers: HeaderMap,
    client: ClientIdentity,
    Path(post_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let viewer = viewer(&state, &headers, &client).await?;
    ensure_post_exists(&state, post_id).await?;

    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let comments = forum::list_comments(&mut conn, post_id)
        .await
        .map_err(internal_error)?;
    let responses = forum::hydrate_comments(&mut conn, comments, viewer.key())
        .await
        .map_err(internal_error)?;
    Ok(Json(responses))
}

async fn insert_comment(
    state: &AppState,
    post_id: i64,
    content: &str,
    actor: &Actor,
) -> ApiResult<(StatusCode, Json<CommentResponse>)> {
    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let comment = forum::create_comment(&mut conn, post_id, content, actor)
        .await
        .map_err(internal_error)?;
    let mut hydrated = forum::hydrate_comments(&mut conn, vec![comment], actor.key())
        .await
        .map_err(internal_error)?;
    let response = hydrated
        .pop()
        .ok_or_else(|| internal_error("created comment vanished"))?;

    tracing::info!(
        post_id,
        comment_id = response.id,
        guest = actor.user_id().is_none(),
        "created comment"
    );
    Ok((StatusCode::CREATED, Json(response)))
}

async fn create_comment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(post_id): Path<i64>,
    ApiJson(input): ApiJson<CreateComment>,
) -> ApiResult<impl IntoResponse> {
    let user = extract_current_user(&state, &headers).await?;
    ensure_post_exists(&state, post_id).await?;

    let mut errors = ValidationErrors::new();
    validate_content(&mut errors, &input.content);
    errors.into_result()?;

    insert_comment(&state, post_id, &input.content, &Actor::Authenticated(user)).await
}

async fn create_guest_comment(
    State(state): State<AppState>,
    client: ClientIdentity,
    ApiJson(body): ApiJson<Value>,
) -> ApiResult<impl IntoResponse> {
    let mut errors = ValidationErrors::new();
    validate_guest_fields(&mut errors, &body);
    errors.into_result()?;

    let mut errors = ValidationErrors::new();
    let post_id = match body.get("post") {
        None | Some(Value::Null) => {
            errors.add("post", "This field is required.");
            None
        }
        Some(value) => {
            let id = value
                .as_i64()
                .or_else(|| value.as_str().and_then(|raw| raw.trim().parse().ok()));
            if id.is_none() {
                errors.add("post", "Incorrect type. Expected pk value.");
            }
            id
        }
    };
    require_fields(&mut errors, &body, &["content"]);
    if !errors.has("content") {
        validate_content(&mut errors, str_field(&body, "content"));
    }
    errors.into_result()?;
    let post_id = post_id.ok_or_else(|| not_found("Post not found"))?;

    ensure_post_exists(&state, post_id).await?;

    let actor = Actor::resolve(
        None,
        &client,
        GuestDetails {
            name: Some(str_field(&body, "guest_name").to_string()),
            affiliation: Some(str_field(&body, "guest_affiliation").to_string()),
            email: Some(str_field(&body, "guest_email").to_string()),
        },
    );
    insert_comment(&state, post_id, str_field(&body, "content"), &actor).await
}

async fn update_comment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(comment_id): Path<i64>,
    ApiJson(input): ApiJson<UpdateComment>,
) -> ApiResult<impl IntoResponse> {
    let user = extract_current_user(&state, &headers).await?;
    let comment = load_comment(&state, comment_id).await?;
    ensure_can_modify(&user, comment.author_id)?;

    let mut errors = ValidationErrors::new();
    validate_content(&mut errors, &input.content);
    errors.into_result()?;

    let actor = Actor::Authenticated(user);
    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let updated = forum::update_comment(&mut conn, comment.id, &input.content)
        .await
        .map_err(internal_error)?;
    let mut hydrated = forum::hydrate_comments(&mut conn, vec![updated], actor.key())
        .await
        .map_err(internal_error)?;
    let response = hydrated
        .pop()
        .ok_or_else(|| not_found("Comment not found"))?;
    Ok(Json(response))
}

async fn delete_comment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(comment_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let user = extract_current_user(&state, &headers).await?;
    let comment = load_comment(&state, comment_id).await?;
    ensure_can_modify(&user, comment.author_id)?;

    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    forum::delete_comment(&mut conn, comment.id)
        .await
        .map_err(internal_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn like_comment(
    State(state): State<AppState>,
    headers: HeaderMap,
    client: ClientIdentity,
    Path(comment_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(toggle(&state, &headers, &client, LikeTarget::Comment(comment_id)).await?))
}
