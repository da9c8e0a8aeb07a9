pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod forum;
pub mod identity;
pub mod likes;
pub mod mail;
pub mod models;
pub mod routes;
pub mod search;
pub mod security;
pub mod state;
pub mod validation;

use axum::{
    Json, Router,
    http::{HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    config::Config,
    error::detail,
    routes::{auth_routes, comments_routes, forum_routes, research_routes, users_routes},
    security::ip_guard,
    state::AppState,
};

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    let allow_origin = if origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

fn handle_panic(cause: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let message = cause
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| cause.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = message, "handler panicked");
    detail(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
}

async fn health_check() -> impl IntoResponse {
    Json(json!({"status": "healthy"}))
}

pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .nest("/api", auth_routes().merge(users_routes()))
        .nest("/api/research", research_routes())
        .nest("/api/forum", forum_routes().merge(comments_routes()))
        .route("/api/health", get(health_check));

    Router::new()
        .merge(api_routes)
        .layer(middleware::from_fn_with_state(state.clone(), ip_guard))
        .layer(cors_layer(&state.config))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
