use axum::{
    Router,
    extract::{Json, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
};
use serde_json::{Value, json};

use crate::{
    db,
    catalog::{self, ScoredPaper, taxonomy},
    error::{ApiJson, ApiResult, ValidationErrors, internal_error, not_found},
    models::{
        CreateAuthor, CreateCategory, CreateKeyword, LimitQuery, NameQuery, PaperInput,
        PaperResponse,
    },
    routes::auth::extract_admin_user,
    search::{PaperFilters, PaperListParams, Paginated, related_papers, search_papers},
    state::AppState,
};

pub fn research_routes() -> Router<AppState> {
    Router::new()
        .route("/papers/", get(list_papers).post(create_paper))
        .route("/papers/bulk-import/", axum::routing::post(bulk_import))
        .route("/papers/popular-keywords/", get(popular_keywords))
        .route("/papers/trending/", get(trending))
        .route(
            "/papers/{slug}/",
            get(get_paper)
                .put(replace_paper)
                .patch(patch_paper)
                .delete(delete_paper),
        )
        .route("/papers/{slug}/related/", get(related))
        .route("/filter-options/", get(filter_options))
        .route("/authors/", get(list_authors).post(create_author))
        .route("/keywords/", get(list_keywords).post(create_keyword))
        .route(
            "/keyword-categories/",
            get(list_categories).post(create_category),
        )
        .route("/keyword-categories/{id}/keywords/", get(category_keywords))
}

async fn list_papers(
    State(state): State<AppState>,
    axum_extra::extract::Query(params): axum_extra::extract::Query<PaperListParams>,
) -> ApiResult<impl IntoResponse> {
    let filters = PaperFilters::from_params(&params);
    let mut conn = state.pool.acquire().await.map_err(internal_error)?;

    let (rows, pagination) = search_papers(
        &mut conn,
        &filters,
        params.page_request(),
        &state.config.search_weights,
    )
    .await
    .map_err(internal_error)?;

    let ranked = !filters.terms.is_empty();
    let scored = rows
        .into_iter()
        .map(|row| ScoredPaper {
            relevance: ranked.then_some(row.rank),
            matching_keywords: None,
            paper: row.paper,
        })
        .collect();
    let results = catalog::hydrate_papers(&mut conn, scored)
        .await
        .map_err(internal_error)?;

    tracing::debug!(
        total = pagination.total_items,
        page = pagination.current_page,
        terms = filters.terms.len(),
        "listed research papers"
    );
    Ok(Json(Paginated {
        results,
        pagination,
    }))
}

async fn get_paper(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let paper = catalog::find_paper_by_slug(&mut conn, &slug)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Paper not found"))?;

    let response = catalog::hydrate_paper(&mut conn, paper)
        .await
        .map_err(internal_error)?;
    Ok(Json(response))
}

async fn create_paper(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(input): ApiJson<PaperInput>,
) -> ApiResult<impl IntoResponse> {
    extract_admin_user(&state, &headers).await?;

    let draft =
        catalog::validate_paper(&input, None, false).map_err(ValidationErrors::into_api_error)?;

    let mut tx = db::begin_write(&state.pool).await.map_err(internal_error)?;
    let paper = catalog::create_paper(
        &mut tx,
        &draft,
        input.authors.as_deref().unwrap_or_default(),
        input.keywords.as_deref().unwrap_or_default(),
    )
    .await
    .map_err(internal_error)?;
    let response = catalog::hydrate_paper(&mut tx, paper)
        .await
        .map_err(internal_error)?;
    tx.commit().await.map_err(internal_error)?;

    Ok((StatusCode::CREATED, Json(response)))
}

async fn write_paper(
    state: &AppState,
    headers: &HeaderMap,
    slug: &str,
    input: PaperInput,
    partial: bool,
) -> ApiResult<PaperResponse> {
    extract_admin_user(state, headers).await?;

    let mut tx = db::begin_write(&state.pool).await.map_err(internal_error)?;
    let current = catalog::find_paper_by_slug(&mut tx, slug)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Paper not found"))?;

    let draft = catalog::validate_paper(&input, Some(&current), partial)
        .map_err(ValidationErrors::into_api_error)?;

    let paper = catalog::update_paper(
        &mut tx,
        current.id,
        &draft,
        input.authors.as_deref(),
        input.keywords.as_deref(),
    )
    .await
    .map_err(internal_error)?;
    let response = catalog::hydrate_paper(&mut tx, paper)
        .await
        .map_err(internal_error)?;
    tx.commit().await.map_err(internal_error)?;

    tracing::info!(slug, partial, "updated research paper");
    Ok(response)
}

async fn replace_paper(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(slug): Path<String>,
    ApiJson(input): ApiJson<PaperInput>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(write_paper(&state, &headers, &slug, input, false).await?))
}

async fn patch_paper(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(slug): Path<String>,
    ApiJson(input): ApiJson<PaperInput>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(write_paper(&state, &headers, &slug, input, true).await?))
}

async fn delete_paper(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(slug): Path<String>,
) -> ApiResult<impl IntoResponse> {
    extract_admin_user(&state, &headers).await?;

    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let paper = catalog::find_paper_by_slug(&mut conn, &slug)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Paper not found"))?;
    catalog::delete_paper(&mut conn, paper.id)
        .await
        .map_err(internal_error)?;

    tracing::info!(slug = %slug, "deleted research paper");
    Ok(StatusCode::NO_CONTENT)
}

async fn related(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let paper = catalog::find_paper_by_slug(&mut conn, &slug)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Paper not found"))?;

    let rows = related_papers(&mut conn, paper.id)
        .await
        .map_err(internal_error)?;
    let scored = rows
        .into_iter()
        .map(|row| ScoredPaper {
            relevance: None,
            matching_keywords: Some(row.matching_keywords),
            paper: row.paper,
        })
        .collect();
    let results = catalog::hydrate_papers(&mut conn, scored)
        .await
        .map_err(internal_error)?;
    Ok(Json(results))
}

/// All-or-nothing import of a JSON array of papers.
async fn bulk_import(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<Value>,
) -> ApiResult<impl IntoResponse> {
    extract_admin_user(&state, &headers).await?;

    let Value::Array(records) = body else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Expected a list of papers" })),
        ));
    };

    let rejected = |message: String, record: &Value| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": message, "data": record })),
        )
    };

    let mut tx = db::begin_write(&state.pool).await.map_err(internal_error)?;
    for record in &records {
        let input: PaperInput = serde_json::from_value(record.clone())
            .map_err(|e| rejected(e.to_string(), record))?;
        let draft = catalog::validate_paper(&input, None, false).map_err(|errors| {
            rejected(
                errors.first_message().unwrap_or("Invalid paper").to_string(),
                record,
            )
        })?;
        catalog::create_paper(
            &mut tx,
            &draft,
            input.authors.as_deref().unwrap_or_default(),
            input.keywords.as_deref().unwrap_or_default(),
        )
        .await
        .map_err(internal_error)?;
    }
    tx.commit().await.map_err(internal_error)?;

    tracing::info!(created = records.len(), "bulk imported research papers");
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "success", "created": records.len() })),
    ))
}

async fn popular_keywords(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = taxonomy::parse_limit(query.limit.as_deref(), taxonomy::POPULAR_KEYWORDS_DEFAULT);
    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let keywords = taxonomy::popular_keywords(&mut conn, limit)
        .await
        .map_err(internal_error)?;
    Ok(Json(keywords))
}

async fn trending(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = taxonomy::parse_limit(query.limit.as_deref(), taxonomy::TRENDING_DEFAULT);
    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let papers = taxonomy::trending_papers(&mut conn, limit)
        .await
        .map_err(internal_error)?;
    let results = catalog::hydrate_papers(&mut conn, papers.into_iter().map(ScoredPaper::from).collect())
        .await
        .map_err(internal_error)?;
    Ok(Json(results))
}

async fn filter_options(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let options = taxonomy::filter_options(&mut conn)
        .await
        .map_err(internal_error)?;
    Ok(Json(options))
}

async fn list_authors(
    State(state): State<AppState>,
    Query(query): Query<NameQuery>,
) -> ApiResult<impl IntoResponse> {
    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let authors = taxonomy::list_authors(&mut conn, query.name.as_deref())
        .await
        .map_err(internal_error)?;
    Ok(Json(authors))
}

fn require_name(name: &str, max: usize) -> ApiResult<String> {
    let name = name.trim();
    let mut errors = ValidationErrors::new();
    if name.is_empty() {
        errors.add("name", "This field may not be blank.");
    } else if name.chars().count() > max {
        errors.add("name", format!("Ensure this field has no more than {max} characters."));
    }
    errors.into_result()?;
    Ok(name.to_string())
}

fn duplicate(kind: &str) -> crate::error::ApiError {
    let mut errors = ValidationErrors::new();
    errors.add("name", format!("{kind} with this name already exists."));
    errors.into_api_error()
}

async fn create_author(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(input): ApiJson<CreateAuthor>,
) -> ApiResult<impl IntoResponse> {
    extract_admin_user(&state, &headers).await?;
    let name = require_name(&input.name, 100)?;

    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let author = taxonomy::create_author(
        &mut conn,
        &name,
        input.affiliation.as_deref().unwrap_or_default().trim(),
        input.email.as_deref().map(str::trim).filter(|e| !e.is_empty()),
    )
    .await
    .map_err(internal_error)?
    .ok_or_else(|| duplicate("author"))?;

    Ok((StatusCode::CREATED, Json(author)))
}

async fn list_keywords(
    State(state): State<AppState>,
    Query(query): Query<NameQuery>,
) -> ApiResult<impl IntoResponse> {
    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let keywords = taxonomy::list_keywords(&mut conn, query.name.as_deref())
        .await
        .map_err(internal_error)?;
    Ok(Json(keywords))
}

async fn create_keyword(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(input): ApiJson<CreateKeyword>,
) -> ApiResult<impl IntoResponse> {
    extract_admin_user(&state, &headers).await?;
    let name = require_name(&input.name, 100)?;

    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    if let Some(category_id) = input.category {
        if taxonomy::find_category(&mut conn, category_id)
            .await
            .map_err(internal_error)?
            .is_none()
        {
            let mut errors = ValidationErrors::new();
            errors.add("category", format!("Invalid pk \"{category_id}\" - object does not exist."));
            return Err(errors.into_api_error());
        }
    }

    let keyword = taxonomy::create_keyword(&mut conn, &name, input.category)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| duplicate("keyword"))?;

    Ok((StatusCode::CREATED, Json(keyword)))
}

async fn list_categories(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let categories = taxonomy::categories_with_keywords(&mut conn)
        .await
        .map_err(internal_error)?;
    Ok(Json(categories))
}

async fn create_category(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(input): ApiJson<CreateCategory>,
) -> ApiResult<impl IntoResponse> {
    extract_admin_user(&state, &headers).await?;
    let name = require_name(&input.name, 100)?;

    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    let category = taxonomy::create_category(
        &mut conn,
        &name,
        input.description.as_deref().unwrap_or_default().trim(),
    )
    .await
    .map_err(internal_error)?
    .ok_or_else(|| duplicate("keyword category"))?;

    Ok((StatusCode::CREATED, Json(category)))
}

async fn category_keywords(
    State(state): State<AppState>,
    Path(category_id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let mut conn = state.pool.acquire().await.map_err(internal_error)?;
    taxonomy::find_category(&mut conn, category_id)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| not_found("Category not found"))?;

    let keywords = taxonomy::category_keywords(&mut conn, category_id)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({ "keywords": keywords })))
}
