//! Read-only HTTP API over the store.
//!
//! Every endpoint except `/health` requires a Bearer API key and is rate
//! limited per key; responses carry `X-RateLimit-*` headers. The API never
//! writes to the store.

pub mod auth;

use std::sync::Arc;

use axum::{
    extract::{Path, Query, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

use crate::models::{Book, ChangeRecord, ChangeSeverity, ChangeType};
use crate::store::{BookFilter, ChangeFilter, Store};

use auth::{ApiKeyService, RateDecision};

const MAX_PAGE_SIZE: usize = 200;

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub keys: Arc<ApiKeyService>,
}

fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": error, "message": message })),
    )
        .into_response()
}

/// Bearer-key auth plus per-key rate limiting; attaches rate headers to the
/// response on the way out.
async fn auth_middleware(
    State(state): State<ApiState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(TypedHeader(bearer)) = bearer else {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "missing_credentials",
            "Authorization: Bearer <api-key> header required",
        );
    };
    let key = bearer.token().to_string();

    if !state.keys.validate(&key) {
        warn!("rejected request with invalid API key");
        return error_response(StatusCode::UNAUTHORIZED, "invalid_api_key", "API key not recognized");
    }

    let decision = state.keys.check_rate_limit(&key);
    if !decision.allowed {
        let mut response = error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_exceeded",
            "Hourly request budget exhausted",
        );
        apply_rate_headers(&mut response, decision);
        return response;
    }

    let mut response = next.run(request).await;
    apply_rate_headers(&mut response, decision);
    response
}

fn apply_rate_headers(response: &mut Response, decision: RateDecision) {
    let headers = response.headers_mut();
    let entries = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_in_secs.to_string()),
    ];
    for (name, value) in entries {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
}

/// Build the full router. The health endpoint sits outside the auth layer.
pub fn router(state: ApiState) -> Router {
    let protected = Router::new()
        .route("/books", get(get_books))
        .route("/books/:book_id", get(get_book))
        .route("/changes", get(get_changes))
        .route("/stats", get(get_stats))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> Response {
    match state.store.count_books() {
        Ok(count) => Json(serde_json::json!({
            "status": "ok",
            "books": count,
            "timestamp": Utc::now().to_rfc3339(),
        }))
        .into_response(),
        Err(e) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "store_unavailable",
            &e.to_string(),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct BooksQuery {
    page: Option<usize>,
    page_size: Option<usize>,
    category: Option<String>,
    availability: Option<String>,
    min_price: Option<f64>,
    max_price: Option<f64>,
    rating: Option<u8>,
}

#[derive(Debug, Serialize)]
struct BooksResponse {
    books: Vec<Book>,
    page: usize,
    page_size: usize,
    count: usize,
}

async fn get_books(
    Query(params): Query<BooksQuery>,
    State(state): State<ApiState>,
) -> Response {
    let page = params.page.unwrap_or(1).max(1);
    let page_size = params.page_size.unwrap_or(50).clamp(1, MAX_PAGE_SIZE);

    let filter = BookFilter {
        category: params.category,
        availability: params.availability,
        min_price: params.min_price,
        max_price: params.max_price,
        rating: params.rating,
        status: None,
    };

    match state
        .store
        .iter_books_page(&filter, Some(page_size), (page - 1) * page_size)
    {
        Ok(books) => Json(BooksResponse {
            count: books.len(),
            books,
            page,
            page_size,
        })
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", &e.to_string()),
    }
}

async fn get_book(Path(book_id): Path<String>, State(state): State<ApiState>) -> Response {
    match state.store.get_book_by_book_id(&book_id) {
        Ok(Some(book)) => Json(book).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "book_not_found", &book_id),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", &e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct ChangesQuery {
    change_type: Option<String>,
    severity: Option<String>,
    book_id: Option<String>,
    since: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ChangesResponse {
    changes: Vec<ChangeRecord>,
    count: usize,
}

async fn get_changes(
    Query(params): Query<ChangesQuery>,
    State(state): State<ApiState>,
) -> Response {
    let change_type = match params.change_type.as_deref().map(ChangeType::parse) {
        Some(None) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_change_type",
                "unknown change_type value",
            )
        }
        Some(parsed) => parsed,
        None => None,
    };
    let severity = match params.severity.as_deref().map(ChangeSeverity::parse) {
        Some(None) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_severity",
                "unknown severity value",
            )
        }
        Some(parsed) => parsed,
        None => None,
    };

    let filter = ChangeFilter {
        change_type,
        severity,
        book_id: params.book_id,
        since: params.since,
    };
    let limit = params.limit.unwrap_or(100).min(1000);

    match state.store.changes_filtered(&filter, Some(limit)) {
        Ok(changes) => Json(ChangesResponse {
            count: changes.len(),
            changes,
        })
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", &e.to_string()),
    }
}

async fn get_stats(State(state): State<ApiState>) -> Response {
    let stats = (|| -> Result<serde_json::Value, crate::store::StoreError> {
        Ok(serde_json::json!({
            "total_books": state.store.count_books()?,
            "active_books": state.store.count_books_with_status(crate::models::BookStatus::Active)?,
            "removed_books": state.store.count_books_with_status(crate::models::BookStatus::Removed)?,
            "total_categories": state.store.count_categories()?,
            "total_changes": state.store.count_changes()?,
            "timestamp": Utc::now().to_rfc3339(),
        }))
    })();

    match stats {
        Ok(body) => Json(body).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", &e.to_string()),
    }
}
