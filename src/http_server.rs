// HTTP REST API Server Implementation
// Read-only JSON API over a finalized trie: search, stats, health and metrics

use anyhow::Result;
use axum::{
    extract::{Path, Query as AxumQuery, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    error::IndexError,
    observability::{get_metrics, with_trace_id},
    query::{LexemePlan, QueryEngine},
    trie::TrieStats,
    types::ValidatedLimit,
    validation,
};

/// Largest `limit` a caller may ask for
pub const MAX_RESULT_LIMIT: usize = 1000;

// Global server start time for uptime tracking
static SERVER_START_TIME: once_cell::sync::Lazy<Instant> = once_cell::sync::Lazy::new(Instant::now);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    engine: Arc<QueryEngine>,
    stats: TrieStats,
    default_limit: usize,
    shutdown: CancellationToken,
}

impl AppState {
    pub fn new(engine: Arc<QueryEngine>, default_limit: usize, shutdown: CancellationToken) -> Self {
        let stats = engine.trie().stats(engine.config().max_bucket_length());
        Self {
            engine,
            stats,
            default_limit,
            shutdown,
        }
    }
}

/// Query parameters for search
#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    pub limit: Option<usize>,
    #[serde(default)]
    pub explain: bool,
}

/// Response for search operations
#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub results: Vec<String>,
    /// Matches before the limit was applied
    pub total_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<Vec<LexemePlan>>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Index statistics response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub nodes: usize,
    pub max_depth: usize,
    pub bucket_entries: usize,
    pub saturated_buckets: usize,
    pub max_lexeme_length: usize,
    pub max_bucket_length: usize,
    pub records: usize,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.into(),
        }),
    )
}

/// Map a failure to a status code by its typed root cause
fn classify_error(err: &anyhow::Error) -> ApiError {
    match IndexError::classify(err) {
        Some(IndexError::Cancelled(_)) => {
            api_error(StatusCode::SERVICE_UNAVAILABLE, "cancelled", err.to_string())
        }
        Some(IndexError::Storage(_)) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_failure",
            err.to_string(),
        ),
        _ => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "search_failed",
            err.to_string(),
        ),
    }
}

/// Create HTTP server with all routes
pub fn create_server(state: AppState) -> Router {
    // Touch the start time so uptime counts from router creation
    once_cell::sync::Lazy::force(&SERVER_START_TIME);

    Router::new()
        .route("/health", get(health_check))
        .route("/search/:query", get(search))
        .route("/stats", get(get_stats))
        .route("/metrics", get(get_metrics_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Start the HTTP server; returns once `state`'s shutdown token fires
pub async fn start_server(state: AppState, port: u16) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = create_server(state);
    let listener = TcpListener::bind(&format!("0.0.0.0:{port}")).await?;

    info!("triedex HTTP server starting on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("triedex HTTP server stopped");
    Ok(())
}

async fn health_check() -> Json<HealthResponse> {
    let uptime_seconds = SERVER_START_TIME.elapsed().as_secs();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
    })
}

async fn search(
    State(state): State<AppState>,
    Path(query): Path<String>,
    AxumQuery(params): AxumQuery<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    validation::index::validate_search_query(&query)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "invalid_query", e.to_string()))?;
    let limit = ValidatedLimit::new(params.limit.unwrap_or(state.default_limit), MAX_RESULT_LIMIT)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "invalid_limit", e.to_string()))?;

    let cancel = state.shutdown.child_token();
    let engine = state.engine.clone();
    let text = query.clone();
    let result = with_trace_id("search", async move { engine.query(&text, &cancel).await }).await;

    match result {
        Ok(outcome) => {
            let total_count = outcome.results.len();
            let mut results = outcome.results;
            results.truncate(limit.get());
            Ok(Json(SearchResponse {
                query,
                results,
                total_count,
                plan: params.explain.then_some(outcome.plan),
            }))
        }
        Err(e) => {
            warn!("Search failed: {}", e);
            Err(classify_error(&e))
        }
    }
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let records = state
        .engine
        .store()
        .len()
        .await
        .map_err(|e| classify_error(&e))?;
    let config = state.engine.config();

    Ok(Json(StatsResponse {
        nodes: state.stats.nodes,
        max_depth: state.stats.max_depth,
        bucket_entries: state.stats.bucket_entries,
        saturated_buckets: state.stats.saturated_buckets,
        max_lexeme_length: config.max_lexeme_length().get(),
        max_bucket_length: config.max_bucket_length().get(),
        records,
    }))
}

async fn get_metrics_handler() -> Json<serde_json::Value> {
    Json(get_metrics())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::IndexConfigBuilder;
    use crate::record_store::MemoryRecordStore;
    use crate::trie::Trie;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    fn create_test_state() -> AppState {
        let records = ["red tank", "blue tank top", "green jug"];
        let config = IndexConfigBuilder::new().build().unwrap();

        let mut trie = Trie::new();
        for (id, record) in records.iter().enumerate() {
            for part in config.tokenize(record) {
                trie.append(config.clamp(&part).path(), id as u32).unwrap();
            }
        }
        trie.merge_upwards(config.max_bucket_length()).unwrap();

        let store = Arc::new(MemoryRecordStore::from_records(records));
        let engine = Arc::new(QueryEngine::new(Arc::new(trie), store, config));
        AppState::new(engine, 10, CancellationToken::new())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(uri: &str) -> Result<(StatusCode, T)> {
        let app = create_server(create_test_state());
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty())?)
            .await?;
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        Ok((status, serde_json::from_slice(&body)?))
    }

    #[tokio::test]
    async fn test_health_check() -> Result<()> {
        let app = create_server(create_test_state());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty())?)
            .await?;

        assert_eq!(response.status(), StatusCode::OK);
        Ok(())
    }

    #[tokio::test]
    async fn test_search_endpoint() -> Result<()> {
        let (status, body): (_, SearchResponse) = get_json("/search/tank").await?;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.results, vec!["red tank", "blue tank top"]);
        assert_eq!(body.total_count, 2);
        assert!(body.plan.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_search_limit_and_explain() -> Result<()> {
        let (status, body): (_, SearchResponse) =
            get_json("/search/tank?limit=1&explain=true").await?;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.results, vec!["red tank"]);
        assert_eq!(body.total_count, 2);
        let plan = body.plan.expect("explain returns the plan");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].path, "tank");
        assert_eq!(plan[0].bucket_len, 2);
        assert!(!plan[0].is_overflow());
        Ok(())
    }

    #[tokio::test]
    async fn test_search_rejects_bad_limit() -> Result<()> {
        let (status, body): (_, ErrorResponse) = get_json("/search/tank?limit=0").await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.error, "invalid_limit");
        Ok(())
    }

    #[tokio::test]
    async fn test_search_with_no_match() -> Result<()> {
        let (status, body): (_, SearchResponse) = get_json("/search/kettle").await?;
        assert_eq!(status, StatusCode::OK);
        assert!(body.results.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_stats_endpoint() -> Result<()> {
        let (status, body): (_, StatsResponse) = get_json("/stats").await?;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.records, 3);
        assert_eq!(body.max_lexeme_length, 10);
        assert_eq!(body.max_bucket_length, 1024);
        assert!(body.nodes > 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_metrics_endpoint() -> Result<()> {
        let (status, body): (_, serde_json::Value) = get_json("/metrics").await?;
        assert_eq!(status, StatusCode::OK);
        assert!(body["operations"]["queries"].is_u64());
        Ok(())
    }

    #[tokio::test]
    async fn test_search_after_shutdown_is_unavailable() -> Result<()> {
        let state = create_test_state();
        state.shutdown.cancel();
        let app = create_server(state);

        let response = app
            .oneshot(Request::builder().uri("/search/tank").body(Body::empty())?)
            .await?;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        Ok(())
    }
}
