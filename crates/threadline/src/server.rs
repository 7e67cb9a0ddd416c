//! HTTP retrieval server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/retrieve` | Embed a query and return ranked chunks |
//! | `POST` | `/chat` | Retrieve, then answer with numbered citations |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "rate_limited", "message": "..." }, "remaining": 0 }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `rate_limited` | 429 |
//! | `invalid_request` | 400 |
//! | `dimension_mismatch` | 409 |
//! | `upstream_error` | 502 |
//! | `internal` | 500 |
//!
//! Clients are identified by the first `X-Forwarded-For` entry, truncated
//! to 80 chars, or `unknown` when the header is absent.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

use threadline_core::rate_limit::RateLimiter;
use threadline_core::store::Store;
use threadline_core::Error;

use crate::config::Config;
use crate::embedding::{self, ProviderError, RetryPolicy};
use crate::generation;
use crate::retrieve::{
    ChatRequest, ChatResponse, RetrievalService, RetrieveRequest, RetrieveResponse,
};
use crate::sqlite_store::SqliteStore;

const MAX_CLIENT_ID_CHARS: usize = 80;

/// Start the server on `[server].bind` and run until Ctrl-C.
pub async fn run_server(config: &Config) -> Result<()> {
    let salt = config.rate_limit.require_salt()?.to_string();
    if !config.embedding.is_enabled() {
        anyhow::bail!("Embedding provider is disabled; the server needs query embeddings.");
    }
    let embedder = embedding::create_provider(&config.embedding)?;
    let generator = generation::create_generator(&config.generation)?;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.db.path).await?);
    let service = Arc::new(RetrievalService {
        store: store.clone(),
        embedder,
        generator,
        limiter: RateLimiter::new(salt),
        retrieve_rule: config.rate_limit.retrieve_rule()?,
        chat_rule: config.rate_limit.chat_rule()?,
        limits: config.retrieval.limits(),
        retry: RetryPolicy::from_config(&config.embedding),
    });

    let purge = spawn_bucket_purge(store, Duration::from_secs(config.rate_limit.window_secs));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "threadline server listening");
    println!("Threadline server listening on http://{}", config.server.bind);

    let served = axum::serve(listener, router(service))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    purge.abort();
    served?;
    Ok(())
}

pub fn router(service: Arc<RetrievalService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/retrieve", post(handle_retrieve))
        .route("/chat", post(handle_chat))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(service)
}

/// Delete expired rate-limit buckets once per window.
fn spawn_bucket_purge(store: Arc<dyn Store>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.purge_expired_rate_buckets(Utc::now()).await {
                Ok(n) if n > 0 => info!(buckets = n, "purged expired rate-limit buckets"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "rate-limit purge failed"),
            }
        }
    })
}

/// Client identity for rate limiting.
pub fn client_id(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("unknown")
        .chars()
        .take(MAX_CLIENT_ID_CHARS)
        .collect()
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining: Option<u32>,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let remaining = (self.status == StatusCode::TOO_MANY_REQUESTS).then_some(0);
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
            remaining,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_request",
            message: rejection.body_text(),
        }
    }
}

/// Map a service failure to its HTTP status and error code.
pub fn classify_error(err: &anyhow::Error) -> AppError {
    let (status, code) = if let Some(e) = err.downcast_ref::<Error>() {
        match e {
            Error::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            Error::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            Error::DimensionMismatch { .. } => (StatusCode::CONFLICT, "dimension_mismatch"),
            Error::InvalidConfig(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        }
    } else if err.downcast_ref::<ProviderError>().is_some() {
        (StatusCode::BAD_GATEWAY, "upstream_error")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "internal")
    };

    if status.is_server_error() {
        error!(code, error = %format!("{err:#}"), "request failed");
    }
    AppError {
        status,
        code,
        message: format!("{err:#}"),
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /retrieve ============

async fn handle_retrieve(
    State(service): State<Arc<RetrievalService>>,
    headers: HeaderMap,
    body: Result<Json<RetrieveRequest>, JsonRejection>,
) -> Result<Json<RetrieveResponse>, AppError> {
    let client = client_id(&headers);
    let Json(req) = body?;
    service
        .retrieve(&client, req)
        .await
        .map(Json)
        .map_err(|e| classify_error(&e))
}

// ============ POST /chat ============

async fn handle_chat(
    State(service): State<Arc<RetrievalService>>,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, AppError> {
    let client = client_id(&headers);
    let Json(req) = body?;
    service
        .chat(&client, req)
        .await
        .map(Json)
        .map_err(|e| classify_error(&e))
}
