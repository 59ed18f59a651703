//! HTTP API over the contact mirror.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (version, cache readiness) |
//! | `POST` | `/contacts/resolve` | Match a partial supplier against the cache |
//! | `POST` | `/contacts` | Create a contact remotely and mirror it |
//! | `POST` | `/contacts/sync` | Full sync of one or all organizations |
//! | `POST` | `/contacts/webhook` | Queue a remote directory webhook (202) |
//! | `GET`  | `/contacts/stats` | Cache statistics, optionally per organization |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "organization_id must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `not_ready` (503), `remote_error` (502), `shutting_down` (503),
//! `internal` (500).

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use contact_mirror_core::{
    CacheStats, Contact, ContactDraft, MatchResolver, MatchResult, PartialSupplier, ResolveError,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::error::SyncError;
use crate::remote::RemoteError;
use crate::sync::{SyncEngine, SyncReport};
use crate::webhook::{verify_signature, SIGNATURE_HEADER};

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
    pub resolver: Arc<MatchResolver>,
    /// When set, webhook bodies must carry a valid signature.
    pub webhook_secret: Option<Arc<str>>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/contacts", post(handle_create))
        .route("/contacts/resolve", post(handle_resolve))
        .route("/contacts/sync", post(handle_sync))
        .route("/contacts/webhook", post(handle_webhook))
        .route("/contacts/stats", get(handle_stats))
        .layer(cors)
        .with_state(state)
}

/// Bind to `bind` and serve until ctrl-c, then stop the engine.
pub async fn run_server(bind: &str, state: AppState) -> anyhow::Result<()> {
    let engine = Arc::clone(&state.engine);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "contact mirror listening");
    println!("contact mirror listening on http://{}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    engine.shutdown();
    engine.wait_webhooks_idle().await;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

impl From<ResolveError> for AppError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::CacheNotLoaded => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "not_ready", err.to_string())
            }
            ResolveError::UnknownOrganization(_) => {
                AppError::new(StatusCode::NOT_FOUND, "not_found", err.to_string())
            }
        }
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        let message = err.to_string();
        match err {
            SyncError::InvalidWebhook(_) => bad_request(message),
            SyncError::UnknownOrganization(_) => {
                AppError::new(StatusCode::NOT_FOUND, "not_found", message)
            }
            SyncError::ShuttingDown => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "shutting_down", message)
            }
            SyncError::Remote(RemoteError::NotFound(_)) => {
                AppError::new(StatusCode::NOT_FOUND, "not_found", message)
            }
            SyncError::Remote(_) => AppError::new(StatusCode::BAD_GATEWAY, "remote_error", message),
            SyncError::Cache(_) => {
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

fn require_org(organization_id: &str) -> Result<&str, AppError> {
    let org = organization_id.trim();
    if org.is_empty() {
        return Err(bad_request("organization_id must not be empty"));
    }
    Ok(org)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    cache_ready: bool,
    pending_webhooks: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        cache_ready: state.engine.cache().is_ready(),
        pending_webhooks: state.engine.pending_webhooks(),
    })
}

// ============ POST /contacts/resolve ============

#[derive(Deserialize)]
struct ResolveRequest {
    organization_id: String,
    #[serde(flatten)]
    supplier: PartialSupplier,
}

async fn handle_resolve(
    State(state): State<AppState>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<MatchResult>, AppError> {
    let org = require_org(&req.organization_id)?;
    if req.supplier.tax_id.is_none() && req.supplier.name.is_none() && req.supplier.email.is_none()
    {
        return Err(bad_request("one of tax_id, name, email is required"));
    }
    Ok(Json(state.resolver.resolve(org, &req.supplier)?))
}

// ============ POST /contacts ============

#[derive(Deserialize)]
struct CreateRequest {
    organization_id: String,
    draft: ContactDraft,
}

async fn handle_create(
    State(state): State<AppState>,
    Json(req): Json<CreateRequest>,
) -> Result<(StatusCode, Json<Arc<Contact>>), AppError> {
    let org = require_org(&req.organization_id)?;
    if req.draft.display_name.trim().is_empty() {
        return Err(bad_request("draft.display_name must not be empty"));
    }
    let contact = state.engine.push_new_contact(org, &req.draft).await?;
    Ok((StatusCode::CREATED, Json(contact)))
}

// ============ POST /contacts/sync ============

#[derive(Deserialize, Default)]
struct SyncRequest {
    #[serde(default)]
    organization_id: Option<String>,
}

#[derive(Serialize)]
struct SyncResponse {
    reports: BTreeMap<String, SyncReport>,
}

async fn handle_sync(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SyncResponse>, AppError> {
    let req: SyncRequest = if body.iter().all(u8::is_ascii_whitespace) {
        SyncRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| bad_request(format!("invalid body: {}", e)))?
    };
    let reports = match req.organization_id.as_deref() {
        Some(org) => {
            let org = require_org(org)?;
            let report = state.engine.full_sync(org).await;
            BTreeMap::from([(org.to_string(), report)])
        }
        None => state.engine.full_sync_all().await,
    };
    Ok(Json(SyncResponse { reports }))
}

// ============ POST /contacts/webhook ============

#[derive(Serialize)]
struct WebhookAccepted {
    status: &'static str,
    organization_id: String,
    contact_id: String,
    event_id: String,
}

async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAccepted>), AppError> {
    if let Some(secret) = state.webhook_secret.as_deref() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_signature(secret, &body, signature) {
            warn!("rejected webhook with bad signature");
            return Err(AppError::new(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "invalid webhook signature",
            ));
        }
    }

    let raw: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| bad_request(format!("webhook body is not JSON: {}", e)))?;
    let event = state.engine.enqueue_webhook(&raw)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookAccepted {
            status: "queued",
            organization_id: event.organization_id,
            contact_id: event.contact_id,
            event_id: event.event_id,
        }),
    ))
}

// ============ GET /contacts/stats ============

#[derive(Deserialize)]
struct StatsQuery {
    organization_id: Option<String>,
}

async fn handle_stats(
    State(state): State<AppState>,
    Query(q): Query<StatsQuery>,
) -> Result<Json<CacheStats>, AppError> {
    let org = q.organization_id.as_deref().map(require_org).transpose()?;
    Ok(Json(state.engine.cache().stats(org)))
}
