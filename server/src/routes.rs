//! HTTP route handlers for the Boardwatch server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `POST /webhook` - Jira webhook receiver
//! - `PUT /spaces/{space}` - Register a chat space and replay its watches
//! - `DELETE /spaces/{space}` - Forget a chat space
//! - `POST /spaces/{space}/watches` - Watch a board or filter
//! - `DELETE /spaces/{space}/watches` - Stop watching lists
//! - `GET /spaces/{space}/watches` - Lists a space watches
//! - `GET /stats` - Watch cache snapshot
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - Configuration (including the webhook token)
//! - The [`WatchService`] holding the watch cache
//! - The [`SpaceStore`] persisting per-space configuration
//! - Server start time for uptime reporting
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use boardwatch_server::config::Config;
//! use boardwatch_server::delivery::WebhookDelivery;
//! use boardwatch_server::routes::{create_router, AppState};
//! use boardwatch_server::service::{ServiceOptions, WatchService};
//! use boardwatch_server::store::{MemoryStore, SpaceStore};
//! use boardwatch_server::tracker::JiraClient;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("failed to load config");
//!     let jira = JiraClient::new(&config.jira_url, &config.jira_email, &config.jira_api_token)
//!         .expect("failed to build Jira client");
//!     let store: Arc<dyn SpaceStore> = Arc::new(MemoryStore::new());
//!     let delivery = WebhookDelivery::new(Arc::clone(&store)).expect("failed to build delivery");
//!     let service = WatchService::new(Arc::new(jira), Arc::new(delivery), ServiceOptions::default());
//!
//!     let app = create_router(AppState::new(config, service, store));
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::validate_token;
use crate::config::Config;
use crate::error::{ResolutionError, WatchError};
use crate::service::WatchService;
use crate::store::{SpaceConfig, SpaceStore};
use crate::types::{ListKind, PublicListInfo, Stats, SubscriberId, WatchedList};

// ============================================================================
// Constants
// ============================================================================

/// Maximum body size for webhook payloads (1 MB).
const MAX_BODY_SIZE: usize = 1024 * 1024;

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Watch cache and subscription coordinator.
    pub service: WatchService,

    /// Per-space configuration store.
    pub store: Arc<dyn SpaceStore>,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config, service: WatchService, store: Arc<dyn SpaceStore>) -> Self {
        Self {
            config: Arc::new(config),
            service,
            store,
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &"<Config>")
            .field("watched_lists", &self.service.watched_count())
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(post_webhook))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .route("/spaces/{space}", put(put_space).delete(delete_space))
        .route(
            "/spaces/{space}/watches",
            post(post_watch).delete(delete_watches).get(get_watches),
        )
        .route("/stats", get(get_stats))
        .route("/health", get(get_health))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

// ============================================================================
// Error Response Types
// ============================================================================

/// JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: None,
        }
    }

    fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

fn error_response(status: StatusCode, message: impl Into<String>, code: &str) -> Response {
    (status, Json(ErrorResponse::new(message).with_code(code))).into_response()
}

/// Maps a failed watch onto a status code and a message fit for the space.
fn watch_error_response(space: &SubscriberId, list: &str, err: &WatchError) -> Response {
    match err {
        WatchError::Resolution(resolution) => {
            let (status, code) = match resolution {
                ResolutionError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                ResolutionError::PermissionDenied(_) => (StatusCode::FORBIDDEN, "forbidden"),
                ResolutionError::InvalidReference(_) | ResolutionError::Ambiguous { .. } => {
                    (StatusCode::BAD_REQUEST, "invalid_reference")
                }
                ResolutionError::Upstream(_) => {
                    error!(space = %space, list = %list, error = ?resolution, "Watch failed unexpectedly");
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal")
                }
            };
            error_response(status, resolution.user_message(), code)
        }
        WatchError::NotReady { .. } => {
            warn!(space = %space, list = %list, error = %err, "Watch timed out waiting for resolution");
            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "The list is still being loaded. Please try again in a moment.",
                "not_ready",
            )
        }
        WatchError::Cancelled { .. } => {
            info!(space = %space, list = %list, "Watch withdrawn before it resolved");
            error_response(
                StatusCode::CONFLICT,
                "The list was unwatched before it finished loading.",
                "cancelled",
            )
        }
    }
}

fn store_failure(space: &SubscriberId, err: &dyn std::error::Error) -> Response {
    error!(space = %space, error = %err, "Space store operation failed");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "failed to access space configuration",
        "internal",
    )
}

// ============================================================================
// POST /webhook - Jira Webhook
// ============================================================================

/// Query parameters for the webhook endpoint.
#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    pub token: Option<String>,
}

/// POST /webhook - Receive a Jira webhook.
///
/// The payload is processed in the background; the response never reflects
/// whether the payload was usable or anyone was notified.
///
/// # Responses
///
/// - `202 Accepted` - Payload accepted
/// - `401 Unauthorized` - Webhook token missing or wrong
async fn post_webhook(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    body: Bytes,
) -> Response {
    if let Some(expected) = &state.config.webhook_token {
        if let Err(err) = validate_token(query.token.as_deref(), expected) {
            warn!(error = %err, "Webhook token rejected");
            return error_response(StatusCode::UNAUTHORIZED, err.to_string(), "invalid_token");
        }
    }

    debug!(bytes = body.len(), "Webhook payload accepted");

    let service = state.service.clone();
    tokio::spawn(async move {
        service.handle_event(&body).await;
    });

    StatusCode::ACCEPTED.into_response()
}

// ============================================================================
// /spaces/{space} - Space Registration
// ============================================================================

/// Request body for registering a space.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterSpaceRequest {
    pub webhook_url: String,
}

/// A persisted watch that could not be restored.
#[derive(Debug, Serialize, Deserialize)]
pub struct FailedWatch {
    #[serde(flatten)]
    pub list: WatchedList,
    pub error: String,
}

/// Response body for space registration.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterSpaceResponse {
    pub space: String,
    pub restored: Vec<PublicListInfo>,
    pub failed: Vec<FailedWatch>,
}

fn is_http_url(candidate: &str) -> bool {
    Url::parse(candidate).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
}

/// PUT /spaces/{space} - Register or update a space's delivery target, then
/// replay every watch persisted for it.
async fn put_space(
    State(state): State<AppState>,
    Path(space): Path<String>,
    Json(request): Json<RegisterSpaceRequest>,
) -> Response {
    let space = SubscriberId::new(space);

    if !is_http_url(&request.webhook_url) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "webhookUrl must be an http(s) URL",
            "invalid_webhook_url",
        );
    }

    let webhook_url = request.webhook_url;
    let config = match state
        .store
        .update(
            &space,
            Box::new(move |config: &mut SpaceConfig| config.webhook_url = Some(webhook_url)),
        )
        .await
    {
        Ok(config) => config,
        Err(err) => return store_failure(&space, &err),
    };

    info!(space = %space, watched = config.watched.len(), "Space registered");

    let report = state.service.restore_space(&space, &config.watched).await;

    Json(RegisterSpaceResponse {
        space: space.to_string(),
        restored: report.restored,
        failed: report
            .failed
            .into_iter()
            .map(|(list, err)| FailedWatch {
                list,
                error: err.to_string(),
            })
            .collect(),
    })
    .into_response()
}

/// DELETE /spaces/{space} - Unwatch everything and forget the space.
async fn delete_space(State(state): State<AppState>, Path(space): Path<String>) -> Response {
    let space = SubscriberId::new(space);

    let config = match state.store.load(&space).await {
        Ok(Some(config)) => config,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "unknown space", "unknown_space"),
        Err(err) => return store_failure(&space, &err),
    };

    let removed = state.service.unwatch_lists(&space, &config.watched);

    if let Err(err) = state.store.remove(&space).await {
        return store_failure(&space, &err);
    }

    info!(space = %space, unwatched = removed, "Space removed");
    StatusCode::NO_CONTENT.into_response()
}

// ============================================================================
// /spaces/{space}/watches - Watch Commands
// ============================================================================

/// Request body for watching a list.
#[derive(Debug, Deserialize)]
pub struct WatchRequest {
    /// Numeric id or URL of the board or filter.
    pub list: String,
    /// Kind hint for bare ids; board when omitted.
    pub kind: Option<ListKind>,
}

/// POST /spaces/{space}/watches - Watch a board or filter.
///
/// # Responses
///
/// - `200 OK` - [`PublicListInfo`] for the watched list
/// - `400 Bad Request` - Not a board/filter id or URL (`invalid_reference`)
/// - `403 Forbidden` - Jira refused access (`forbidden`)
/// - `404 Not Found` - No such list (`not_found`)
/// - `409 Conflict` - The space unwatched the list while it was resolving (`cancelled`)
/// - `503 Service Unavailable` - Resolution did not finish (`not_ready`)
/// - `500 Internal Server Error` - Jira failed unexpectedly (`internal`)
async fn post_watch(
    State(state): State<AppState>,
    Path(space): Path<String>,
    Json(request): Json<WatchRequest>,
) -> Response {
    let space = SubscriberId::new(space);

    let info = match state
        .service
        .watch_list(&space, &request.list, request.kind)
        .await
    {
        Ok(info) => info,
        Err(err) => return watch_error_response(&space, &request.list, &err),
    };

    // The watch already took effect; a store failure only costs the replay.
    let watched = WatchedList::from(&info.key());
    if let Err(err) = state
        .store
        .update(
            &space,
            Box::new(move |config: &mut SpaceConfig| {
                config.add_watch(watched);
            }),
        )
        .await
    {
        error!(space = %space, list = %info.key(), error = %err, "Failed to persist watch");
    }

    info!(space = %space, list = %info.key(), name = %info.name, "List watched");
    Json(info).into_response()
}

/// DELETE /spaces/{space}/watches - Stop watching the given lists.
async fn delete_watches(
    State(state): State<AppState>,
    Path(space): Path<String>,
    Json(lists): Json<Vec<WatchedList>>,
) -> Response {
    let space = SubscriberId::new(space);

    let removed = state.service.unwatch_lists(&space, &lists);

    let forget = lists.clone();
    if let Err(err) = state
        .store
        .update(
            &space,
            Box::new(move |config: &mut SpaceConfig| {
                config.remove_watches(&forget);
            }),
        )
        .await
    {
        return store_failure(&space, &err);
    }

    info!(space = %space, requested = lists.len(), removed, "Lists unwatched");
    StatusCode::NO_CONTENT.into_response()
}

/// GET /spaces/{space}/watches - Lists persisted for a space.
async fn get_watches(State(state): State<AppState>, Path(space): Path<String>) -> Response {
    let space = SubscriberId::new(space);

    match state.store.load(&space).await {
        Ok(Some(SpaceConfig { watched, .. })) => Json(watched).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "unknown space", "unknown_space"),
        Err(err) => store_failure(&space, &err),
    }
}

// ============================================================================
// GET /stats - Cache Snapshot
// ============================================================================

/// GET /stats - Every cached list with member and subscriber counts.
async fn get_stats(State(state): State<AppState>) -> Json<Stats> {
    Json(state.service.get_stats())
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Server status (always "ok" if responding).
    pub status: String,

    /// Number of lists in the watch cache.
    pub lists: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
///
/// # Response
///
/// ```json
/// {
///   "status": "ok",
///   "lists": 3,
///   "uptime_seconds": 3600
/// }
/// ```
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        lists: state.service.watched_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
