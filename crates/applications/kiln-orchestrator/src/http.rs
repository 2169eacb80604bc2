//! HTTP surface
//!
//! A thin axum router over [`Orchestrator`] and [`InstancePool`]. Owner
//! identity comes from headers set by the auth proxy in front of us
//! (`x-user-id` or `x-guest-session`). Cron and admin routes take the cron
//! secret as a bearer token.

use crate::error::OrchestratorError;
use crate::orchestrator::{Orchestrator, SweepReport};
use crate::pool::{CleanupReport, InstancePool};
use crate::routing::CreateJobRequest;
use crate::webhook::SIGNATURE_HEADER;
use axum::body::Bytes;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use kiln_core::OwnerRef;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Header naming a signed-in user
pub const USER_HEADER: &str = "x-user-id";

/// Header naming a guest session
pub const GUEST_HEADER: &str = "x-guest-session";

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub pool: Option<InstancePool>,
    pub cron_secret: Option<String>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            pool: None,
            cron_secret: None,
        }
    }

    pub fn with_pool(mut self, pool: InstancePool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_cron_secret(mut self, secret: impl Into<String>) -> Self {
        self.cron_secret = Some(secret.into());
        self
    }
}

/// Error body returned by every route
#[derive(Debug)]
pub enum ApiError {
    Orchestrator(OrchestratorError),
    Unauthorized(&'static str),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self::Orchestrator(err)
    }
}

/// Status code for an orchestrator error
pub fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::Validation(_) | OrchestratorError::InvalidPayload(_) => {
            StatusCode::BAD_REQUEST
        }
        OrchestratorError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
        OrchestratorError::GuestLimitReached { .. } => StatusCode::TOO_MANY_REQUESTS,
        OrchestratorError::GuestKindNotAllowed(_) => StatusCode::FORBIDDEN,
        OrchestratorError::SubmissionFailed { .. } => StatusCode::BAD_GATEWAY,
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::NotCancellable(_) => StatusCode::CONFLICT,
        OrchestratorError::InvalidSignature => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(message) => {
                (StatusCode::UNAUTHORIZED, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Orchestrator(err) => {
                let status = status_for(&err);
                if status.is_server_error() {
                    error!(error = %err, "Request failed");
                }
                let body = match &err {
                    OrchestratorError::SubmissionFailed { job_id, refunded } => json!({
                        "error": err.to_string(),
                        "jobId": job_id,
                        "refunded": refunded,
                    }),
                    OrchestratorError::InsufficientBalance {
                        required,
                        available,
                    } => json!({
                        "error": err.to_string(),
                        "required": required,
                        "available": available,
                    }),
                    _ => json!({ "error": err.to_string() }),
                };
                (status, Json(body)).into_response()
            }
        }
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Caller identity taken from proxy headers
pub struct Owner(pub OwnerRef);

impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };
        match (header(USER_HEADER), header(GUEST_HEADER)) {
            (Some(user), _) => Ok(Owner(OwnerRef::User(user))),
            (None, Some(session)) => Ok(Owner(OwnerRef::Guest(session))),
            (None, None) => Err(ApiError::Unauthorized("missing user or guest session")),
        }
    }
}

fn require_bearer(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let expected = state
        .cron_secret
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or(ApiError::Unauthorized("cron secret not configured"))?;
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided != Some(expected) {
        return Err(ApiError::Unauthorized("invalid bearer token"));
    }
    Ok(())
}

fn require_pool(state: &AppState) -> ApiResult<&InstancePool> {
    state
        .pool
        .as_ref()
        .ok_or_else(|| OrchestratorError::not_found("instance pool").into())
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", post(create_job))
        .route("/api/jobs/{id}", get(poll_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/worker/webhook", post(worker_webhook))
        .route("/api/cron/sweep", post(cron_sweep))
        .route(
            "/api/admin/instances",
            axum::routing::delete(stop_all_instances),
        )
        .route("/api/admin/instances/sync", post(sync_instances))
        .route("/api/balance", get(balance))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until the listener fails
pub async fn serve(state: AppState, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP server listening");
    axum::serve(listener, router(state)).await
}

async fn create_job(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(request): Json<CreateJobRequest>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.orchestrator.create(owner, &request).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn poll_job(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.orchestrator.poll(&id, &owner).await?))
}

#[derive(Debug, Default, Deserialize)]
struct CancelRequest {
    #[serde(default)]
    force: bool,
}

async fn cancel_job(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let request = if body.is_empty() {
        CancelRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| OrchestratorError::validation(format!("cancel body: {}", e)))?
    };
    Ok(Json(
        state.orchestrator.cancel(&id, &owner, request.force).await?,
    ))
}

async fn worker_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    Ok(Json(
        state.orchestrator.webhook_update(&body, signature).await?,
    ))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CronReport {
    jobs: SweepReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    instances: Option<CleanupReport>,
}

async fn cron_sweep(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<impl IntoResponse> {
    require_bearer(&state, &headers)?;
    let instances = match &state.pool {
        Some(pool) => Some(pool.cleanup().await?),
        None => None,
    };
    let jobs = state.orchestrator.sweep().await?;
    Ok(Json(CronReport { jobs, instances }))
}

async fn sync_instances(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    require_bearer(&state, &headers)?;
    Ok(Json(require_pool(&state)?.sync().await?))
}

async fn stop_all_instances(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    require_bearer(&state, &headers)?;
    let stopped = require_pool(&state)?.force_stop_all().await?;
    Ok(Json(json!({ "stopped": stopped })))
}

async fn balance(State(state): State<AppState>, Owner(owner): Owner) -> ApiResult<impl IntoResponse> {
    let ledger = state.orchestrator.ledger();
    let body = match &owner {
        OwnerRef::User(user_id) => {
            let balance = ledger.balance(user_id).await?;
            json!({
                "tokens": balance.tokens,
                "bonusTokens": balance.bonus_tokens,
                "total": balance.total(),
            })
        }
        OwnerRef::Guest(session) => json!({
            "generationsRemaining": ledger.guest_generations_remaining(session).await?,
            "maxGenerations": ledger.guest_max_generations(),
        }),
    };
    Ok(Json(body))
}
