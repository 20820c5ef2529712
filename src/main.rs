mod brand;
mod context;
mod directory;
mod dispatch;
mod erp;
mod fetcher;
mod http;
mod idempotency;
mod inference;
mod jobs;
mod llm;
mod matcher;
mod metrics;
mod models;
mod normalize;
mod notify;
mod pipeline;
mod security;
mod supabase;
#[cfg(test)]
mod testing;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use idempotency::{IdempotencyStore, Reservation};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, CatalogReport, OrderEvent, RunResponse};
use pipeline::{Pipeline, PipelineError, PipelineErrorKind};
use security::{AuthContext, AuthState, require_api_auth};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    if let Err(err) = run().await {
        error!(target = "oc.api", "server crashed: {err}");
        return Err(err);
    }
    Ok(())
}

async fn run() -> eyre::Result<()> {
    let auth_state = AuthState::from_env();
    let pipeline = Pipeline::from_env();
    let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone());
    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let state = AppState {
        pipeline,
        queue,
        idempotency: IdempotencyStore::from_env(),
        prometheus_handle,
    };

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "oc.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state, auth_state).into_make_service()).await?;
    Ok(())
}

fn app(state: AppState, auth_state: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/webhooks/orders", post(receive_order_webhook))
        .route("/orders/dispatch", post(dispatch_order))
        .route("/catalog/brands", post(resolve_catalog_brands))
        .route("/jobs/{id}", get(get_job_status))
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
    queue: jobs::JobQueue,
    idempotency: IdempotencyStore,
    prometheus_handle: PrometheusHandle,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "oc-dispatch-rs",
    }))
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
    duplicate: bool,
}

/// Accept an ERP order webhook and queue a run for it.
///
/// - Method: `POST`
/// - Path: `/webhooks/orders`
/// - Auth: `Authorization: Bearer <key>` or `X-Api-Key: <key>`
/// - Body: `OrderEvent`
/// - Response: `{job_id}`; a repeated delivery returns the first job id, and
///   one racing an unfinished first delivery gets `409`
async fn receive_order_webhook(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(event): Json<OrderEvent>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/webhooks/orders");
    let dedup_key = format!("webhook:{}:{}", context.org_id, event.dedup_key());
    match state.idempotency.reserve::<String>(&dedup_key).await {
        Reservation::Acquired => {}
        Reservation::InFlight => {
            crate::metrics::duplicate_delivery();
            return Err(AppError::InProgress);
        }
        Reservation::Completed(job_id) => {
            crate::metrics::duplicate_delivery();
            info!(
                target = "oc.api",
                org_id = %context.org_id,
                dedup_key = %dedup_key,
                job_id = %job_id,
                "duplicate_delivery"
            );
            return Ok(Json(EnqueueResponse {
                job_id,
                duplicate: true,
            }));
        }
    }

    let order_id = event.data.id.clone();
    let id = match state.queue.enqueue_order(event, context.clone()).await {
        Ok(id) => id,
        Err(err) => {
            state.idempotency.release(&dedup_key).await;
            return Err(PipelineError::internal("enqueue", err.error).into());
        }
    };
    let job_id = id.to_string();
    state.idempotency.put(&dedup_key, &job_id).await;
    info!(
        target = "oc.api",
        org_id = %context.org_id,
        order_id = %order_id,
        job_id = %job_id,
        "order_enqueued"
    );
    Ok(Json(EnqueueResponse {
        job_id,
        duplicate: false,
    }))
}

/// Run the order pipeline synchronously.
///
/// - Method: `POST`
/// - Path: `/orders/dispatch`
/// - Body: `OrderEvent`
/// - Response: `RunResponse`; honours `Idempotency-Key`, answering `409`
///   while a request with the same key is still running
async fn dispatch_order(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: HeaderMap,
    Json(event): Json<OrderEvent>,
) -> Result<Json<RunResponse>, AppError> {
    crate::metrics::inc_requests("/orders/dispatch");
    info!(
        target = "oc.api",
        org_id = %context.org_id,
        api_key = %context.api_key_id,
        order_id = %event.data.id,
        "dispatch invoked",
    );

    let key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(|key| format!("dispatch:{}:{key}", context.org_id));

    let Some(key) = key else {
        return Ok(Json(state.pipeline.run(event, Some(context)).await?));
    };
    match state.idempotency.reserve::<RunResponse>(&key).await {
        Reservation::Acquired => {}
        Reservation::InFlight => return Err(AppError::InProgress),
        Reservation::Completed(existing) => return Ok(Json(existing)),
    }
    match state.pipeline.run(event, Some(context)).await {
        Ok(response) => {
            state.idempotency.put(&key, &response).await;
            Ok(Json(response))
        }
        Err(err) => {
            state.idempotency.release(&key).await;
            Err(err.into())
        }
    }
}

/// Resolve brands for the whole product catalog. Places no orders.
async fn resolve_catalog_brands(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Result<Json<CatalogReport>, AppError> {
    crate::metrics::inc_requests("/catalog/brands");
    let report = state.pipeline.resolve_catalog(Some(context)).await?;
    Ok(Json(report))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(AppError::Pipeline(PipelineError::invalid_input(
            "jobs",
            "invalid_job_id",
        )));
    };
    if let Some(info) = state.queue.get(uuid).await {
        Ok(Json(info))
    } else {
        Err(AppError::Pipeline(PipelineError::not_found(
            "jobs",
            "not_found",
        )))
    }
}

#[derive(Debug)]
enum AppError {
    Pipeline(PipelineError),
    /// Same delivery or idempotency key is still being processed.
    InProgress,
}

impl From<PipelineError> for AppError {
    fn from(value: PipelineError) -> Self {
        Self::Pipeline(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Pipeline(err) => {
                let status = match err.kind() {
                    PipelineErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    PipelineErrorKind::NotFound => StatusCode::NOT_FOUND,
                    PipelineErrorKind::AuthUnavailable => StatusCode::SERVICE_UNAVAILABLE,
                    PipelineErrorKind::Upstream => StatusCode::BAD_GATEWAY,
                    PipelineErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let payload = ApiError {
                    error: err.stage().to_string(),
                    detail: Some(err.detail().to_string()),
                };
                (status, Json(payload)).into_response()
            }
            AppError::InProgress => {
                let payload = ApiError {
                    error: "in_progress".to_string(),
                    detail: Some("a request with the same key is still running".to_string()),
                };
                (StatusCode::CONFLICT, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
