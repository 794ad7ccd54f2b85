//! Axum HTTP surface: operator job triggers and the vendor webhook.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fdm_core::{
    non_blank, parse_tenure, RefreshMode, RunSummary, TenureError, WebhookEvent, UPSWING_PROVIDER,
    WEBHOOK_ACTOR,
};
use fdm_jobs::{JobRunner, JobSet, WebSettings};
use fdm_storage::{StorageError, WebhookEventStore};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "fdm-web";

#[derive(Clone)]
pub struct AppState {
    pub portfolio: Arc<dyn JobRunner>,
    pub pending_journey: Arc<dyn JobRunner>,
    pub webhook_events: Arc<dyn WebhookEventStore>,
    pub webhook_token: Option<String>,
}

impl AppState {
    pub fn new(
        jobs: &JobSet,
        webhook_events: Arc<dyn WebhookEventStore>,
        webhook_token: Option<String>,
    ) -> Self {
        Self {
            portfolio: jobs.portfolio.clone(),
            pending_journey: jobs.pending_journey.clone(),
            webhook_events,
            webhook_token,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("storing webhook event failed: {0}")]
    Storage(#[from] StorageError),
}

impl From<TenureError> for ApiError {
    fn from(err: TenureError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Storage(err) => {
                error!(error = %err, "webhook persistence failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = Json(ErrorBody {
            code: status.as_u16(),
            message: self.to_string(),
        });
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Event body posted by the vendor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpswingWebhookPayload {
    pub pci: String,
    pub fsi: Option<String>,
    pub amount: Option<Decimal>,
    pub tenure: Option<String>,
    pub journey_id: Option<String>,
    pub event_type: Option<String>,
    pub term_deposit_type: Option<String>,
    pub reason: Option<String>,
}

impl UpswingWebhookPayload {
    pub fn into_event(self, vendor: &str) -> ApiResult<WebhookEvent> {
        let client_code = self.pci.trim().to_string();
        if client_code.is_empty() {
            return Err(ApiError::BadRequest("pci is required".to_string()));
        }
        let tenure = parse_tenure(self.tenure.as_deref().unwrap_or_default())?;
        Ok(WebhookEvent {
            client_code,
            vendor: vendor.to_string(),
            tracking_id: non_blank(self.journey_id),
            event_type: non_blank(self.event_type),
            institution: non_blank(self.fsi),
            deposit_type: non_blank(self.term_deposit_type),
            amount: self.amount,
            tenure,
            failure_reason: non_blank(self.reason),
            created_by: WEBHOOK_ACTOR.to_string(),
            updated_by: WEBHOOK_ACTOR.to_string(),
        })
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/v1/jobs/update/portfolio", get(portfolio_handler))
        .route(
            "/v1/jobs/update/portfolio/{refresher}",
            get(portfolio_refresher_handler),
        )
        .route("/v1/jobs/update/pendingJourney", get(pending_journey_handler))
        .route(
            "/v1/jobs/update/pendingJourney/{refresher}",
            get(pending_journey_refresher_handler),
        )
        .route(
            "/webhook/upswing/external/capture/event",
            post(upswing_webhook_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve<F>(settings: &WebSettings, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind((settings.host.as_str(), settings.port)).await?;
    info!(addr = %listener.local_addr()?, "http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn trigger(job: &Arc<dyn JobRunner>, refresher: &str) -> Json<RunSummary> {
    let mode = RefreshMode::from_refresher(refresher);
    info!(job = %job.job(), %mode, refresher, "job triggered over http");
    Json(job.do_job(mode).await)
}

async fn portfolio_handler(State(state): State<Arc<AppState>>) -> Json<RunSummary> {
    trigger(&state.portfolio, "").await
}

async fn portfolio_refresher_handler(
    State(state): State<Arc<AppState>>,
    Path(refresher): Path<String>,
) -> Json<RunSummary> {
    trigger(&state.portfolio, &refresher).await
}

async fn pending_journey_handler(State(state): State<Arc<AppState>>) -> Json<RunSummary> {
    trigger(&state.pending_journey, "").await
}

async fn pending_journey_refresher_handler(
    State(state): State<Arc<AppState>>,
    Path(refresher): Path<String>,
) -> Json<RunSummary> {
    trigger(&state.pending_journey, &refresher).await
}

fn check_webhook_token(expected: Option<&str>, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(expected) {
        Ok(())
    } else {
        Err(ApiError::Forbidden("invalid token".to_string()))
    }
}

async fn upswing_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<UpswingWebhookPayload>,
) -> ApiResult<Json<serde_json::Value>> {
    if let Err(err) = check_webhook_token(state.webhook_token.as_deref(), &headers) {
        warn!("webhook rejected, bad token");
        return Err(err);
    }
    debug!(?payload, "upswing webhook event received");
    let event = payload.into_event(UPSWING_PROVIDER)?;
    state.webhook_events.save_event(&event).await?;
    info!(
        client_code = %event.client_code,
        event_type = event.event_type.as_deref().unwrap_or_default(),
        "webhook event stored"
    );
    Ok(Json(serde_json::json!({})))
}
