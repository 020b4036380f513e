//! REST handlers for the campaign control surface and operational endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use campaign_core::config::CampaignConfig;
use campaign_core::error::CampaignError;
use campaign_core::types::{CampaignRun, ManualLead};
use campaign_orchestrator::{CampaignController, LeadReport, StatusReport};
use campaign_sequence::{SequenceInstance, SequenceTemplate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<CampaignController>,
    /// Configuration used by `start` when the request carries no body.
    pub campaign: CampaignConfig,
    pub node_id: String,
    pub start_time: Instant,
}

// ─── Errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Maps engine errors onto HTTP statuses.
#[derive(Debug)]
pub struct ApiError(CampaignError);

impl From<CampaignError> for ApiError {
    fn from(err: CampaignError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            CampaignError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            CampaignError::Duplicate { .. } => (StatusCode::CONFLICT, "duplicate"),
            CampaignError::AlreadyRunning => (StatusCode::CONFLICT, "already_running"),
            CampaignError::NotRunning => (StatusCode::CONFLICT, "not_running"),
            CampaignError::ConcurrencyViolation { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            CampaignError::InvalidLead(_) => (StatusCode::BAD_REQUEST, "invalid_lead"),
            CampaignError::InvalidTemplate { .. } => (StatusCode::BAD_REQUEST, "invalid_template"),
            CampaignError::Config(_) => (StatusCode::BAD_REQUEST, "invalid_config"),
            CampaignError::Serialization(_) => (StatusCode::BAD_REQUEST, "invalid_body"),
            CampaignError::TransientProvider { .. } => (StatusCode::BAD_GATEWAY, "provider_unavailable"),
            CampaignError::PermanentDelivery(_) => (StatusCode::UNPROCESSABLE_ENTITY, "permanent_delivery"),
            CampaignError::Io(_) | CampaignError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        metrics::counter!("api.errors", "code" => code).increment(1);
        let message = if status.is_server_error() {
            error!(error = %self.0, "Request failed");
            "Internal processing error".to_string()
        } else {
            warn!(error = %self.0, status = status.as_u16(), "Request rejected");
            self.0.to_string()
        };
        (
            status,
            Json(ErrorResponse {
                error: code.to_string(),
                message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// An empty body means "use the defaults".
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError(CampaignError::Serialization(e)))
}

// ─── Campaign ───────────────────────────────────────────────────────────

/// POST /v1/campaign/start: starts a run, optionally with a config override.
pub async fn start_campaign(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<CampaignRun>> {
    let config = if body.iter().all(u8::is_ascii_whitespace) {
        state.campaign.clone()
    } else {
        optional_body::<CampaignConfig>(&body)?
    };
    let run = state.controller.start(config)?;
    info!(run_id = %run.id, node_id = %state.node_id, "Campaign started via API");
    Ok(Json(run))
}

/// POST /v1/campaign/stop
pub async fn stop_campaign(State(state): State<AppState>) -> ApiResult<Json<CampaignRun>> {
    Ok(Json(state.controller.stop()?))
}

/// GET /v1/campaign/status
pub async fn campaign_status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.controller.status())
}

/// GET /v1/templates
pub async fn list_templates(State(state): State<AppState>) -> Json<Vec<SequenceTemplate>> {
    Json(state.controller.catalog().list().into_iter().cloned().collect())
}

// ─── Leads ──────────────────────────────────────────────────────────────

/// POST /v1/leads: adds a manual lead and starts its sequence.
pub async fn add_lead(
    State(state): State<AppState>,
    Json(lead): Json<ManualLead>,
) -> ApiResult<(StatusCode, Json<LeadReport>)> {
    let report = state.controller.add_manual_lead(lead)?;
    metrics::counter!("api.leads_added").increment(1);
    Ok((StatusCode::CREATED, Json(report)))
}

/// GET /v1/leads/:id
pub async fn get_lead(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<LeadReport>> {
    Ok(Json(state.controller.lead_report(id)?))
}

/// POST /v1/leads/:id/cancel
pub async fn cancel_lead(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SequenceInstance>> {
    Ok(Json(state.controller.cancel_sequence(id)?))
}

#[derive(Debug, Default, Deserialize)]
pub struct ResumeRequest {
    #[serde(default)]
    pub template_id: Option<String>,
}

/// POST /v1/leads/:id/resume: body `{"template_id": ...}` is optional.
pub async fn resume_lead(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Bytes,
) -> ApiResult<Json<SequenceInstance>> {
    let request: ResumeRequest = optional_body(&body)?;
    Ok(Json(state.controller.resume_sequence(id, request.template_id)?))
}

// ─── Settings ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct AutoReplySetting {
    pub enabled: bool,
}

/// PUT /v1/settings/auto-reply
pub async fn set_auto_reply(
    State(state): State<AppState>,
    Json(setting): Json<AutoReplySetting>,
) -> Json<AutoReplySetting> {
    state.controller.set_auto_reply_enabled(setting.enabled);
    Json(AutoReplySetting {
        enabled: state.controller.auto_reply_enabled(),
    })
}

// ─── Operational ────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub campaign_running: bool,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        campaign_running: state.controller.is_running(),
    })
}

/// GET /live: liveness probe.
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::router;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use axum::Router;
    use campaign_core::config::LocalProvidersConfig;
    use campaign_orchestrator::{local_providers, InMemoryStore};
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    fn app() -> (Router, Arc<CampaignController>) {
        let providers = local_providers(&LocalProvidersConfig::default()).unwrap();
        let controller = Arc::new(
            CampaignController::new(CampaignConfig::default(), providers, Arc::new(InMemoryStore::new()))
                .unwrap(),
        );
        let state = AppState {
            controller: Arc::clone(&controller),
            campaign: CampaignConfig::default(),
            node_id: "test-node".to_string(),
            start_time: Instant::now(),
        };
        (router(state), controller)
    }

    async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health_and_liveness() {
        let (router, _) = app();
        let (status, body) = call(&router, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["node_id"], "test-node");
        assert_eq!(body["campaign_running"], false);

        let (status, _) = call(&router, Method::GET, "/live", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_start_stop_conflicts() {
        let (router, controller) = app();

        let (status, body) = call(&router, Method::POST, "/v1/campaign/stop", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "not_running");

        let (status, body) = call(&router, Method::POST, "/v1/campaign/start", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");
        assert!(controller.is_running());

        let (status, body) = call(&router, Method::POST, "/v1/campaign/start", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_running");

        let (status, body) = call(&router, Method::GET, "/v1/campaign/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], true);

        let (status, body) = call(&router, Method::POST, "/v1/campaign/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stopped");
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let (router, controller) = app();
        let (status, body) = call(
            &router,
            Method::POST,
            "/v1/campaign/start",
            Some(json!({ "send_window_hours": [] })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_config");
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn test_lead_lifecycle_over_http() {
        let (router, _) = app();

        let (status, body) = call(
            &router,
            Method::POST,
            "/v1/leads",
            Some(json!({ "contact": "Ada@Example.com", "name": "Ada", "interaction": "post_meeting" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["lead"]["contact"], "ada@example.com");
        assert_eq!(body["instance"]["template_id"], "post_meeting");
        let id = body["lead"]["id"].as_str().unwrap().to_string();

        let (status, body) = call(&router, Method::POST, "/v1/leads", Some(json!({ "contact": "ada@example.com" }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "duplicate");

        let (status, body) = call(&router, Method::POST, "/v1/leads", Some(json!({ "contact": "ada at example" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_lead");

        let (status, body) = call(&router, Method::GET, &format!("/v1/leads/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["lead"]["name"], "Ada");

        // Active sequences cannot be resumed.
        let (status, body) = call(&router, Method::POST, &format!("/v1/leads/{id}/resume"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "invalid_transition");

        let (status, body) = call(&router, Method::POST, &format!("/v1/leads/{id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stopped");
        assert_eq!(body["stop_reason"], "operator_cancel");
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_lead_ids() {
        let (router, _) = app();
        let (status, body) = call(&router, Method::GET, &format!("/v1/leads/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let request = Request::builder()
            .uri("/v1/leads/not-a-uuid")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_auto_reply_toggle_and_templates() {
        let (router, controller) = app();
        let (status, body) = call(
            &router,
            Method::PUT,
            "/v1/settings/auto-reply",
            Some(json!({ "enabled": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["enabled"], true);
        assert!(controller.auto_reply_enabled());

        let (status, body) = call(&router, Method::GET, "/v1/templates", None).await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"cold_outreach"));
        assert!(ids.contains(&"reactivation"));
    }
}
