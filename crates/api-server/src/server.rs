//! API server: the REST control surface plus the Prometheus exporter.

use crate::rest::{self, AppState};
use axum::routing::{get, post, put};
use axum::Router;
use campaign_core::config::AppConfig;
use campaign_orchestrator::CampaignController;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Builds the campaign router over the given state.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Campaign lifecycle
        .route("/v1/campaign/start", post(rest::start_campaign))
        .route("/v1/campaign/stop", post(rest::stop_campaign))
        .route("/v1/campaign/status", get(rest::campaign_status))
        .route("/v1/templates", get(rest::list_templates))
        // Leads
        .route("/v1/leads", post(rest::add_lead))
        .route("/v1/leads/:id", get(rest::get_lead))
        .route("/v1/leads/:id/cancel", post(rest::cancel_lead))
        .route("/v1/leads/:id/resume", post(rest::resume_lead))
        // Settings
        .route("/v1/settings/auto-reply", put(rest::set_auto_reply))
        // Operational endpoints
        .route("/health", get(rest::health_check))
        .route("/live", get(rest::liveness))
        .with_state(state)
}

/// Serves the campaign controller over HTTP.
pub struct ApiServer {
    config: AppConfig,
    controller: Arc<CampaignController>,
}

impl ApiServer {
    pub fn new(config: AppConfig, controller: Arc<CampaignController>) -> Self {
        Self { config, controller }
    }

    /// Start the HTTP REST server.
    pub async fn start_http(&self) -> anyhow::Result<()> {
        let state = AppState {
            controller: self.controller.clone(),
            campaign: self.config.campaign.clone(),
            node_id: self.config.node_id.clone(),
            start_time: Instant::now(),
        };

        let app = router(state)
            .layer(CompressionLayer::new())
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http());

        let addr = SocketAddr::new(self.config.api.host.parse()?, self.config.api.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    /// Start the metrics exporter on a separate port. Must run inside the runtime.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        if !self.config.metrics.enabled {
            info!("Metrics exporter disabled");
            return Ok(());
        }

        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.api.host.parse()?,
                self.config.metrics.port,
            ))
            .install()?;

        info!(port = self.config.metrics.port, "Metrics exporter started");
        Ok(())
    }
}
