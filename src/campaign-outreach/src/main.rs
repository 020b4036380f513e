//! Campaign Outreach: automated outbound sequencing and dispatch.
//!
//! Main entry point that wires the controller to the bundled providers and
//! serves the control API.

use campaign_api::ApiServer;
use campaign_core::config::AppConfig;
use campaign_orchestrator::{local_providers, CampaignController, InMemoryStore};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "campaign-outreach")]
#[command(about = "Outbound campaign sequencing and dispatch engine")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, env = "CAMPAIGN_OUTREACH_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "CAMPAIGN_OUTREACH__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "CAMPAIGN_OUTREACH__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Serve the API without starting a campaign run
    #[arg(long, default_value_t = false)]
    no_autostart: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "campaign_outreach=info,campaign_orchestrator=info,tower_http=info".into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Campaign Outreach starting up");

    let mut config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) if cli.config.is_some() => return Err(e.into()),
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            AppConfig::default()
        }
    };

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        seeds = config.campaign.discovery_seeds.len(),
        auto_reply = config.campaign.auto_reply_enabled,
        "Configuration loaded"
    );

    let providers = local_providers(&config.local)?;
    let store = Arc::new(InMemoryStore::new());
    let controller = Arc::new(CampaignController::new(
        config.campaign.clone(),
        providers,
        store,
    )?);

    if cli.no_autostart {
        info!("Autostart disabled, waiting for POST /v1/campaign/start");
    } else {
        let run = controller.start(config.campaign.clone())?;
        info!(run_id = %run.id, "Campaign run started");
    }

    let api_server = ApiServer::new(config.clone(), controller.clone());

    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Campaign Outreach is ready to serve traffic");

    tokio::select! {
        result = api_server.start_http() => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received");
        }
    }

    if controller.is_running() {
        match controller.stop() {
            Ok(run) => info!(run_id = %run.id, "Campaign run stopped"),
            Err(e) => error!(error = %e, "Failed to stop campaign run"),
        }
    }

    Ok(())
}
