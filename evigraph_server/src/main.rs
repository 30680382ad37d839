//! Evigraph server entrypoint.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use evigraph_config::{EvigraphConfig, GovernanceConfig};
use evigraph_pipeline::GovernanceHandle;
use evigraph_server::{router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::var("EVIGRAPH_CONFIG").unwrap_or_else(|_| "evigraph.toml".to_string());
    let config = EvigraphConfig::load(Path::new(&config_path))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.server.log_level.clone()));
    if config.server.log_format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Governance files are version-controlled; a bad file fails startup.
    let governance = GovernanceConfig::load(Path::new(&config.governance_dir))
        .context("governance configuration invalid")?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::from_config(config, GovernanceHandle::new(governance));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "evigraph server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;
    Ok(())
}
