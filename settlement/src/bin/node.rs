//! Single-node settlement orchestrator
//!
//! Runs with in-memory collaborators. Configuration comes from the TOML file named by
//! `SETTLEMENT_CONFIG`, or from the environment.

use anyhow::Context;
use rail_core::clock::system_clock;
use rail_core::collaborators::{DenyListCompliance, InMemoryLedger, InMemoryRoles};
use rail_core::{Principal, Role};
use settlement::{Config, EngineServices, SettlementEngine};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::var("SETTLEMENT_CONFIG") {
        Ok(path) => Config::from_file(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => Config::from_env().context("loading configuration from environment")?,
    };

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(service = %config.service_name, "Starting settlement node");

    let admin = "bootstrap";
    let services = EngineServices {
        ledger: Arc::new(InMemoryLedger::new()),
        compliance: Arc::new(DenyListCompliance::new()),
        roles: Arc::new(InMemoryRoles::new().with_role(admin, Role::Admin)),
        gateways: Default::default(),
        clock: system_clock(),
        bootstrap_admin: Principal::new(admin),
    };

    let engine = SettlementEngine::new(config, services).context("building settlement engine")?;
    let running = engine.start();
    tracing::info!(
        rails = engine.orchestrator().collaborators().registry.kinds().len(),
        "Settlement node running"
    );

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down settlement node");
    running.shutdown().await?;
    tracing::debug!(metrics = %engine.metrics().render(), "Final metrics");
    Ok(())
}
