// ============================================================================
// API Gateway Service
// ============================================================================
//
// Single entry point for all client requests:
// - JWT authentication with tenant extraction
// - Rate limiting (client-IP based)
// - Round-robin routing to configured upstream instances
// - Bounded retries with backoff, per-service circuit breakers
// - Background health probing, Prometheus metrics
//
// Stateless; scales horizontally. The instance set per service is static
// configuration loaded once at startup.
//
// ============================================================================

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tenant_gateway::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.rust_log.clone()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("=== API Gateway Starting ===");
    info!("Port: {}", config.port);
    info!("Services: {}", config.services.len());
    for (name, instances) in &config.services {
        info!(service = %name, instances = instances.len(), "Registered service");
    }

    let (app, health) = tenant_gateway::build_gateway(&config)?;

    // Health probe loop, independent of request traffic
    let interval = config.health_check.interval_secs;
    let health_task = tokio::spawn(Arc::clone(&health).run(interval));

    // Start server
    let addr: SocketAddr = format!("0.0.0.0:{}", config.port)
        .parse()
        .context("Failed to parse bind address")?;

    info!("API Gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    tokio::select! {
        res = axum::serve(listener, app) => {
            res.context("Server error")?;
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received. Shutting down...");
        }
    }

    health_task.abort();
    Ok(())
}
