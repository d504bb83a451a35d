// ============================================================================
// Health Aggregator
// ============================================================================
//
// Probes every configured instance with a lightweight GET /health under a
// short timeout and publishes a per-service snapshot. Runs on its own
// timer, holds no lock the dispatcher needs, and never drives breaker
// state: breakers react to real traffic only, so the two failure
// detectors cannot disagree.
//
// ============================================================================

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::HealthCheckConfig;
use crate::metrics::GATEWAY_SERVICE_HEALTH;
use crate::registry::ServiceRegistry;

/// Outcome of one instance probe
#[derive(Debug, Clone, Serialize)]
pub struct InstanceProbe {
    pub address: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub healthy_instances: usize,
    pub instances: Vec<InstanceProbe>,
}

/// Point-in-time health of every service. Rebuilt wholesale each probe
/// cycle; readers only ever see a complete snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub services: HashMap<String, ServiceHealth>,
    pub refreshed_at: DateTime<Utc>,
}

impl HealthSnapshot {
    fn empty() -> Self {
        Self {
            services: HashMap::new(),
            refreshed_at: Utc::now(),
        }
    }
}

pub struct HealthAggregator {
    registry: Arc<ServiceRegistry>,
    client: reqwest::Client,
    snapshot: RwLock<Arc<HealthSnapshot>>,
}

impl HealthAggregator {
    pub fn new(registry: Arc<ServiceRegistry>, config: &HealthCheckConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            registry,
            client,
            snapshot: RwLock::new(Arc::new(HealthSnapshot::empty())),
        })
    }

    /// The last published snapshot. Empty until the first probe cycle.
    pub async fn snapshot(&self) -> Arc<HealthSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Probe every instance of every service and publish a fresh snapshot
    pub async fn refresh(&self) -> Arc<HealthSnapshot> {
        let mut services = HashMap::new();

        for (name, instances) in self.registry.iter() {
            let probes = join_all(
                instances
                    .iter()
                    .map(|instance| self.probe(&instance.address)),
            )
            .await;

            let healthy_instances = probes.iter().filter(|p| p.healthy).count();
            GATEWAY_SERVICE_HEALTH
                .with_label_values(&[name])
                .set(healthy_instances as f64);

            services.insert(
                name.to_string(),
                ServiceHealth {
                    healthy_instances,
                    instances: probes,
                },
            );
        }

        let snapshot = Arc::new(HealthSnapshot {
            services,
            refreshed_at: Utc::now(),
        });

        *self.snapshot.write().await = snapshot.clone();
        snapshot
    }

    async fn probe(&self, address: &str) -> InstanceProbe {
        let health_url = format!("{}/health", address);

        match self.client.get(&health_url).send().await {
            Ok(response) if response.status().is_success() => InstanceProbe {
                address: address.to_string(),
                healthy: true,
                error: None,
            },
            Ok(response) => InstanceProbe {
                address: address.to_string(),
                healthy: false,
                error: Some(format!("status {}", response.status())),
            },
            Err(e) => {
                tracing::debug!(instance = %address, error = %e, "Health probe failed");
                InstanceProbe {
                    address: address.to_string(),
                    healthy: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Probe loop, independent of request traffic. Spawn once at startup.
    pub async fn run(self: Arc<Self>, interval_secs: u64) {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        // The first tick fires immediately, seeding the snapshot at startup
        loop {
            interval.tick().await;
            let snapshot = self.refresh().await;
            tracing::debug!(
                services = snapshot.services.len(),
                "Health snapshot refreshed"
            );
        }
    }
}
