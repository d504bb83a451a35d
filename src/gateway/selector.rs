use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::RoutingError;
use crate::registry::{Instance, ServiceRegistry};

/// Round-robin instance selection over the configured order.
///
/// One lock-free cursor per service; congestion on one service never
/// serializes selection for another. Selection is blind to health and
/// breaker state; skipping isolated instances is the dispatcher's job.
pub struct InstanceSelector {
    registry: Arc<ServiceRegistry>,
    cursors: HashMap<String, AtomicUsize>,
}

impl InstanceSelector {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        let cursors = registry
            .service_names()
            .map(|name| (name.to_string(), AtomicUsize::new(0)))
            .collect();

        Self { registry, cursors }
    }

    /// Next instance for a service, advancing the cursor by one position
    /// (mod instance count). Wrapping fetch_add keeps the cursor valid
    /// under concurrency; the modulo keeps reads in bounds.
    pub fn next(&self, service: &str) -> Result<Instance, RoutingError> {
        let instances = self
            .registry
            .instances(service)
            .ok_or_else(|| RoutingError::UnknownService(service.to_string()))?;
        let cursor = &self.cursors[service];

        let idx = cursor.fetch_add(1, Ordering::Relaxed) % instances.len();
        Ok(instances[idx].clone())
    }

    /// All instances of a service in rotated round-robin order, advancing
    /// the cursor once. A dispatch iterates this so it visits each
    /// instance exactly once even when concurrent dispatches interleave
    /// cursor updates.
    pub fn rotation(&self, service: &str) -> Result<Vec<Instance>, RoutingError> {
        let instances = self
            .registry
            .instances(service)
            .ok_or_else(|| RoutingError::UnknownService(service.to_string()))?;
        let cursor = &self.cursors[service];

        let start = cursor.fetch_add(1, Ordering::Relaxed) % instances.len();
        let rotated = (0..instances.len())
            .map(|offset| instances[(start + offset) % instances.len()].clone())
            .collect();
        Ok(rotated)
    }
}
