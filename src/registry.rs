use serde::Serialize;
use std::collections::HashMap;

use crate::config::Config;
use crate::error::ConfigError;

/// One network-addressable replica of a logical service.
/// Identity is its base address; the set is fixed for the process lifetime.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Instance {
    pub address: String,
}

impl Instance {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl std::fmt::Display for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address)
    }
}

/// Immutable mapping of service name -> ordered instance list.
/// Insertion order is the configured order and defines the round-robin
/// sequence. Built and validated once at startup.
#[derive(Debug)]
pub struct ServiceRegistry {
    services: HashMap<String, Vec<Instance>>,
}

impl ServiceRegistry {
    /// Build from configuration. A service with an empty instance list is
    /// a fatal configuration error, never a runtime state.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut services = HashMap::new();

        for (name, urls) in &config.services {
            if urls.is_empty() {
                return Err(ConfigError::NoInstances(name.clone()));
            }
            let instances = urls.iter().map(|u| Instance::new(u.as_str())).collect();
            services.insert(name.clone(), instances);
        }

        if services.is_empty() {
            return Err(ConfigError::Invalid("no services configured".to_string()));
        }

        Ok(Self { services })
    }

    #[cfg(test)]
    pub fn from_map(services: HashMap<String, Vec<Instance>>) -> Self {
        Self { services }
    }

    pub fn instances(&self, service: &str) -> Option<&[Instance]> {
        self.services.get(service).map(|v| v.as_slice())
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(|s| s.as_str())
    }

    /// (service, instances) pairs, for health probing
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Instance])> {
        self.services
            .iter()
            .map(|(name, instances)| (name.as_str(), instances.as_slice()))
    }
}
