//! Provider registry.
//!
//! Populated once at startup; read concurrently by every run. An explicit
//! handle rather than a global, so tests can build isolated registries.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use super::Provider;
use crate::error::LacquerError;

#[derive(Default)]
pub struct ProviderRegistry {
    by_name: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.by_name.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Provider>, LacquerError> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| LacquerError::ProviderNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Close every registered provider. Failures are logged, not propagated;
    /// shutdown keeps going.
    pub async fn close_all(&self) {
        for (name, provider) in &self.by_name {
            if let Err(err) = provider.close().await {
                warn!(provider = %name, error = %err, "failed to close provider");
            }
        }
    }
}
