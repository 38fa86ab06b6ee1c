use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ConfigError;
use crate::context::RequestContext;
use crate::errors::ProxyError;
use crate::registry::Snapshot;
use crate::types::CasperResponse;

/// Per-endpoint extension hooks, referenced by name from a cache entry's
/// `use_filter` field and resolved at startup.
#[async_trait]
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    /// May short-circuit the single-endpoint handler with a response.
    async fn on_request(
        &self,
        _ctx: &mut RequestContext,
    ) -> Result<Option<CasperResponse>, ProxyError> {
        Ok(None)
    }

    /// Runs before the response is persisted on a cache miss.
    async fn after_response(
        &self,
        _ctx: &mut RequestContext,
        _response: &CasperResponse,
    ) -> Result<(), ProxyError> {
        Ok(())
    }
}

/// Statically-known filters, selected by name in configuration.
#[derive(Default)]
pub struct FilterRegistry {
    filters: HashMap<&'static str, Arc<dyn Filter>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        FilterRegistry::default()
    }

    pub fn register(&mut self, filter: Arc<dyn Filter>) {
        self.filters.insert(filter.name(), filter);
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Filter>> {
        self.filters.get(name).cloned()
    }

    /// Startup check: every `use_filter` reference in the snapshot must name
    /// a registered filter.
    pub fn validate(&self, snapshot: &Snapshot) -> Result<(), ConfigError> {
        for config in snapshot.services.values() {
            for (cache_name, entry) in &config.cached_endpoints {
                if let Some(filter) = &entry.use_filter {
                    if self.resolve(filter).is_none() {
                        return Err(ConfigError::UnknownFilter {
                            name: cache_name.clone(),
                            filter: filter.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
