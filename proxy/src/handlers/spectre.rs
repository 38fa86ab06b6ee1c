use async_trait::async_trait;
use std::sync::Arc;

use crate::cacheability;
use crate::context::RequestContext;
use crate::errors::ProxyError;
use crate::keys;
use crate::metrics::ProxyMetrics;
use crate::middleware::Middleware;
use crate::normalize;
use crate::types::{CacheStatus, CasperResponse};

/// First stage of the chain: evaluates cacheability and derives the cache
/// keys the handlers downstream work with. Never produces a response.
pub struct SpectreMiddleware {
    metrics: Arc<ProxyMetrics>,
}

impl SpectreMiddleware {
    pub fn new(metrics: Arc<ProxyMetrics>) -> Self {
        SpectreMiddleware { metrics }
    }
}

#[async_trait]
impl Middleware for SpectreMiddleware {
    fn name(&self) -> &'static str {
        "spectre"
    }

    async fn on_request(
        &self,
        ctx: &mut RequestContext,
    ) -> Result<Option<CasperResponse>, ProxyError> {
        let mut decision = cacheability::evaluate(
            &ctx.method,
            &ctx.normalized_uri,
            &ctx.headers,
            &ctx.body,
            &ctx.destination,
            ctx.service_config.as_deref(),
            ctx.snapshot.internal.casper.disable_caching,
        );

        // Project the body for POST entries that key on it. A body that does
        // not decode makes the request non-cacheable rather than failing it.
        if decision.is_cacheable && ctx.method == hyper::Method::POST && !ctx.body.is_empty() {
            if let Some(entry) = &decision.entry {
                if !normalize::projected_fields(entry).is_empty() {
                    match normalize::normalize_body(&ctx.body, entry) {
                        Ok(normalized) => ctx.normalized_body = Some(normalized),
                        Err(e) => {
                            tracing::warn!("Failed to normalize POST body: {e}");
                            decision.is_cacheable = false;
                            decision.reason = Some(CacheStatus::NonCacheableMissingBody);
                        }
                    }
                }
            }
        }

        if decision.is_cacheable || decision.refresh_cache {
            if let (Some(entry), Some(cache_name)) = (&decision.entry, &decision.cache_name) {
                let derived = keys::derive_primary_key(
                    &ctx.method,
                    &ctx.normalized_uri,
                    &ctx.body,
                    &ctx.headers,
                    &ctx.destination,
                    cache_name,
                    entry,
                    ctx.service_config.as_deref(),
                );
                ctx.primary_key = derived.parts;
                ctx.extracted_id = derived.extracted_id;
            }
        }

        if decision.refresh_cache {
            self.metrics.no_cache_header(
                &ctx.destination,
                decision.cache_name.as_deref().unwrap_or("__ALL__"),
                "no-cache-header",
            );
        }

        ctx.cache_status = decision.reason.clone();
        ctx.cacheability = decision;
        Ok(None)
    }
}
