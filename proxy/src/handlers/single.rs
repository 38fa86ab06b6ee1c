use async_trait::async_trait;
use bytes::Bytes;
use http::header::HeaderMap;
use hyper::StatusCode;
use shared::http::filter_hop_by_hop;
use std::sync::Arc;

use crate::context::{RequestContext, StorePlan};
use crate::errors::ProxyError;
use crate::filters::FilterRegistry;
use crate::keys;
use crate::metrics::ProxyMetrics;
use crate::middleware::Middleware;
use crate::storage::{CacheStore, StoredResponse};
use crate::types::{CacheStatus, CasperResponse};

/// Cache-aside handler for non-bulk endpoints: serve the stored response,
/// otherwise let the chain forward upstream and persist the result after the
/// client got its bytes.
pub struct SingleEndpointMiddleware {
    store: CacheStore,
    filters: Arc<FilterRegistry>,
    metrics: Arc<ProxyMetrics>,
}

impl SingleEndpointMiddleware {
    pub fn new(store: CacheStore, filters: Arc<FilterRegistry>, metrics: Arc<ProxyMetrics>) -> Self {
        SingleEndpointMiddleware {
            store,
            filters,
            metrics,
        }
    }

    /// This handler serves reads only for cacheable non-bulk entries.
    fn serves_reads(ctx: &RequestContext) -> bool {
        ctx.cacheability.is_cacheable
            && ctx
                .cache_entry()
                .map(|entry| !entry.bulk_support)
                .unwrap_or(false)
    }

    /// Writes also happen for no-cache refreshes against non-bulk entries.
    fn serves_writes(ctx: &RequestContext) -> bool {
        Self::serves_reads(ctx)
            || (ctx.cacheability.refresh_cache
                && ctx
                    .cache_entry()
                    .map(|entry| !entry.bulk_support)
                    .unwrap_or(false))
    }

    fn filter_for(&self, ctx: &RequestContext) -> Option<Arc<dyn crate::filters::Filter>> {
        let name = ctx.cache_entry()?.use_filter.as_deref()?;
        self.filters.resolve(name)
    }
}

#[async_trait]
impl Middleware for SingleEndpointMiddleware {
    fn name(&self) -> &'static str {
        "single"
    }

    async fn on_request(
        &self,
        ctx: &mut RequestContext,
    ) -> Result<Option<CasperResponse>, ProxyError> {
        if !Self::serves_reads(ctx) {
            return Ok(None);
        }

        if let Some(filter) = self.filter_for(ctx) {
            if let Some(response) = filter.on_request(ctx).await? {
                return Ok(Some(response));
            }
        }

        let key = keys::storage_key(&ctx.primary_key);
        match self.store.get(key).await {
            Ok(Some(stored)) => Ok(Some(CasperResponse::cached(
                stored.status,
                stored.headers,
                stored.body,
            ))),
            Ok(None) => Ok(None),
            Err(e) => {
                // Treated as a miss, but the write-back is suppressed: a
                // fresh copy stored now would not be read consistently.
                tracing::warn!("Cache read failed: {e}");
                ctx.read_failure = true;
                Ok(None)
            }
        }
    }

    async fn on_response(
        &self,
        ctx: &mut RequestContext,
        response: &mut CasperResponse,
    ) -> Result<(), ProxyError> {
        if !Self::serves_writes(ctx) {
            return Ok(());
        }
        let namespace = ctx.destination.clone();
        let cache_name = ctx.cache_name().to_string();

        if response.is_cached() {
            ctx.cache_status = Some(CacheStatus::Hit);
            self.metrics.fetch(&namespace, &cache_name, "hit");
            return Ok(());
        }

        if !response.is_proxied() {
            return Ok(());
        }

        let cacheable_read = Self::serves_reads(ctx);
        if cacheable_read {
            self.metrics.fetch(&namespace, &cache_name, "miss");
        }

        if response.status == StatusCode::OK {
            if cacheable_read {
                ctx.cache_status = Some(CacheStatus::Miss);
            }
            // A refresh replaces the stored record; a read failure this
            // request suppresses the write
            if !ctx.read_failure {
                let ttl = ctx.cache_entry().map(|entry| entry.ttl).unwrap_or_default();
                ctx.store_plan = Some(StorePlan::Single { ttl });
            }
        } else if cacheable_read {
            ctx.cache_status = Some(CacheStatus::NonCacheableResponse(response.status.as_u16()));
        }

        Ok(())
    }

    async fn after_response(
        &self,
        ctx: &mut RequestContext,
        response: &CasperResponse,
    ) -> Result<(), ProxyError> {
        let Some(StorePlan::Single { ttl }) = ctx.store_plan.clone() else {
            return Ok(());
        };
        if !Self::serves_writes(ctx) || ctx.primary_key.is_empty() {
            return Ok(());
        }
        ctx.store_plan = None;

        ctx.surrogate_keys = keys::surrogate_keys(
            &ctx.destination,
            ctx.cache_name(),
            ctx.extracted_id.as_deref(),
        );

        if let Some(filter) = self.filter_for(ctx) {
            filter.after_response(ctx, response).await?;
        }

        let stored = StoredResponse {
            status: response.status,
            headers: cacheable_headers(&response.headers, &ctx.uncacheable_headers()),
            body: response.body.clone(),
        };
        let key = keys::storage_key(&ctx.primary_key);
        let surrogates: Vec<Bytes> = ctx
            .surrogate_keys
            .iter()
            .map(|sk| Bytes::from(sk.clone()))
            .collect();

        self.store.store(key, stored, surrogates, ttl).await;
        self.metrics.store(&ctx.destination, ctx.cache_name());
        Ok(())
    }
}

/// The header set worth persisting: hop-by-hop headers and the destination's
/// uncacheable headers are dropped.
pub(crate) fn cacheable_headers(headers: &HeaderMap, uncacheable: &[String]) -> HeaderMap {
    let mut filtered = headers.clone();
    filter_hop_by_hop(&mut filtered);
    for name in uncacheable {
        filtered.remove(name.to_ascii_lowercase());
    }
    filtered
}
