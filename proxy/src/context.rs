use bytes::Bytes;
use http::header::HeaderMap;
use hyper::{Method, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::config::{CacheEntry, ServiceConfig};
use crate::registry::Snapshot;
use crate::trace::TraceContext;
use crate::types::CacheStatus;

/// Outcome of the cacheability evaluation for one request.
#[derive(Debug, Clone, Default)]
pub struct CacheDecision {
    pub is_cacheable: bool,
    /// A no-cache header was present: read from upstream, then replace the
    /// stored record on a 200.
    pub refresh_cache: bool,
    pub reason: Option<CacheStatus>,
    pub cache_name: Option<String>,
    pub entry: Option<CacheEntry>,
}

/// Deferred cache write, decided in `on_response` and executed in
/// `after_response` once the client response has been flushed.
#[derive(Debug, Clone)]
pub enum StorePlan {
    /// Persist the flushed response under the context's primary key.
    Single { ttl: Duration },
    /// Persist one record per bulk id that missed.
    Bulk {
        items: Vec<BulkStoreItem>,
        headers: HeaderMap,
        ttl: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct BulkStoreItem {
    pub key: Vec<String>,
    pub surrogate_keys: Vec<String>,
    pub body: Bytes,
}

/// Mutable per-request state, owned by the pipeline driver and borrowed by
/// middlewares. Created on the inbound request, dropped once
/// `after_response` completes.
pub struct RequestContext {
    pub method: Method,
    /// Request URI as received (path and query)
    pub uri: String,
    pub normalized_uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub normalized_body: Option<Bytes>,
    pub remote_addr: Option<SocketAddr>,
    pub destination: String,
    pub source: String,

    /// Config view captured at request entry; stable for the whole request
    pub snapshot: Arc<Snapshot>,
    pub service_config: Option<Arc<ServiceConfig>>,

    pub cacheability: CacheDecision,
    /// Ordered key fields; present iff cacheable or force-refresh
    pub primary_key: Vec<String>,
    /// Computed lazily at store time
    pub surrogate_keys: Vec<String>,
    pub extracted_id: Option<String>,
    pub cache_status: Option<CacheStatus>,

    pub trace: Option<TraceContext>,
    pub start_time: Instant,
    pub start_wall: SystemTime,
    pub end_time: Option<Instant>,
    pub response_status: Option<StatusCode>,

    pub store_plan: Option<StorePlan>,
    /// `X-Casper-Sync: 1` was set: run the cache write before responding
    pub sync_write: bool,
    /// A storage read failed this request; do not write a fresh copy back
    pub read_failure: bool,
}

impl RequestContext {
    pub fn new(
        method: Method,
        uri: String,
        headers: HeaderMap,
        body: Bytes,
        remote_addr: Option<SocketAddr>,
        destination: String,
        source: String,
        snapshot: Arc<Snapshot>,
    ) -> Self {
        let normalized_uri = crate::normalize::normalize_uri(&uri);
        let service_config = snapshot.service(&destination);
        let sync_write = headers
            .get("x-casper-sync")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "1")
            .unwrap_or(false);
        let trace = TraceContext::from_headers(&headers);

        RequestContext {
            method,
            uri,
            normalized_uri,
            headers,
            body,
            normalized_body: None,
            remote_addr,
            destination,
            source,
            snapshot,
            service_config,
            cacheability: CacheDecision::default(),
            primary_key: Vec::new(),
            surrogate_keys: Vec::new(),
            extracted_id: None,
            cache_status: None,
            trace,
            start_time: Instant::now(),
            start_wall: SystemTime::now(),
            end_time: None,
            response_status: None,
            store_plan: None,
            sync_write,
            read_failure: false,
        }
    }

    /// The entry the request matched, when cacheable or refreshing.
    pub fn cache_entry(&self) -> Option<&CacheEntry> {
        self.cacheability.entry.as_ref()
    }

    pub fn cache_name(&self) -> &str {
        self.cacheability.cache_name.as_deref().unwrap_or("")
    }

    /// Dimension value for metrics: the matched cache name or `__ALL__`.
    pub fn cache_name_dim(&self) -> &str {
        self.cacheability
            .cache_name
            .as_deref()
            .unwrap_or("__ALL__")
    }

    pub fn cache_status_string(&self) -> String {
        self.cache_status
            .as_ref()
            .map(|status| status.to_string())
            .unwrap_or_default()
    }

    /// Headers the destination does not want persisted, merging the entry
    /// override with the namespace default.
    pub fn uncacheable_headers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .service_config
            .as_ref()
            .map(|config| config.uncacheable_headers.clone())
            .unwrap_or_default();
        if let Some(entry) = self.cache_entry() {
            if let Some(extra) = &entry.uncacheable_headers {
                names.extend(extra.iter().cloned());
            }
        }
        names
    }
}
