pub mod cacheability;
pub mod config;
pub mod context;
pub mod errors;
pub mod filters;
pub mod handlers;
pub mod internal;
pub mod keys;
pub mod metrics;
pub mod metrics_defs;
pub mod middleware;
pub mod normalize;
pub mod registry;
pub mod service;
pub mod storage;
pub mod trace;
pub mod types;
pub mod upstream;

use std::env;
use std::sync::Arc;

use crate::errors::ProxyError;
use crate::filters::FilterRegistry;
use crate::handlers::{BulkEndpointMiddleware, SingleEndpointMiddleware, SpectreMiddleware};
use crate::internal::InternalEndpoints;
use crate::metrics::ProxyMetrics;
use crate::middleware::{Middleware, MiddlewareChain};
use crate::registry::{ConfigPaths, ConfigRegistry};
use crate::service::CasperService;
use crate::storage::{CacheStore, MemoryBackend};
use crate::trace::ZipkinReporter;
use crate::upstream::UpstreamClient;
use shared::http::run_http_service;
use shared::metrics::Metrics;

/// Identity dimensions stamped on every relayed metric.
fn default_dimensions() -> Vec<(String, String)> {
    vec![
        (
            "habitat".to_string(),
            env::var("HABITAT").unwrap_or_default(),
        ),
        (
            "service_name".to_string(),
            env::var("PAASTA_SERVICE").unwrap_or_else(|_| "spectre".to_string()),
        ),
        (
            "instance_name".to_string(),
            env::var("PAASTA_INSTANCE").unwrap_or_default(),
        ),
        (
            "casper_version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
    ]
}

/// Builds and serves the proxy. Only unrecoverable startup problems (broken
/// config, bind failure, storage handshake) surface as errors; everything
/// after that fails open per request.
pub async fn run(paths: ConfigPaths, worker_id: usize) -> Result<(), ProxyError> {
    let registry = ConfigRegistry::load(paths).await?;
    let snapshot = registry.snapshot();
    let internal_config = snapshot.internal.clone();

    let relay = match internal_config
        .yelp_meteorite
        .as_ref()
        .and_then(|meteorite| meteorite.metrics_relay.as_ref())
    {
        Some(relay) => Metrics::new_relay(&relay.host, relay.port, default_dimensions())?,
        None => Metrics::new_noop(),
    };
    let metrics = Arc::new(ProxyMetrics::new(relay));

    let store = CacheStore::new(
        Arc::new(MemoryBackend::new(
            internal_config.casper.storage.max_size,
            None,
        )),
        &internal_config.casper.storage,
    );
    store.connect().await?;

    let filters = Arc::new(FilterRegistry::new());
    filters.validate(&snapshot)?;

    let chain = build_chain(store.clone(), filters, metrics.clone());

    let zipkin = internal_config
        .zipkin
        .as_ref()
        .and_then(|zipkin| zipkin.syslog.as_ref())
        .map(|syslog| ZipkinReporter::new(&syslog.host, syslog.port))
        .transpose()?
        .map(Arc::new);

    let _watcher = registry.spawn_watcher();

    let service = CasperService::new(
        registry,
        chain,
        UpstreamClient::new(),
        InternalEndpoints::new(store, metrics.clone(), worker_id),
        metrics,
        zipkin,
    );

    let listen = internal_config.main.listen.clone();
    tracing::info!("Listening on {}:{}", listen.host, listen.port);
    run_http_service(&listen.host, listen.port, service).await
}

/// The default chain: cacheability evaluation, then the bulk handler, then
/// the single-endpoint handler; the upstream forwarder closes the chain.
pub fn build_chain(
    store: CacheStore,
    filters: Arc<FilterRegistry>,
    metrics: Arc<ProxyMetrics>,
) -> MiddlewareChain {
    let middlewares: Vec<Arc<dyn Middleware>> = vec![
        Arc::new(SpectreMiddleware::new(metrics.clone())),
        Arc::new(BulkEndpointMiddleware::new(
            store.clone(),
            UpstreamClient::new(),
            metrics.clone(),
        )),
        Arc::new(SingleEndpointMiddleware::new(store, filters, metrics)),
    ];
    MiddlewareChain::new(middlewares)
}
