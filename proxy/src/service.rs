use async_trait::async_trait;
use bytes::Bytes;
use http::header::HeaderValue;
use http_body_util::{BodyExt, Full};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use shared::http::{all_header_values, make_error_response};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crate::context::RequestContext;
use crate::errors::ProxyError;
use crate::internal::InternalEndpoints;
use crate::metrics::ProxyMetrics;
use crate::middleware::{Forwarder, MiddlewareChain};
use crate::registry::ConfigRegistry;
use crate::trace::ZipkinReporter;
use crate::types::CasperResponse;
use crate::upstream::UpstreamClient;

const SMARTSTACK_SOURCE: &str = "x-smartstack-source";
const SMARTSTACK_DESTINATION: &str = "x-smartstack-destination";
const CACHE_STATUS_HEADER: &str = "spectre-cache-status";

/// Hard wall-clock bound on the post-flush work of one request.
const AFTER_RESPONSE_DEADLINE: Duration = Duration::from_secs(30);

/// The driver wrapping every inbound request: classifies proxied vs
/// internal, runs the middleware chain, emits the response and schedules the
/// post-response callbacks.
pub struct CasperService {
    registry: Arc<ConfigRegistry>,
    chain: Arc<MiddlewareChain>,
    forwarder: Arc<UpstreamForwarder>,
    internal: Arc<InternalEndpoints>,
    metrics: Arc<ProxyMetrics>,
    zipkin: Option<Arc<ZipkinReporter>>,
    remote_addr: Option<SocketAddr>,
}

impl CasperService {
    pub fn new(
        registry: Arc<ConfigRegistry>,
        chain: MiddlewareChain,
        upstream: UpstreamClient,
        internal: InternalEndpoints,
        metrics: Arc<ProxyMetrics>,
        zipkin: Option<Arc<ZipkinReporter>>,
    ) -> Self {
        CasperService {
            registry,
            chain: Arc::new(chain),
            forwarder: Arc::new(UpstreamForwarder { client: upstream }),
            internal: Arc::new(internal),
            metrics,
            zipkin,
            remote_addr: None,
        }
    }
}

/// Default tail of the chain: nothing short-circuited, so the request is
/// sent to its destination.
struct UpstreamForwarder {
    client: UpstreamClient,
}

#[async_trait]
impl Forwarder for UpstreamForwarder {
    async fn forward(&self, ctx: &mut RequestContext) -> CasperResponse {
        let deadline = ctx.snapshot.internal.casper.http.timeout();
        self.client
            .forward(
                &ctx.snapshot,
                &ctx.destination,
                ctx.method.clone(),
                &ctx.uri,
                ctx.headers.clone(),
                ctx.body.clone(),
                ctx.trace.as_ref(),
                deadline,
            )
            .await
    }
}

/// How the driver classified an inbound request.
enum RequestClass {
    Proxied { source: String, destination: String },
    Internal,
    Malformed(String),
}

fn classify(headers: &http::HeaderMap) -> RequestClass {
    let sources = all_header_values(headers, SMARTSTACK_SOURCE);
    let destinations = all_header_values(headers, SMARTSTACK_DESTINATION);

    let mut diagnostic = String::new();
    for (name, values) in [
        ("X-Smartstack-Source", &sources),
        ("X-Smartstack-Destination", &destinations),
    ] {
        if values.len() > 1 {
            diagnostic.push_str(&format!(
                "{name} has multiple values: {};",
                values.join(" ")
            ));
        }
    }
    if !diagnostic.is_empty() {
        return RequestClass::Malformed(diagnostic);
    }

    match (sources.first(), destinations.first()) {
        (Some(source), Some(destination)) => RequestClass::Proxied {
            source: source.to_string(),
            destination: destination.to_string(),
        },
        _ => RequestClass::Internal,
    }
}

impl CasperService {
    async fn handle_proxied(
        &self,
        request: Request<hyper::body::Incoming>,
        source: String,
        destination: String,
    ) -> Response<Full<Bytes>> {
        let snapshot = self.registry.snapshot();
        let (parts, body) = request.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return make_error_response(
                    StatusCode::BAD_REQUEST,
                    Some(format!("Failed to read request body: {e}")),
                )
                .map(Full::new)
            }
        };

        let uri = parts
            .uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());

        let mut ctx = RequestContext::new(
            parts.method,
            uri,
            parts.headers,
            body,
            self.remote_addr,
            destination,
            source,
            snapshot,
        );

        let outcome = self.chain.run(&mut ctx, self.forwarder.as_ref()).await;
        let response = outcome.response;
        ctx.end_time = Some(Instant::now());
        ctx.response_status = Some(response.status);

        let http_response = decorate_response(&ctx, response.clone());
        let sync_write = ctx.sync_write;

        // Everything after this point must not delay the client: the cache
        // write, timing metrics and the trace span run detached once the
        // response is on the wire. `X-Casper-Sync: 1` reorders that so tests
        // can observe the write.
        let chain = self.chain.clone();
        let metrics = self.metrics.clone();
        let zipkin = self.zipkin.clone();
        let ran = outcome.ran;
        let after = async move {
            let work = async {
                chain.run_after_response(&mut ctx, &response, ran).await;
                emit_request_observability(&ctx, &metrics, zipkin.as_deref());
            };
            if tokio::time::timeout(AFTER_RESPONSE_DEADLINE, work).await.is_err() {
                tracing::warn!("after_response work exceeded its deadline");
            }
        };

        if sync_write {
            after.await;
        } else {
            tokio::spawn(after);
        }

        http_response
    }
}

fn decorate_response(ctx: &RequestContext, response: CasperResponse) -> Response<Full<Bytes>> {
    let is_proxied = response.is_proxied();
    let upstream_status = response.status;
    let mut http_response = response.into_http();
    let headers = http_response.headers_mut();

    // Exactly one cache-status header per proxied response
    headers.remove(CACHE_STATUS_HEADER);
    let status_tag = ctx
        .cache_status
        .as_ref()
        .map(|status| status.to_string())
        .unwrap_or_else(|| "miss".to_string());
    if let Ok(value) = HeaderValue::from_str(&status_tag) {
        headers.insert(CACHE_STATUS_HEADER, value);
    }

    if is_proxied {
        if let Ok(value) = HeaderValue::from_str(&upstream_status.as_u16().to_string()) {
            headers.insert("x-original-status", value);
        }
    }

    if let Some(trace) = &ctx.trace {
        if let Ok(value) = HeaderValue::from_str(&trace.trace_id) {
            headers.insert("x-zipkin-id", value);
        }
    }

    http_response
}

fn emit_request_observability(
    ctx: &RequestContext,
    metrics: &ProxyMetrics,
    zipkin: Option<&ZipkinReporter>,
) {
    let elapsed_ms = ctx
        .end_time
        .unwrap_or_else(Instant::now)
        .duration_since(ctx.start_time)
        .as_millis() as u64;
    let status = ctx
        .response_status
        .map(|status| status.as_u16())
        .unwrap_or(0);
    metrics.request_timing(&ctx.destination, ctx.cache_name_dim(), status, elapsed_ms);

    if let (Some(zipkin), Some(trace)) = (zipkin, &ctx.trace) {
        let client_ip = ctx
            .remote_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_default();
        zipkin.report(
            trace,
            ctx.start_wall,
            SystemTime::now(),
            &client_ip,
            &ctx.cache_status_string(),
            ctx.method.as_str(),
            &ctx.uri,
        );
    }
}

impl Service<Request<hyper::body::Incoming>> for CasperService {
    type Response = Response<Full<Bytes>>;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, request: Request<hyper::body::Incoming>) -> Self::Future {
        // PURGE is never proxied, whatever smartstack headers it carries
        let class = if request.method().as_str() == "PURGE" {
            RequestClass::Internal
        } else {
            classify(request.headers())
        };

        match class {
            RequestClass::Malformed(diagnostic) => Box::pin(async move {
                Ok(make_error_response(StatusCode::BAD_REQUEST, Some(diagnostic)).map(Full::new))
            }),
            RequestClass::Internal => {
                let registry = self.registry.clone();
                let internal = self.internal.clone();
                Box::pin(async move {
                    let snapshot = registry.snapshot();
                    let method = request.method().clone();
                    let path = request.uri().path().to_string();
                    let query = request.uri().query().unwrap_or("").to_string();
                    let fallback_namespace = request
                        .headers()
                        .get(SMARTSTACK_DESTINATION)
                        .and_then(|v| v.to_str().ok())
                        .map(String::from);
                    let response = internal
                        .handle(
                            &method,
                            &path,
                            &query,
                            &snapshot,
                            fallback_namespace.as_deref(),
                        )
                        .await;
                    Ok(response.into_http())
                })
            }
            RequestClass::Proxied {
                source,
                destination,
            } => {
                let service = self.clone_for_request();
                Box::pin(async move {
                    Ok(service.handle_proxied(request, source, destination).await)
                })
            }
        }
    }
}

impl CasperService {
    fn clone_for_request(&self) -> CasperService {
        CasperService {
            registry: self.registry.clone(),
            chain: self.chain.clone(),
            forwarder: self.forwarder.clone(),
            internal: self.internal.clone(),
            metrics: self.metrics.clone(),
            zipkin: self.zipkin.clone(),
            remote_addr: self.remote_addr,
        }
    }
}
