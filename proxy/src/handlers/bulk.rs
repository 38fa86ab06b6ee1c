use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::{Method, StatusCode};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::CacheEntry;
use crate::context::{BulkStoreItem, RequestContext, StorePlan};
use crate::errors::ProxyError;
use crate::handlers::single::cacheable_headers;
use crate::keys;
use crate::metrics::ProxyMetrics;
use crate::middleware::Middleware;
use crate::normalize::normalize_uri;
use crate::storage::{CacheStore, StoredResponse};
use crate::types::{CacheStatus, CasperResponse};
use crate::upstream::UpstreamClient;

/// Escapes an id the way it appears inside a request URI: everything but
/// unreserved characters is percent-encoded.
const URI_ID_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Splits a multi-id GET into per-id cache lookups, fetches only the misses
/// in one upstream call, and stitches the ordered JSON array back together.
pub struct BulkEndpointMiddleware {
    store: CacheStore,
    upstream: UpstreamClient,
    metrics: Arc<ProxyMetrics>,
}

/// Outcome of one per-id lookup. `null` records are kept distinct from
/// absence so a cached "no such id" never turns into a refetch.
enum Slot {
    Hit(JsonValue),
    Null,
    Miss,
}

/// The bulk request decomposed against the entry's pattern: the id list
/// (capture group 2) plus everything around it.
struct BulkParts {
    prefix: String,
    suffix: String,
    separator: &'static str,
    ids: Vec<String>,
}

impl BulkParts {
    fn parse(entry: &CacheEntry, normalized_uri: &str) -> Option<BulkParts> {
        let captures = entry.pattern.captures(normalized_uri)?;
        let group = captures.get(2)?;
        let ids_str = group.as_str();
        // Whichever separator actually splits the list wins; a single id
        // keeps the escaped form
        let separator = if ids_str.contains("%2C") { "%2C" } else { "," };
        Some(BulkParts {
            prefix: normalized_uri[..group.start()].to_string(),
            suffix: normalized_uri[group.end()..].to_string(),
            separator,
            ids: ids_str.split(separator).map(String::from).collect(),
        })
    }

    fn uri_for(&self, ids: &str) -> String {
        normalize_uri(&format!("{}{}{}", self.prefix, ids, self.suffix))
    }
}

impl BulkEndpointMiddleware {
    pub fn new(store: CacheStore, upstream: UpstreamClient, metrics: Arc<ProxyMetrics>) -> Self {
        BulkEndpointMiddleware {
            store,
            upstream,
            metrics,
        }
    }

    fn is_active(ctx: &RequestContext) -> bool {
        ctx.method == Method::GET
            && ctx.cacheability.is_cacheable
            && ctx
                .cache_entry()
                .map(|entry| entry.bulk_support)
                .unwrap_or(false)
    }
}

#[async_trait]
impl Middleware for BulkEndpointMiddleware {
    fn name(&self) -> &'static str {
        "bulk"
    }

    async fn on_request(
        &self,
        ctx: &mut RequestContext,
    ) -> Result<Option<CasperResponse>, ProxyError> {
        if !Self::is_active(ctx) {
            return Ok(None);
        }
        let entry = ctx.cache_entry().cloned().expect("active implies an entry");
        let cache_name = ctx.cache_name().to_string();
        let namespace = ctx.destination.clone();

        let Some(parts) = BulkParts::parse(&entry, &ctx.normalized_uri) else {
            // The v2 pattern matched but the parse pattern does not carry the
            // id group; treat the request as a plain single endpoint
            return Ok(None);
        };

        // Per-id URIs and keys, then all lookups concurrently
        let per_id_keys: Vec<Vec<String>> = parts
            .ids
            .iter()
            .map(|id| {
                keys::derive_primary_key(
                    &Method::GET,
                    &parts.uri_for(id),
                    b"",
                    &ctx.headers,
                    &namespace,
                    &cache_name,
                    &entry,
                    ctx.service_config.as_deref(),
                )
                .parts
            })
            .collect();

        let lookups = per_id_keys
            .iter()
            .map(|key_parts| self.store.get(keys::storage_key(key_parts)));
        let results = futures::future::join_all(lookups).await;

        // Collate hits by ordinal; remember the header pool
        let mut slots = Vec::with_capacity(results.len());
        let mut header_pool = HeaderMap::new();
        for result in results {
            let slot = match result {
                Ok(Some(stored)) => {
                    for (name, value) in &stored.headers {
                        header_pool.insert(name.clone(), value.clone());
                    }
                    decode_slot(&stored.body)
                }
                Ok(None) => Slot::Miss,
                Err(e) => {
                    tracing::warn!("Bulk cache read failed: {e}");
                    ctx.read_failure = true;
                    Slot::Miss
                }
            };
            let status = match &slot {
                Slot::Miss => "miss",
                _ => "hit",
            };
            self.metrics.fetch(&namespace, &cache_name, status);
            slots.push(slot);
        }

        let miss_ordinals: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(slot, Slot::Miss))
            .map(|(ordinal, _)| ordinal)
            .collect();

        let mut final_elements: Vec<Option<JsonValue>> = slots
            .into_iter()
            .map(|slot| match slot {
                Slot::Hit(element) => Some(element),
                Slot::Null | Slot::Miss => None,
            })
            .collect();

        if miss_ordinals.is_empty() {
            // Every id was served from storage; the upstream is never
            // contacted
            ctx.cache_status = Some(CacheStatus::Hit);
            self.metrics.bulk_hit_rate(&namespace, &cache_name, "hit");
            let body = assemble(&final_elements)?;
            header_pool.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            return Ok(Some(CasperResponse::cached(
                StatusCode::OK,
                header_pool,
                body,
            )));
        }

        // One upstream round-trip for the misses only, joined with the
        // separator the request used
        let mut miss_ids: Vec<&str> = Vec::new();
        let mut seen = HashSet::new();
        for &ordinal in &miss_ordinals {
            let id = parts.ids[ordinal].as_str();
            if seen.insert(id) {
                miss_ids.push(id);
            }
        }
        let miss_uri = parts.uri_for(&miss_ids.join(parts.separator));
        let deadline = ctx.snapshot.internal.casper.http.timeout();
        let upstream_response = self
            .upstream
            .forward(
                &ctx.snapshot,
                &namespace,
                Method::GET,
                &miss_uri,
                ctx.headers.clone(),
                Bytes::new(),
                ctx.trace.as_ref(),
                deadline,
            )
            .await;

        self.metrics.bulk_hit_rate(&namespace, &cache_name, "miss");

        if upstream_response.status != StatusCode::OK {
            ctx.cache_status = Some(CacheStatus::NonCacheableResponse(
                upstream_response.status.as_u16(),
            ));
            return Ok(Some(upstream_response));
        }

        let content_type = upstream_response
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.starts_with("application/json") {
            ctx.cache_status = Some(CacheStatus::UnprocessableResponse(content_type));
            return Ok(Some(upstream_response));
        }

        let Ok(JsonValue::Array(elements)) =
            serde_json::from_slice::<JsonValue>(&upstream_response.body)
        else {
            ctx.cache_status = Some(CacheStatus::UnprocessableResponse(content_type));
            return Ok(Some(upstream_response));
        };

        // Key the upstream elements by their escaped id and fill the miss
        // ordinals by their original id
        let id_identifier = entry.id_identifier.as_deref().unwrap_or("id");
        let mut by_id: HashMap<String, JsonValue> = HashMap::new();
        for element in elements {
            let Some(id_value) = element.get(id_identifier) else {
                continue;
            };
            let raw = match id_value {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            let escaped = utf8_percent_encode(&raw, URI_ID_ESCAPE).to_string();
            by_id.insert(escaped, element);
        }
        for &ordinal in &miss_ordinals {
            final_elements[ordinal] = by_id.get(&parts.ids[ordinal]).cloned();
        }

        for (name, value) in &upstream_response.headers {
            header_pool.insert(name.clone(), value.clone());
        }

        // Plan the per-id writes unless a read failure poisoned this request
        if !ctx.read_failure {
            let stored_headers = cacheable_headers(&header_pool, &ctx.uncacheable_headers());
            let mut items = Vec::new();
            let mut planned = HashSet::new();
            for &ordinal in &miss_ordinals {
                let id = &parts.ids[ordinal];
                if !planned.insert(id.clone()) {
                    continue;
                }
                let body = match &final_elements[ordinal] {
                    Some(element) => Bytes::from(
                        serde_json::to_vec(&[element]).map_err(|e| {
                            ProxyError::InternalError(format!("failed to encode element: {e}"))
                        })?,
                    ),
                    None if !entry.dont_cache_missing_ids => Bytes::from_static(b"null"),
                    None => continue,
                };
                items.push(BulkStoreItem {
                    key: per_id_keys[ordinal].clone(),
                    surrogate_keys: keys::surrogate_keys(&namespace, &cache_name, Some(id)),
                    body,
                });
            }
            if !items.is_empty() {
                ctx.store_plan = Some(StorePlan::Bulk {
                    items,
                    headers: stored_headers,
                    ttl: entry.ttl,
                });
            }
        }

        ctx.cache_status = Some(CacheStatus::Miss);
        let body = assemble(&final_elements)?;
        header_pool.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(Some(CasperResponse::proxied(
            StatusCode::OK,
            header_pool,
            body,
        )))
    }

    async fn after_response(
        &self,
        ctx: &mut RequestContext,
        _response: &CasperResponse,
    ) -> Result<(), ProxyError> {
        // A Single plan belongs to the next handler in the chain
        if !matches!(ctx.store_plan, Some(StorePlan::Bulk { .. })) {
            return Ok(());
        }
        let Some(StorePlan::Bulk {
            items,
            headers,
            ttl,
        }) = ctx.store_plan.take()
        else {
            return Ok(());
        };

        for item in items {
            let stored = StoredResponse {
                status: StatusCode::OK,
                headers: headers.clone(),
                body: item.body,
            };
            let surrogates: Vec<Bytes> = item
                .surrogate_keys
                .iter()
                .map(|sk| Bytes::from(sk.clone()))
                .collect();
            self.store
                .store(keys::storage_key(&item.key), stored, surrogates, ttl)
                .await;
            self.metrics.store(&ctx.destination, ctx.cache_name());
        }
        Ok(())
    }
}

fn decode_slot(body: &Bytes) -> Slot {
    if body.as_ref() == b"null" {
        return Slot::Null;
    }
    match serde_json::from_slice::<JsonValue>(body) {
        Ok(JsonValue::Array(mut elements)) if elements.len() == 1 => {
            Slot::Hit(elements.remove(0))
        }
        _ => Slot::Miss,
    }
}

/// The final array in ordinal order, nil slots removed.
fn assemble(final_elements: &[Option<JsonValue>]) -> Result<Bytes, ProxyError> {
    let compact: Vec<&JsonValue> = final_elements.iter().flatten().collect();
    let body = serde_json::to_vec(&compact)
        .map_err(|e| ProxyError::InternalError(format!("failed to encode bulk body: {e}")))?;
    Ok(Bytes::from(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_service_config, SmartstackEntry, StorageConfig};
    use crate::handlers::SpectreMiddleware;
    use crate::middleware::{Forwarder, MiddlewareChain};
    use crate::registry::Snapshot;
    use crate::storage::MemoryBackend;
    use http_body_util::Full;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioExecutor;
    use parking_lot::Mutex;
    use std::convert::Infallible;
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct PanicForwarder;

    #[async_trait]
    impl Forwarder for PanicForwarder {
        async fn forward(&self, _ctx: &mut RequestContext) -> CasperResponse {
            panic!("bulk requests must not reach the default forwarder");
        }
    }

    /// Upstream returning one JSON element per requested id, recording URIs.
    async fn start_bulk_upstream(
        requests: Arc<Mutex<Vec<String>>>,
        content_type: &'static str,
        status: StatusCode,
    ) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = hyper_util::rt::TokioIo::new(stream);
                let requests = requests.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let requests = requests.clone();
                        async move {
                            let uri = req.uri().to_string();
                            requests.lock().push(uri.clone());
                            // ids are between "ids=" and the next "&"
                            let ids_part = uri
                                .split("ids=")
                                .nth(1)
                                .unwrap_or("")
                                .split('&')
                                .next()
                                .unwrap_or("");
                            let separator = if ids_part.contains("%2C") { "%2C" } else { "," };
                            let elements: Vec<JsonValue> = ids_part
                                .split(separator)
                                .filter(|id| !id.is_empty())
                                // the upstream drops "invalid" ids above 999
                                .filter(|id| id.parse::<u64>().map(|n| n < 1000).unwrap_or(true))
                                .map(|id| {
                                    serde_json::json!({
                                        "id": id.parse::<u64>().ok().map(JsonValue::from)
                                            .unwrap_or_else(|| JsonValue::String(id.to_string())),
                                        "n": format!("item-{id}"),
                                    })
                                })
                                .collect();
                            let body = serde_json::to_vec(&elements).unwrap();
                            let response = Response::builder()
                                .status(status)
                                .header(CONTENT_TYPE, content_type)
                                .header("pool-header", "from-upstream")
                                .body(Full::new(Bytes::from(body)))
                                .unwrap();
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        port
    }

    const BULK_YAML: &[u8] = br#"
cached_endpoints:
  users:
    pattern: "^(/users\\?ids=)((\\d|%2C)+)(&v=1)$"
    ttl: 60
    bulk_support: true
    id_identifier: id
  no_missing:
    pattern: "^(/sparse\\?ids=)((\\d|%2C)+)(&v=1)$"
    ttl: 60
    bulk_support: true
    id_identifier: id
    dont_cache_missing_ids: true
"#;

    struct Harness {
        chain: MiddlewareChain,
        store: CacheStore,
        snapshot: Arc<Snapshot>,
    }

    fn harness(port: u16) -> Harness {
        let config = parse_service_config(BULK_YAML).unwrap();
        let mut services = HashMap::new();
        services.insert("backend.main".to_string(), Arc::new(config));
        let mut snapshot = Snapshot {
            services,
            ..Default::default()
        };
        snapshot.smartstack.insert(
            "backend.main".to_string(),
            SmartstackEntry {
                host: "127.0.0.1".to_string(),
                port,
            },
        );
        let snapshot = Arc::new(snapshot);

        let store = CacheStore::new(
            Arc::new(MemoryBackend::new(16 * 1024 * 1024, None)),
            &StorageConfig::default(),
        );
        let metrics = Arc::new(ProxyMetrics::noop());
        let chain = MiddlewareChain::new(vec![
            Arc::new(SpectreMiddleware::new(metrics.clone())),
            Arc::new(BulkEndpointMiddleware::new(
                store.clone(),
                UpstreamClient::new(),
                metrics,
            )),
        ]);
        Harness {
            chain,
            store,
            snapshot,
        }
    }

    impl Harness {
        fn context(&self, uri: &str) -> RequestContext {
            RequestContext::new(
                Method::GET,
                uri.to_string(),
                HeaderMap::new(),
                Bytes::new(),
                None,
                "backend.main".to_string(),
                "client.main".to_string(),
                self.snapshot.clone(),
            )
        }

        async fn run(&self, uri: &str) -> (RequestContext, CasperResponse) {
            let mut ctx = self.context(uri);
            let outcome = self.chain.run(&mut ctx, &PanicForwarder).await;
            self.chain
                .run_after_response(&mut ctx, &outcome.response, outcome.ran)
                .await;
            (ctx, outcome.response)
        }

        /// Seeds the cache for one id exactly as the handler would store it.
        async fn seed(&self, cache_name: &str, uri_template: &str, id: &str, element: JsonValue) {
            let config = self.snapshot.service("backend.main").unwrap();
            let entry = config.entry(cache_name).unwrap();
            let uri = normalize_uri(&uri_template.replace("{id}", id));
            let derived = keys::derive_primary_key(
                &Method::GET,
                &uri,
                b"",
                &HeaderMap::new(),
                "backend.main",
                cache_name,
                entry,
                Some(&config),
            );
            let body = Bytes::from(serde_json::to_vec(&[element]).unwrap());
            self.store
                .store(
                    keys::storage_key(&derived.parts),
                    StoredResponse {
                        status: StatusCode::OK,
                        headers: HeaderMap::new(),
                        body,
                    },
                    vec![
                        Bytes::from(format!("backend.main|{cache_name}")),
                        Bytes::from(format!("backend.main|{cache_name}|{id}")),
                    ],
                    Duration::from_secs(60),
                )
                .await;
        }
    }

    fn body_json(response: &CasperResponse) -> JsonValue {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[tokio::test]
    async fn test_fan_out_fetches_only_misses_and_preserves_order() {
        let requests: Arc<Mutex<Vec<String>>> = Default::default();
        let port = start_bulk_upstream(requests.clone(), "application/json", StatusCode::OK).await;
        let harness = harness(port);

        harness
            .seed(
                "users",
                "/users?ids={id}&v=1",
                "1",
                serde_json::json!({"id": 1, "n": "cached-1"}),
            )
            .await;
        harness
            .seed(
                "users",
                "/users?ids={id}&v=1",
                "3",
                serde_json::json!({"id": 3, "n": "cached-3"}),
            )
            .await;

        let (ctx, response) = harness.run("/users?ids=1%2C2%2C3&v=1").await;

        // Only id 2 was fetched upstream
        assert_eq!(requests.lock().as_slice(), ["/users?ids=2&v=1"]);

        assert_eq!(ctx.cache_status, Some(CacheStatus::Miss));
        assert!(response.is_proxied());
        let body = body_json(&response);
        assert_eq!(
            body,
            serde_json::json!([
                {"id": 1, "n": "cached-1"},
                {"id": 2, "n": "item-2"},
                {"id": 3, "n": "cached-3"},
            ])
        );

        // id 2 got written back: a repeat request is all-hit
        let (ctx, response) = harness.run("/users?ids=1%2C2%2C3&v=1").await;
        assert_eq!(ctx.cache_status, Some(CacheStatus::Hit));
        assert!(response.is_cached());
        assert_eq!(requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_all_hits_skip_upstream() {
        let requests: Arc<Mutex<Vec<String>>> = Default::default();
        let port = start_bulk_upstream(requests.clone(), "application/json", StatusCode::OK).await;
        let harness = harness(port);

        for id in ["4", "5"] {
            harness
                .seed(
                    "users",
                    "/users?ids={id}&v=1",
                    id,
                    serde_json::json!({"id": id.parse::<u64>().unwrap()}),
                )
                .await;
        }

        let (ctx, response) = harness.run("/users?ids=5%2C4&v=1").await;
        assert!(requests.lock().is_empty());
        assert_eq!(ctx.cache_status, Some(CacheStatus::Hit));
        // Input order is preserved
        assert_eq!(body_json(&response), serde_json::json!([{"id": 5}, {"id": 4}]));
    }

    #[tokio::test]
    async fn test_cached_null_contributes_nothing() {
        let requests: Arc<Mutex<Vec<String>>> = Default::default();
        let port = start_bulk_upstream(requests.clone(), "application/json", StatusCode::OK).await;
        let harness = harness(port);

        harness
            .seed(
                "users",
                "/users?ids={id}&v=1",
                "7",
                serde_json::json!({"id": 7}),
            )
            .await;
        // A stored JSON null marks a known-missing id
        {
            let config = harness.snapshot.service("backend.main").unwrap();
            let entry = config.entry("users").unwrap();
            let derived = keys::derive_primary_key(
                &Method::GET,
                &normalize_uri("/users?ids=8&v=1"),
                b"",
                &HeaderMap::new(),
                "backend.main",
                "users",
                entry,
                Some(&config),
            );
            harness
                .store
                .store(
                    keys::storage_key(&derived.parts),
                    StoredResponse {
                        status: StatusCode::OK,
                        headers: HeaderMap::new(),
                        body: Bytes::from_static(b"null"),
                    },
                    vec![],
                    Duration::from_secs(60),
                )
                .await;
        }

        let (ctx, response) = harness.run("/users?ids=7%2C8&v=1").await;
        // Both were hits; the null id is simply absent from the output
        assert!(requests.lock().is_empty());
        assert_eq!(ctx.cache_status, Some(CacheStatus::Hit));
        assert_eq!(body_json(&response), serde_json::json!([{"id": 7}]));
    }

    #[tokio::test]
    async fn test_missing_ids_cached_as_null_by_default() {
        let requests: Arc<Mutex<Vec<String>>> = Default::default();
        let port = start_bulk_upstream(requests.clone(), "application/json", StatusCode::OK).await;
        let harness = harness(port);

        // 5000 is dropped by the upstream; with the default policy the
        // absence itself is cached
        let (_, response) = harness.run("/users?ids=10%2C5000%2C11&v=1").await;
        assert_eq!(body_json(&response).as_array().unwrap().len(), 2);

        let (ctx, response) = harness.run("/users?ids=5000&v=1").await;
        assert_eq!(ctx.cache_status, Some(CacheStatus::Hit));
        assert_eq!(body_json(&response), serde_json::json!([]));
        assert_eq!(requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_dont_cache_missing_ids() {
        let requests: Arc<Mutex<Vec<String>>> = Default::default();
        let port = start_bulk_upstream(requests.clone(), "application/json", StatusCode::OK).await;
        let harness = harness(port);

        let (_, response) = harness.run("/sparse?ids=10%2C5000&v=1").await;
        assert_eq!(body_json(&response).as_array().unwrap().len(), 1);

        // The invalid id was not cached: asking again goes upstream again
        let (ctx, _) = harness.run("/sparse?ids=5000&v=1").await;
        assert_eq!(ctx.cache_status, Some(CacheStatus::Miss));
        assert_eq!(requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_ids_each_get_their_element() {
        let requests: Arc<Mutex<Vec<String>>> = Default::default();
        let port = start_bulk_upstream(requests.clone(), "application/json", StatusCode::OK).await;
        let harness = harness(port);

        let (_, response) = harness.run("/users?ids=6%2C5%2C6%2C5&v=1").await;
        let body = body_json(&response);
        assert_eq!(body.as_array().unwrap().len(), 4);
        assert_eq!(body[0]["id"], 6);
        assert_eq!(body[1]["id"], 5);
        assert_eq!(body[2]["id"], 6);
        assert_eq!(body[3]["id"], 5);
        // The upstream saw each id once
        assert_eq!(requests.lock().as_slice(), ["/users?ids=6%2C5&v=1"]);
    }

    #[tokio::test]
    async fn test_comma_separator_round_trip() {
        let requests: Arc<Mutex<Vec<String>>> = Default::default();
        let port = start_bulk_upstream(requests.clone(), "application/json", StatusCode::OK).await;

        // Path-style entry using plain commas
        let config = parse_service_config(
            br#"
cached_endpoints:
  path_bulk:
    pattern: "^(/bulk/)((\\d|,)+)(/v1\\?k1=v2)$"
    ttl: 60
    bulk_support: true
    id_identifier: id
"#,
        )
        .unwrap();
        let mut services = HashMap::new();
        services.insert("backend.main".to_string(), Arc::new(config));
        let mut snapshot = Snapshot {
            services,
            ..Default::default()
        };
        snapshot.smartstack.insert(
            "backend.main".to_string(),
            SmartstackEntry {
                host: "127.0.0.1".to_string(),
                port,
            },
        );
        let snapshot = Arc::new(snapshot);
        let store = CacheStore::new(
            Arc::new(MemoryBackend::new(16 * 1024 * 1024, None)),
            &StorageConfig::default(),
        );
        let metrics = Arc::new(ProxyMetrics::noop());
        let chain = MiddlewareChain::new(vec![
            Arc::new(SpectreMiddleware::new(metrics.clone())),
            Arc::new(BulkEndpointMiddleware::new(
                store,
                UpstreamClient::new(),
                metrics,
            )),
        ]);

        let mut ctx = RequestContext::new(
            Method::GET,
            "/bulk/1,2,3/v1?k1=v2".to_string(),
            HeaderMap::new(),
            Bytes::new(),
            None,
            "backend.main".to_string(),
            "client.main".to_string(),
            snapshot,
        );
        let outcome = chain.run(&mut ctx, &PanicForwarder).await;
        assert_eq!(outcome.response.status, StatusCode::OK);
        // Misses are joined with the same separator the request used
        assert_eq!(requests.lock().as_slice(), ["/bulk/1,2,3/v1?k1=v2"]);
    }

    #[tokio::test]
    async fn test_non_json_upstream_passes_through_with_reason() {
        let requests: Arc<Mutex<Vec<String>>> = Default::default();
        let port = start_bulk_upstream(requests.clone(), "text", StatusCode::OK).await;
        let harness = harness(port);

        let (ctx, response) = harness.run("/users?ids=4%2C5&v=1").await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(
            ctx.cache_status,
            Some(CacheStatus::UnprocessableResponse("text".into()))
        );
        assert!(ctx.store_plan.is_none());
    }

    #[tokio::test]
    async fn test_non_200_upstream_passes_through_unchanged() {
        let requests: Arc<Mutex<Vec<String>>> = Default::default();
        let port =
            start_bulk_upstream(requests.clone(), "application/json", StatusCode::FORBIDDEN).await;
        let harness = harness(port);

        let (ctx, response) = harness.run("/users?ids=1&v=1").await;
        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert_eq!(
            ctx.cache_status,
            Some(CacheStatus::NonCacheableResponse(403))
        );
        assert!(ctx.store_plan.is_none());

        // Nothing was written back
        let (ctx, _) = harness.run("/users?ids=1&v=1").await;
        assert_eq!(
            ctx.cache_status,
            Some(CacheStatus::NonCacheableResponse(403))
        );
        assert_eq!(requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_escaped_unicode_ids_round_trip() {
        // Upstream returns the decoded unicode slug under bulk_id
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = hyper_util::rt::TokioIo::new(stream);
                tokio::spawn(async move {
                    let service = service_fn(|_req: Request<hyper::body::Incoming>| async {
                        let body = serde_json::to_vec(&serde_json::json!([
                            {"bulk_id": "délfínä-san-francisco-2", "ok": true}
                        ]))
                        .unwrap();
                        Ok::<_, Infallible>(
                            Response::builder()
                                .header(CONTENT_TYPE, "application/json")
                                .body(Full::new(Bytes::from(body)))
                                .unwrap(),
                        )
                    });
                    let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                });
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let config = parse_service_config(
            br#"
cached_endpoints:
  slugs:
    pattern: "^(/slugs\\?ids=)(([\\w%.~-])+)(&v=1)$"
    ttl: 60
    bulk_support: true
    id_identifier: bulk_id
"#,
        )
        .unwrap();
        let mut services = HashMap::new();
        services.insert("backend.main".to_string(), Arc::new(config));
        let mut snapshot = Snapshot {
            services,
            ..Default::default()
        };
        snapshot.smartstack.insert(
            "backend.main".to_string(),
            SmartstackEntry {
                host: "127.0.0.1".to_string(),
                port,
            },
        );
        let snapshot = Arc::new(snapshot);
        let store = CacheStore::new(
            Arc::new(MemoryBackend::new(16 * 1024 * 1024, None)),
            &StorageConfig::default(),
        );
        let metrics = Arc::new(ProxyMetrics::noop());
        let chain = MiddlewareChain::new(vec![
            Arc::new(SpectreMiddleware::new(metrics.clone())),
            Arc::new(BulkEndpointMiddleware::new(
                store,
                UpstreamClient::new(),
                metrics,
            )),
        ]);

        let uri = "/slugs?ids=d%C3%A9lf%C3%ADn%C3%A4-san-francisco-2&v=1";
        let mut ctx = RequestContext::new(
            Method::GET,
            uri.to_string(),
            HeaderMap::new(),
            Bytes::new(),
            None,
            "backend.main".to_string(),
            "client.main".to_string(),
            snapshot.clone(),
        );
        let outcome = chain.run(&mut ctx, &PanicForwarder).await;
        chain
            .run_after_response(&mut ctx, &outcome.response, outcome.ran)
            .await;

        // The element was matched to the escaped id in the URI
        assert_eq!(ctx.cache_status, Some(CacheStatus::Miss));
        let body = body_json(&outcome.response);
        assert_eq!(body[0]["bulk_id"], "délfínä-san-francisco-2");

        // And written back under the per-id key: repeat is a hit
        let mut ctx = RequestContext::new(
            Method::GET,
            uri.to_string(),
            HeaderMap::new(),
            Bytes::new(),
            None,
            "backend.main".to_string(),
            "client.main".to_string(),
            snapshot,
        );
        let outcome = chain.run(&mut ctx, &PanicForwarder).await;
        assert_eq!(ctx.cache_status, Some(CacheStatus::Hit));
        assert_eq!(body_json(&outcome.response)[0]["ok"], true);
    }

    #[test]
    fn test_separator_detection() {
        let config = parse_service_config(BULK_YAML).unwrap();
        let entry = config.entry("users").unwrap();

        let parts = BulkParts::parse(entry, "/users?ids=1%2C2%2C3&v=1").unwrap();
        assert_eq!(parts.separator, "%2C");
        assert_eq!(parts.ids, vec!["1", "2", "3"]);

        let parts = BulkParts::parse(entry, "/users?ids=9&v=1").unwrap();
        assert_eq!(parts.ids, vec!["9"]);
        assert_eq!(parts.uri_for("9"), "/users?ids=9&v=1");
    }
}
