use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Method, StatusCode};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use crate::config::ServiceConfig;
use crate::metrics::ProxyMetrics;
use crate::registry::Snapshot;
use crate::storage::CacheStore;
use crate::types::CasperResponse;

/// Handles requests that are not proxied: health, config introspection,
/// purging and the Prometheus exposition.
pub struct InternalEndpoints {
    store: CacheStore,
    metrics: Arc<ProxyMetrics>,
    worker_id: usize,
}

impl InternalEndpoints {
    pub fn new(store: CacheStore, metrics: Arc<ProxyMetrics>, worker_id: usize) -> Self {
        InternalEndpoints {
            store,
            metrics,
            worker_id,
        }
    }

    pub async fn handle(
        &self,
        method: &Method,
        path: &str,
        query: &str,
        snapshot: &Snapshot,
        fallback_namespace: Option<&str>,
    ) -> CasperResponse {
        match (method.as_str(), path) {
            ("GET", "/status") => self.status(query, snapshot).await,
            ("GET", "/configs") => self.configs(snapshot),
            ("DELETE", "/purge") => self.purge(query, snapshot, fallback_namespace).await,
            // Legacy purge verb against the root
            ("PURGE", _) => self.purge(query, snapshot, fallback_namespace).await,
            ("GET", "/metrics") => {
                let mut response =
                    CasperResponse::synthetic(StatusCode::OK, self.metrics.render());
                response.headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            _ => CasperResponse::synthetic(
                StatusCode::NOT_FOUND,
                format!("Not found: {method} {path}"),
            ),
        }
    }

    async fn status(&self, query: &str, snapshot: &Snapshot) -> CasperResponse {
        let check_backend = query_param(query, "check_backend").as_deref() == Some("true");
        let backend_status = if check_backend {
            match self.store.connect().await {
                Ok(()) => "up",
                Err(_) => "down",
            }
        } else {
            "skipped"
        };

        let spectre_configs = if snapshot.services.is_empty() {
            "missing"
        } else {
            "present"
        };
        let smartstack_configs = if snapshot.smartstack.is_empty() {
            "missing"
        } else {
            "present"
        };

        let proxied_services: HashMap<&String, JsonValue> = snapshot
            .services
            .keys()
            .filter_map(|dest| {
                snapshot
                    .smartstack
                    .get(dest)
                    .map(|entry| (dest, json!({"host": &entry.host, "port": entry.port})))
            })
            .collect();

        let report = json!({
            "backend_status": backend_status,
            "spectre_configs": spectre_configs,
            "smartstack_configs": smartstack_configs,
            "proxied_services": proxied_services,
            "missing_smartstack": snapshot.destinations_missing_smartstack(),
        });

        let healthy =
            backend_status != "down" && spectre_configs == "present" && smartstack_configs == "present";
        let status = if healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        json_response(status, &report)
    }

    fn configs(&self, snapshot: &Snapshot) -> CasperResponse {
        let service_configs: HashMap<&String, JsonValue> = snapshot
            .services
            .iter()
            .map(|(dest, config)| (dest, service_config_report(config)))
            .collect();

        let mod_time_table: HashMap<String, u64> = snapshot
            .mod_times
            .iter()
            .map(|(path, mtime)| {
                let epoch = mtime
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                (path.display().to_string(), epoch)
            })
            .collect();

        let report = json!({
            "service_configs": service_configs,
            "smartstack_configs": &snapshot.smartstack,
            "mod_time_table": mod_time_table,
            "worker_id": self.worker_id,
        });
        json_response(StatusCode::OK, &report)
    }

    async fn purge(
        &self,
        query: &str,
        snapshot: &Snapshot,
        fallback_namespace: Option<&str>,
    ) -> CasperResponse {
        let namespace = match query_param(query, "namespace")
            .or_else(|| fallback_namespace.map(String::from))
        {
            Some(namespace) => namespace,
            None => {
                return CasperResponse::synthetic(
                    StatusCode::BAD_REQUEST,
                    "Missing required argument namespace",
                )
            }
        };
        let Some(cache_name) = query_param(query, "cache_name") else {
            return CasperResponse::synthetic(
                StatusCode::BAD_REQUEST,
                "Missing required argument cache_name",
            );
        };

        let Some(service_config) = snapshot.service(&namespace) else {
            return CasperResponse::synthetic(
                StatusCode::BAD_REQUEST,
                format!("Unknown namespace {namespace}"),
            );
        };
        if service_config.entry(&cache_name).is_none() {
            return CasperResponse::synthetic(
                StatusCode::BAD_REQUEST,
                format!("Unknown cache_name {cache_name} for namespace {namespace}"),
            );
        }

        // The narrowest surrogate wins: one id when given, the whole cache
        // otherwise
        let id = query_param(query, "id");
        let surrogate = match &id {
            Some(id) => format!("{namespace}|{cache_name}|{id}"),
            None => format!("{namespace}|{cache_name}"),
        };

        match self
            .store
            .delete_by_surrogates(&[Bytes::from(surrogate)])
            .await
        {
            Ok(_count) => {
                let mut message = format!("Purged namespace: {namespace} & cache_name: {cache_name}");
                if let Some(id) = id {
                    message.push_str(&format!(" & id: {id}"));
                }
                CasperResponse::synthetic(StatusCode::OK, message)
            }
            Err(e) => CasperResponse::synthetic(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Purge failed: {e}"),
            ),
        }
    }
}

fn service_config_report(config: &ServiceConfig) -> JsonValue {
    let cached_endpoints: HashMap<&String, JsonValue> = config
        .cached_endpoints
        .iter()
        .map(|(name, entry)| {
            (
                name,
                json!({
                    "pattern": entry.pattern.as_str(),
                    "pattern_v2": entry.pattern_v2.as_ref().map(|p| p.as_str()),
                    "ttl": entry.ttl.as_secs(),
                    "request_method": entry.request_method.as_str(),
                    "bulk_support": entry.bulk_support,
                    "id_identifier": &entry.id_identifier,
                    "enable_id_extraction": entry.enable_id_extraction,
                    "dont_cache_missing_ids": entry.dont_cache_missing_ids,
                    "vary_headers": &entry.vary_headers,
                    "vary_body_field_list": &entry.vary_body_field_list,
                    "use_filter": &entry.use_filter,
                }),
            )
        })
        .collect();
    json!({
        "cached_endpoints": cached_endpoints,
        "uncacheable_headers": &config.uncacheable_headers,
        "vary_headers": &config.vary_headers,
    })
}

fn json_response(status: StatusCode, value: &JsonValue) -> CasperResponse {
    let mut response = CasperResponse::synthetic(status, value.to_string());
    response
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|segment| {
        let (key, value) = segment.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}
