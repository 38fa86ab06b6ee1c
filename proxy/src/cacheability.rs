use http::header::HeaderMap;
use hyper::Method;

use crate::config::ServiceConfig;
use crate::context::CacheDecision;
use crate::types::CacheStatus;

/// Header/value pairs that force a read from the upstream master. Values are
/// compared lowercased; names match with `-` and `_` interchangeable.
const NO_CACHE_HEADERS: &[(&str, &[&str])] = &[
    ("x-strongly-consistent-read", &["1", "true"]),
    ("x-force-master-read", &["1", "true"]),
    ("cache-control", &["no-cache"]),
    ("pragma", &["no-cache", "spectre-no-cache"]),
];

/// Decides whether a request is cacheable against the destination's
/// configuration. The first entry whose pattern matches under its request
/// method wins; entries are walked in the config's stable (sorted) order.
pub fn evaluate(
    method: &Method,
    normalized_uri: &str,
    headers: &HeaderMap,
    body: &[u8],
    destination: &str,
    service_config: Option<&ServiceConfig>,
    disable_caching: bool,
) -> CacheDecision {
    if disable_caching {
        return not_cacheable(CacheStatus::CachingDisabled);
    }

    let config = match service_config {
        Some(config) => config,
        None => {
            return not_cacheable(CacheStatus::NonConfiguredNamespace(destination.to_string()))
        }
    };

    for (cache_name, entry) in &config.cached_endpoints {
        if entry.request_method != *method {
            continue;
        }
        if !entry.match_pattern().is_match(normalized_uri) {
            continue;
        }

        if has_no_cache_header(headers) {
            return CacheDecision {
                is_cacheable: false,
                refresh_cache: true,
                reason: Some(CacheStatus::NoCacheHeader),
                cache_name: Some(cache_name.clone()),
                entry: Some(entry.clone()),
            };
        }

        if *method == Method::POST {
            let content_type = headers
                .get(http::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if !content_type.starts_with("application/json") {
                return not_cacheable(CacheStatus::NonCacheableContentType);
            }
            if entry.bulk_support {
                return not_cacheable(CacheStatus::NoBulkSupportForPost);
            }
            let needs_body = entry.enable_id_extraction || entry.vary_body_field_list.is_some();
            if needs_body && body.is_empty() {
                return not_cacheable(CacheStatus::NonCacheableMissingBody);
            }
        }

        return CacheDecision {
            is_cacheable: true,
            refresh_cache: false,
            reason: None,
            cache_name: Some(cache_name.clone()),
            entry: Some(entry.clone()),
        };
    }

    not_cacheable(CacheStatus::NonCacheableUri(destination.to_string()))
}

fn not_cacheable(reason: CacheStatus) -> CacheDecision {
    CacheDecision {
        is_cacheable: false,
        refresh_cache: false,
        reason: Some(reason),
        cache_name: None,
        entry: None,
    }
}

/// Checks the no-cache header set. Lookup is case-insensitive and treats
/// `-` and `_` in names as equivalent; values are lowercased first.
pub fn has_no_cache_header(headers: &HeaderMap) -> bool {
    for (name, values) in NO_CACHE_HEADERS {
        for candidate in [name.to_string(), name.replace('-', "_")] {
            if let Some(value) = headers.get(&candidate) {
                if let Ok(value) = value.to_str() {
                    if values.contains(&value.to_ascii_lowercase().as_str()) {
                        return true;
                    }
                }
            }
        }
    }
    false
}
