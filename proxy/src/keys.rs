use bytes::Bytes;
use http::header::HeaderMap;
use hyper::Method;
use serde_json::Value as JsonValue;

use crate::config::{CacheEntry, ServiceConfig};
use crate::normalize::projected_fields;

/// Ordered field strings making up a primary cache key, plus the id
/// extracted from the URI when the entry enables extraction.
pub struct DerivedKey {
    pub parts: Vec<String>,
    pub extracted_id: Option<String>,
}

/// Computes the primary key fields for a request that matched `entry`.
///
/// The key is deterministic for the same (method, normalized URI, vary
/// headers, relevant body fields, destination, cache name): every
/// distinguishing input lands in `parts` in a fixed order.
pub fn derive_primary_key(
    method: &Method,
    normalized_uri: &str,
    body: &[u8],
    headers: &HeaderMap,
    destination: &str,
    cache_name: &str,
    entry: &CacheEntry,
    service_config: Option<&ServiceConfig>,
) -> DerivedKey {
    let mut parts = vec![normalized_uri.to_string()];

    if *method == Method::POST && !body.is_empty() {
        let decoded: JsonValue = serde_json::from_slice(body).unwrap_or(JsonValue::Null);
        for field in projected_fields(entry) {
            let value = decoded.get(&field).cloned().unwrap_or(JsonValue::Null);
            parts.push(field);
            parts.push(value.to_string());
        }
    }

    parts.push(destination.to_string());
    parts.push(cache_name.to_string());

    let extracted_id = if *method == Method::GET && entry.enable_id_extraction {
        extract_id(entry, normalized_uri)
    } else {
        None
    };

    for name in vary_header_names(entry, service_config) {
        let value = headers
            .get(name.to_ascii_lowercase())
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        parts.push(value.to_string());
    }

    DerivedKey {
        parts,
        extracted_id,
    }
}

/// The vary-header list in effect: entry override, then namespace default.
fn vary_header_names<'a>(
    entry: &'a CacheEntry,
    service_config: Option<&'a ServiceConfig>,
) -> &'a [String] {
    entry
        .vary_headers
        .as_deref()
        .or_else(|| service_config.and_then(|config| config.vary_headers.as_deref()))
        .unwrap_or(&[])
}

/// First capture group of the entry's pattern, reduced to a single id: the
/// group may hold a delimited list, in which case the first piece is taken.
pub fn extract_id(entry: &CacheEntry, normalized_uri: &str) -> Option<String> {
    let captured = entry
        .pattern
        .captures(normalized_uri)?
        .get(1)?
        .as_str()
        .to_string();
    let first = if captured.contains("%2C") {
        captured.split("%2C").next()
    } else {
        captured.split(',').next()
    };
    first.map(String::from)
}

/// Surrogate keys indexing a stored record for group deletion: the whole
/// cache, and the single id within it when one was extracted.
pub fn surrogate_keys(
    destination: &str,
    cache_name: &str,
    extracted_id: Option<&str>,
) -> Vec<String> {
    let mut keys = vec![format!("{destination}|{cache_name}")];
    if let Some(id) = extracted_id {
        keys.push(format!("{destination}|{cache_name}|{id}"));
    }
    keys
}

/// Joins the ordered key fields into the opaque storage key. `\0` cannot
/// appear in a URI or header value, so the join is unambiguous.
pub fn storage_key(parts: &[String]) -> Bytes {
    Bytes::from(parts.join("\0"))
}
