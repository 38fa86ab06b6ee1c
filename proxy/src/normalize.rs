use bytes::Bytes;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::config::CacheEntry;
use crate::errors::ProxyError;

/// Reorders query parameters so equivalent URIs produce equal cache keys.
///
/// The query is split on `&` and the raw segments are sorted byte-wise; no
/// percent-decoding happens, so the output is stable for identical inputs.
/// The path is never touched.
pub fn normalize_uri(uri: &str) -> String {
    match uri.split_once('?') {
        None => uri.to_string(),
        Some((path, query)) => {
            let mut segments: Vec<&str> = query.split('&').collect();
            segments.sort_unstable();
            format!("{path}?{}", segments.join("&"))
        }
    }
}

/// Projects the cache-relevant fields out of a POST body.
///
/// Only the union of `post_body_id` and `vary_body_field_list` participates
/// in the cache key; everything else in the body is ignored. Fields absent
/// from the body are kept as JSON `null` so their absence is part of the key.
/// Keys are emitted sorted, making the encoding canonical.
pub fn normalize_body(body: &[u8], entry: &CacheEntry) -> Result<Bytes, ProxyError> {
    let decoded: JsonValue = serde_json::from_slice(body)
        .map_err(|e| ProxyError::RequestBodyError(format!("invalid JSON body: {e}")))?;

    let mut projected = BTreeMap::new();
    for field in projected_fields(entry) {
        let value = decoded.get(&field).cloned().unwrap_or(JsonValue::Null);
        projected.insert(field, value);
    }

    let encoded = serde_json::to_vec(&projected)
        .map_err(|e| ProxyError::InternalError(format!("failed to encode body: {e}")))?;
    Ok(Bytes::from(encoded))
}

/// Sorted union of the id field and the vary-body fields.
pub fn projected_fields(entry: &CacheEntry) -> Vec<String> {
    let mut fields: Vec<String> = entry
        .post_body_id
        .iter()
        .chain(entry.vary_body_field_list.iter().flatten())
        .cloned()
        .collect();
    fields.sort_unstable();
    fields.dedup();
    fields
}
