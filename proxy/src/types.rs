use bytes::Bytes;
use http::header::HeaderMap;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use std::fmt;

/// Where a response came from; drives metric labels and the handlers'
/// hit/miss branching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    /// Produced by the upstream client (including synthesized transport
    /// failures)
    Proxied,
    /// Produced by a storage lookup
    Cached,
    /// Produced locally (errors, internal endpoints)
    Synthetic,
}

/// A fully materialized HTTP response as it moves through the pipeline.
#[derive(Debug, Clone)]
pub struct CasperResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl CasperResponse {
    pub fn cached(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        CasperResponse {
            status,
            headers,
            body,
            source: ResponseSource::Cached,
        }
    }

    pub fn proxied(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        CasperResponse {
            status,
            headers,
            body,
            source: ResponseSource::Proxied,
        }
    }

    pub fn synthetic(status: StatusCode, body: impl Into<Bytes>) -> Self {
        CasperResponse {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            source: ResponseSource::Synthetic,
        }
    }

    pub fn is_proxied(&self) -> bool {
        self.source == ResponseSource::Proxied
    }

    pub fn is_cached(&self) -> bool {
        self.source == ResponseSource::Cached
    }

    pub fn into_http(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// The tag transcribed into the `Spectre-Cache-Status` response header:
/// a hit, a miss, or the reason the request bypassed the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    NoCacheHeader,
    CachingDisabled,
    NonConfiguredNamespace(String),
    NonCacheableUri(String),
    NonCacheableResponse(u16),
    NonCacheableContentType,
    NoBulkSupportForPost,
    NonCacheableMissingBody,
    UnprocessableResponse(String),
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheStatus::Hit => write!(f, "hit"),
            CacheStatus::Miss => write!(f, "miss"),
            CacheStatus::NoCacheHeader => write!(f, "no-cache-header"),
            CacheStatus::CachingDisabled => write!(f, "caching disabled via configs"),
            CacheStatus::NonConfiguredNamespace(dest) => {
                write!(f, "non-configured-namespace ({dest})")
            }
            CacheStatus::NonCacheableUri(dest) => write!(f, "non-cacheable-uri ({dest})"),
            CacheStatus::NonCacheableResponse(status) => {
                write!(f, "non-cacheable-response: status code is {status}")
            }
            CacheStatus::NonCacheableContentType => write!(f, "non-cacheable-content-type"),
            CacheStatus::NoBulkSupportForPost => write!(f, "no-bulk-support-for-post"),
            CacheStatus::NonCacheableMissingBody => write!(f, "non-cacheable-missing-body"),
            CacheStatus::UnprocessableResponse(content_type) => {
                write!(f, "unable to process response; content-type is {content_type}")
            }
        }
    }
}
