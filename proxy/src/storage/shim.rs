use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

use super::{Key, StoredResponse};

struct ShimValue {
    response: StoredResponse,
    surrogate_keys: Vec<Key>,
    expires: Instant,
}

impl ShimValue {
    fn size(&self) -> usize {
        let mut size = std::mem::size_of::<Self>();
        size += self.response.body.len();
        for (name, value) in &self.response.headers {
            size += name.as_str().len() + value.len();
        }
        size
    }
}

/// Tiny per-process LRU fronting the backend. Entries live for a couple of
/// seconds at most; cross-process invalidation relies on the backend, so the
/// TTL bounds how stale a purged record can appear locally.
pub struct Shim {
    max_size: usize,
    ttl: Duration,
    inner: Mutex<ShimImpl>,
}

struct ShimImpl {
    size: usize,
    cache: LinkedHashMap<Key, ShimValue>,
}

impl Shim {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Shim {
            max_size,
            ttl,
            inner: Mutex::new(ShimImpl {
                size: 0,
                cache: LinkedHashMap::new(),
            }),
        }
    }

    pub fn get(&self, key: &Key) -> Option<StoredResponse> {
        let mut inner = self.inner.lock();
        match inner.cache.get_refresh(key) {
            Some(value) if value.expires > Instant::now() => Some(value.response.clone()),
            Some(_) => {
                inner.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: Key, response: StoredResponse, surrogate_keys: Vec<Key>) {
        let value = ShimValue {
            response,
            surrogate_keys,
            expires: Instant::now() + self.ttl,
        };
        let mut inner = self.inner.lock();
        inner.remove(&key);
        while !inner.cache.is_empty() && inner.size + value.size() > self.max_size {
            if let Some((_, evicted)) = inner.cache.pop_front() {
                inner.size -= evicted.size();
            }
        }
        inner.size += value.size();
        inner.cache.insert(key, value);
    }

    /// Drops every entry tagged with any of the surrogates.
    pub fn evict_by_surrogates(&self, surrogates: &[Key]) {
        let mut inner = self.inner.lock();
        let doomed: Vec<Key> = inner
            .cache
            .iter()
            .filter(|(_, value)| {
                value
                    .surrogate_keys
                    .iter()
                    .any(|sk| surrogates.contains(sk))
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed {
            inner.remove(&key);
        }
    }
}

impl ShimImpl {
    fn remove(&mut self, key: &Key) {
        if let Some(value) = self.cache.remove(key) {
            self.size -= value.size();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::header::HeaderMap;
    use hyper::StatusCode;

    fn response(body: &'static [u8]) -> StoredResponse {
        StoredResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(body),
        }
    }

    #[test]
    fn test_get_after_insert() {
        let shim = Shim::new(4096, Duration::from_secs(2));
        shim.insert("k".into(), response(b"v"), vec![]);
        assert_eq!(shim.get(&"k".into()).unwrap().body, &b"v"[..]);
        assert!(shim.get(&"other".into()).is_none());
    }

    #[test]
    fn test_ttl_expiry() {
        let shim = Shim::new(4096, Duration::from_millis(0));
        shim.insert("k".into(), response(b"v"), vec![]);
        assert!(shim.get(&"k".into()).is_none());
    }

    #[test]
    fn test_surrogate_eviction() {
        let shim = Shim::new(4096, Duration::from_secs(2));
        shim.insert("k1".into(), response(b"v1"), vec!["ns|cache|1".into()]);
        shim.insert("k2".into(), response(b"v2"), vec!["ns|cache|2".into()]);

        shim.evict_by_surrogates(&["ns|cache|1".into()]);
        assert!(shim.get(&"k1".into()).is_none());
        assert!(shim.get(&"k2".into()).is_some());
    }

    #[test]
    fn test_size_cap_evicts_lru() {
        let shim = Shim::new(400, Duration::from_secs(2));
        shim.insert("k1".into(), response(&[b'a'; 128]), vec![]);
        shim.insert("k2".into(), response(&[b'b'; 128]), vec![]);
        assert!(shim.get(&"k1".into()).is_none());
        assert!(shim.get(&"k2".into()).is_some());
    }
}
