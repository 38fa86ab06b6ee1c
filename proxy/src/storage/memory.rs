use async_trait::async_trait;
use linked_hash_map::LinkedHashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;

use super::{Item, ItemKey, Key, Storage, StorageError, StoredResponse};

struct Value {
    response: StoredResponse,
    expires: SystemTime,
    surrogate_keys: Vec<Key>,
}

impl Value {
    /// Calculates size (in bytes) of this Value
    fn size(&self) -> usize {
        let mut size = std::mem::size_of::<Self>();
        size += self.response.body.len();
        for (name, value) in &self.response.headers {
            size += name.as_str().len() + value.len();
        }
        for sk in &self.surrogate_keys {
            size += sk.len();
        }
        size
    }
}

/// In-memory LRU backend with a surrogate-key index for group deletion.
#[derive(Clone)]
pub struct MemoryBackend {
    name: String,
    inner: Arc<Mutex<MemoryBackendImpl>>,
}

impl MemoryBackend {
    pub fn new(max_size: usize, name: impl Into<Option<String>>) -> Self {
        let name = name.into().unwrap_or_else(|| "memory".to_string());
        let inner = Arc::new(Mutex::new(MemoryBackendImpl::new(max_size)));
        MemoryBackend { name, inner }
    }
}

struct MemoryBackendImpl {
    max_size: usize,
    size: usize,
    cache: LinkedHashMap<Key, Value>,
    index: HashMap<Key, HashSet<Key>>,
}

impl MemoryBackendImpl {
    /// Creates a new instance that can hold up to `max_size` bytes (soft limit)
    fn new(max_size: usize) -> Self {
        MemoryBackendImpl {
            max_size,
            size: 0,
            cache: LinkedHashMap::new(),
            index: HashMap::new(),
        }
    }

    /// Inserts key/value to the cache while maintaining `max_size`
    fn insert(&mut self, key: Key, val: Value) {
        // Replacing an entry must not leak its old size or index slots
        self.remove(&key);

        // Ensure that we have free space to store the value
        while !self.cache.is_empty() && self.size + val.size() > self.max_size {
            self.pop_lru();
        }

        // Update index first
        for sk in &val.surrogate_keys {
            self.index
                .entry(sk.clone())
                .or_default()
                .insert(key.clone());
        }

        // Then insert the value
        self.size += val.size();
        self.cache.insert(key, val);
    }

    /// Removes least recently used value from the cache
    fn pop_lru(&mut self) -> Option<(Key, Value)> {
        if let Some((key, value)) = self.cache.pop_front() {
            for sk in &value.surrogate_keys {
                if let Some(sv) = self.index.get_mut(sk) {
                    sv.remove(&key);
                }
            }
            self.size -= value.size();
            return Some((key, value));
        }
        None
    }

    /// Returns unexpired value from the cache
    fn get_unexpired(&mut self, key: &Key) -> Option<&Value> {
        match self.cache.get_refresh(key) {
            Some(value) if value.expires > SystemTime::now() => self.cache.get(key),
            Some(_) => {
                self.remove(key);
                None
            }
            None => None,
        }
    }

    /// Removes value from the cache by `key`
    fn remove(&mut self, key: &Key) -> Option<Value> {
        if let Some(value) = self.cache.remove(key) {
            for sk in &value.surrogate_keys {
                if let Some(sv) = self.index.get_mut(sk) {
                    sv.remove(key);
                }
            }
            self.size -= value.size();
            return Some(value);
        }
        None
    }

    /// Removes all values from the cache that share the surrogate key
    fn remove_by_skey(&mut self, sk: &Key) -> u64 {
        let mut removed = 0;
        if let Some(set) = self.index.remove(sk) {
            for key in set {
                if let Some(val) = self.cache.remove(&key) {
                    self.size -= val.size();
                    removed += 1;
                }
            }
        }
        removed
    }
}

#[async_trait]
impl Storage for MemoryBackend {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn connect(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn get_response(&self, key: Key) -> Result<Option<StoredResponse>, StorageError> {
        let mut memory = self.inner.lock().await;
        Ok(memory.get_unexpired(&key).map(|value| value.response.clone()))
    }

    async fn store_response(&self, item: Item) -> Result<(), StorageError> {
        let mut memory = self.inner.lock().await;
        let value = Value {
            response: item.response,
            expires: SystemTime::now() + item.ttl,
            surrogate_keys: item.surrogate_keys,
        };
        memory.insert(item.key, value);
        Ok(())
    }

    async fn delete_responses(&self, keys: &[ItemKey]) -> Result<u64, StorageError> {
        let mut memory = self.inner.lock().await;
        let mut removed = 0;
        for key in keys {
            match key {
                ItemKey::Primary(key) => {
                    if memory.remove(key).is_some() {
                        removed += 1;
                    }
                }
                ItemKey::Surrogate(sk) => {
                    removed += memory.remove_by_skey(sk);
                }
            }
        }
        Ok(removed)
    }
}
