use hyper::Method;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// One cacheable endpoint of a destination service.
///
/// Compiled from the raw YAML form: patterns become regexes, the TTL becomes
/// a `Duration`, and the request method a `hyper::Method`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub pattern: Regex,
    pub pattern_v2: Option<Regex>,
    pub ttl: Duration,
    pub request_method: Method,
    pub bulk_support: bool,
    pub id_identifier: Option<String>,
    pub post_body_id: Option<String>,
    pub enable_id_extraction: bool,
    pub dont_cache_missing_ids: bool,
    pub vary_headers: Option<Vec<String>>,
    pub vary_body_field_list: Option<Vec<String>>,
    pub num_buckets: Option<u32>,
    pub uncacheable_headers: Option<Vec<String>>,
    pub use_filter: Option<String>,
}

impl CacheEntry {
    /// The regex a request URI is matched against. `pattern_v2` wins when
    /// both are configured.
    pub fn match_pattern(&self) -> &Regex {
        self.pattern_v2.as_ref().unwrap_or(&self.pattern)
    }
}

/// Per-destination configuration loaded from `<SRV_CONFIGS_PATH>/<destination>.yaml`.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Endpoint entries ordered by cache name. YAML mappings carry no
    /// reliable order, so pattern search walks the names sorted
    /// lexicographically and the first match wins.
    pub cached_endpoints: Vec<(String, CacheEntry)>,
    pub uncacheable_headers: Vec<String>,
    pub vary_headers: Option<Vec<String>>,
}

impl ServiceConfig {
    pub fn entry(&self, cache_name: &str) -> Option<&CacheEntry> {
        self.cached_endpoints
            .iter()
            .find(|(name, _)| name == cache_name)
            .map(|(_, entry)| entry)
    }
}

#[derive(Debug, Deserialize)]
struct RawServiceConfig {
    #[serde(default)]
    cached_endpoints: BTreeMap<String, RawCacheEntry>,
    #[serde(default)]
    uncacheable_headers: Vec<String>,
    #[serde(default)]
    vary_headers: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawCacheEntry {
    pattern: String,
    pattern_v2: Option<String>,
    ttl: u64,
    request_method: Option<String>,
    #[serde(default)]
    bulk_support: bool,
    id_identifier: Option<String>,
    post_body_id: Option<String>,
    #[serde(default)]
    enable_id_extraction: bool,
    #[serde(default)]
    dont_cache_missing_ids: bool,
    vary_headers: Option<Vec<String>>,
    vary_body_field_list: Option<Vec<String>>,
    num_buckets: Option<u32>,
    uncacheable_headers: Option<Vec<String>>,
    use_filter: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid pattern for cache entry {name}: {source}")]
    InvalidPattern {
        name: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid request_method {method:?} for cache entry {name}")]
    InvalidMethod { name: String, method: String },
    #[error("unknown filter {filter:?} for cache entry {name}")]
    UnknownFilter { name: String, filter: String },
}

impl RawCacheEntry {
    fn compile(self, name: &str) -> Result<CacheEntry, ConfigError> {
        let compile_regex = |s: &str| {
            Regex::new(s).map_err(|source| ConfigError::InvalidPattern {
                name: name.to_string(),
                source,
            })
        };

        let pattern = compile_regex(&self.pattern)?;
        let pattern_v2 = self.pattern_v2.as_deref().map(compile_regex).transpose()?;

        let request_method = match self.request_method.as_deref() {
            None => Method::GET,
            Some(m) => match m.to_ascii_uppercase().as_str() {
                "GET" => Method::GET,
                "POST" => Method::POST,
                other => {
                    return Err(ConfigError::InvalidMethod {
                        name: name.to_string(),
                        method: other.to_string(),
                    })
                }
            },
        };

        Ok(CacheEntry {
            pattern,
            pattern_v2,
            ttl: Duration::from_secs(self.ttl),
            request_method,
            bulk_support: self.bulk_support,
            id_identifier: self.id_identifier,
            post_body_id: self.post_body_id,
            enable_id_extraction: self.enable_id_extraction,
            dont_cache_missing_ids: self.dont_cache_missing_ids,
            vary_headers: self.vary_headers,
            vary_body_field_list: self.vary_body_field_list,
            num_buckets: self.num_buckets,
            uncacheable_headers: self.uncacheable_headers,
            use_filter: self.use_filter,
        })
    }
}

/// Parses a per-destination service config from YAML bytes.
pub fn parse_service_config(data: &[u8]) -> Result<ServiceConfig, ConfigError> {
    let raw: RawServiceConfig = serde_yaml::from_slice(data)?;

    // BTreeMap iteration gives the sorted order the matcher relies on
    let mut cached_endpoints = Vec::with_capacity(raw.cached_endpoints.len());
    for (name, entry) in raw.cached_endpoints {
        let compiled = entry.compile(&name)?;
        cached_endpoints.push((name, compiled));
    }

    Ok(ServiceConfig {
        cached_endpoints,
        uncacheable_headers: raw.uncacheable_headers,
        vary_headers: raw.vary_headers,
    })
}

/// Casper's own settings, from `<SRV_CONFIGS_PATH>/casper.internal.yaml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct InternalConfig {
    #[serde(default)]
    pub casper: CasperConfig,
    #[serde(default)]
    pub main: MainConfig,
    #[serde(default)]
    pub yelp_meteorite: Option<MeteoriteConfig>,
    #[serde(default)]
    pub zipkin: Option<ZipkinConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CasperConfig {
    #[serde(default)]
    pub disable_caching: bool,
    #[serde(default)]
    pub route_through_envoy: bool,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub v2_single_enabled_pct: u32,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "HttpConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl HttpConfig {
    fn default_timeout_ms() -> u64 {
        60_000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Soft byte cap for the in-memory backend
    #[serde(default = "StorageConfig::default_max_size")]
    pub max_size: usize,
    /// Bodies above this many bytes are stored compressed
    #[serde(default = "StorageConfig::default_compression_threshold")]
    pub compression_threshold: usize,
    #[serde(default = "StorageConfig::default_compression_level")]
    pub compression_level: i32,
    /// Deadline for a single storage operation
    #[serde(default = "StorageConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub shim: Option<ShimConfig>,
}

impl StorageConfig {
    fn default_max_size() -> usize {
        256 * 1024 * 1024
    }

    fn default_compression_threshold() -> usize {
        1024
    }

    fn default_compression_level() -> i32 {
        3
    }

    fn default_timeout_ms() -> u64 {
        500
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            max_size: Self::default_max_size(),
            compression_threshold: Self::default_compression_threshold(),
            compression_level: Self::default_compression_level(),
            timeout_ms: Self::default_timeout_ms(),
            shim: None,
        }
    }
}

/// In-process cache layered in front of the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct ShimConfig {
    #[serde(default = "ShimConfig::default_max_size")]
    pub max_size: usize,
    #[serde(default = "ShimConfig::default_ttl_ms")]
    pub ttl_ms: u64,
}

impl ShimConfig {
    fn default_max_size() -> usize {
        16 * 1024 * 1024
    }

    fn default_ttl_ms() -> u64 {
        2_000
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MainConfig {
    #[serde(default = "MainConfig::default_workers")]
    pub workers: usize,
    #[serde(default = "MainConfig::default_listen")]
    pub listen: Listener,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl MainConfig {
    fn default_workers() -> usize {
        1
    }

    fn default_listen() -> Listener {
        Listener {
            host: "127.0.0.1".to_string(),
            port: 32927,
        }
    }
}

impl Default for MainConfig {
    fn default() -> Self {
        MainConfig {
            workers: Self::default_workers(),
            listen: Self::default_listen(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeteoriteConfig {
    #[serde(rename = "metrics-relay")]
    pub metrics_relay: Option<HostPort>,
    pub etc_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZipkinConfig {
    pub syslog: Option<HostPort>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

/// A destination's location per the SmartStack registry file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, serde::Serialize)]
pub struct SmartstackEntry {
    pub host: String,
    pub port: u16,
}

/// Envoy client settings from `<ENVOY_CONFIGS_PATH>/envoy_client.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvoyConfig {
    pub host: String,
    pub port: u16,
}

pub fn parse_internal_config(data: &[u8]) -> Result<InternalConfig, ConfigError> {
    Ok(serde_yaml::from_slice(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_config_parsing() {
        let yaml = br#"
cached_endpoints:
  timestamp:
    pattern: "^/timestamp/"
    ttl: 60
  business:
    pattern: "^/biz\\?foo=(.*)&business_id=(\\d+)$"
    ttl: 120
    enable_id_extraction: true
uncacheable_headers:
  - Uncacheable-Header
vary_headers:
  - Accept-Encoding
"#;
        let config = parse_service_config(yaml).unwrap();

        // Sorted by cache name
        let names: Vec<&str> = config
            .cached_endpoints
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(names, vec!["business", "timestamp"]);

        let entry = config.entry("timestamp").unwrap();
        assert_eq!(entry.ttl, Duration::from_secs(60));
        assert_eq!(entry.request_method, Method::GET);
        assert!(!entry.bulk_support);
        assert!(entry.match_pattern().is_match("/timestamp/cached"));

        assert_eq!(config.uncacheable_headers, vec!["Uncacheable-Header"]);
        assert_eq!(config.vary_headers, Some(vec!["Accept-Encoding".into()]));
    }

    #[test]
    fn test_pattern_v2_wins() {
        let yaml = br#"
cached_endpoints:
  users:
    pattern: "^/old/"
    pattern_v2: "^/new/"
    ttl: 10
"#;
        let config = parse_service_config(yaml).unwrap();
        let entry = config.entry("users").unwrap();
        assert!(entry.match_pattern().is_match("/new/thing"));
        assert!(!entry.match_pattern().is_match("/old/thing"));
    }

    #[test]
    fn test_invalid_pattern_is_an_error() {
        let yaml = br#"
cached_endpoints:
  broken:
    pattern: "(["
    ttl: 10
"#;
        let err = parse_service_config(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn test_invalid_method_is_an_error() {
        let yaml = br#"
cached_endpoints:
  broken:
    pattern: "^/x"
    ttl: 10
    request_method: PUT
"#;
        let err = parse_service_config(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidMethod { .. }));
    }

    #[test]
    fn test_internal_config_defaults() {
        let config = parse_internal_config(b"{}").unwrap();
        assert!(!config.casper.disable_caching);
        assert!(!config.casper.route_through_envoy);
        assert_eq!(config.casper.http.timeout_ms, 60_000);
        assert_eq!(config.main.workers, 1);
    }

    #[test]
    fn test_internal_config_parsing() {
        let yaml = br#"
casper:
  disable_caching: true
  route_through_envoy: true
  http:
    timeout_ms: 1000
  v2_single_enabled_pct: 50
main:
  workers: 4
  listen:
    host: 0.0.0.0
    port: 8888
yelp_meteorite:
  metrics-relay:
    host: 169.254.255.254
    port: 8125
zipkin:
  syslog:
    host: 127.0.0.1
    port: 1514
"#;
        let config = parse_internal_config(yaml).unwrap();
        assert!(config.casper.disable_caching);
        assert_eq!(config.casper.http.timeout_ms, 1000);
        assert_eq!(config.casper.v2_single_enabled_pct, 50);
        assert_eq!(config.main.workers, 4);
        assert_eq!(config.main.listen.port, 8888);
        let relay = config.yelp_meteorite.unwrap().metrics_relay.unwrap();
        assert_eq!(relay.port, 8125);
        assert_eq!(config.zipkin.unwrap().syslog.unwrap().port, 1514);
    }
}
