use arc_swap::ArcSwap;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;

use crate::config::{
    parse_internal_config, parse_service_config, ConfigError, EnvoyConfig, InternalConfig,
    ServiceConfig, SmartstackEntry,
};

/// How often the watcher stats the known config files.
pub const RELOAD_INTERVAL: Duration = Duration::from_secs(10);

const INTERNAL_CONFIG_NAME: &str = "casper.internal.yaml";

/// Filesystem locations of every config source.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub srv_configs: PathBuf,
    pub services_yaml: PathBuf,
    pub envoy_configs: PathBuf,
}

impl ConfigPaths {
    /// Reads the conventional environment variables.
    pub fn from_env() -> Self {
        ConfigPaths {
            srv_configs: env::var("SRV_CONFIGS_PATH")
                .unwrap_or_else(|_| "/nail/srv/configs".to_string())
                .into(),
            services_yaml: env::var("SERVICES_YAML_PATH")
                .unwrap_or_else(|_| "/nail/etc/services/services.yaml".to_string())
                .into(),
            envoy_configs: env::var("ENVOY_CONFIGS_PATH")
                .unwrap_or_else(|_| "/nail/srv/configs/envoy".to_string())
                .into(),
        }
    }

    fn internal_config(&self) -> PathBuf {
        self.srv_configs.join(INTERNAL_CONFIG_NAME)
    }

    fn envoy_client(&self) -> PathBuf {
        self.envoy_configs.join("envoy_client.yaml")
    }

    /// A yaml file in the srv-configs directory that is not a
    /// per-destination config. The registry file may be colocated.
    fn is_reserved(&self, path: &Path) -> bool {
        path == self.internal_config()
            || path == self.services_yaml
            || path == self.envoy_client()
    }
}

/// One immutable view of every loaded config file.
///
/// Requests capture the current snapshot pointer once on entry and use it for
/// their whole lifetime, so a reload mid-request can never tear a read.
#[derive(Default)]
pub struct Snapshot {
    pub services: HashMap<String, Arc<ServiceConfig>>,
    pub smartstack: HashMap<String, SmartstackEntry>,
    pub envoy: Option<EnvoyConfig>,
    pub internal: Arc<InternalConfig>,
    /// path -> mtime, reported by `/configs`
    pub mod_times: BTreeMap<PathBuf, SystemTime>,
}

impl Snapshot {
    pub fn service(&self, destination: &str) -> Option<Arc<ServiceConfig>> {
        self.services.get(destination).cloned()
    }

    /// Configured destinations with no smartstack entry; surfaced by `/status`.
    pub fn destinations_missing_smartstack(&self) -> Vec<String> {
        let mut missing: Vec<String> = self
            .services
            .keys()
            .filter(|dest| !self.smartstack.contains_key(*dest))
            .cloned()
            .collect();
        missing.sort();
        missing
    }
}

pub struct ConfigRegistry {
    paths: ConfigPaths,
    snapshot: ArcSwap<Snapshot>,
}

impl ConfigRegistry {
    /// Loads every config source synchronously. Any parse failure here is
    /// fatal: a process must not start with broken configuration.
    pub async fn load(paths: ConfigPaths) -> Result<Arc<Self>, ConfigError> {
        let snapshot = load_snapshot(&paths, None).await?;
        Ok(Arc::new(ConfigRegistry {
            paths,
            snapshot: ArcSwap::from_pointee(snapshot),
        }))
    }

    /// The current snapshot. Callers hold the returned pointer for the
    /// duration of a request rather than re-reading per field.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    /// Spawns the background reload task. Wakes every `RELOAD_INTERVAL`,
    /// stats each known file and reloads when any modification time changed.
    /// Reload failures keep the previous snapshot.
    pub fn spawn_watcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RELOAD_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it, we just loaded.
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.reload_if_changed().await;
            }
        })
    }

    pub async fn reload_if_changed(&self) {
        let current = self.snapshot.load_full();
        match self.files_changed(&current).await {
            Ok(false) => {}
            Ok(true) => match load_snapshot(&self.paths, Some(&current)).await {
                Ok(snapshot) => {
                    tracing::info!("Reloaded configuration snapshot");
                    self.snapshot.store(Arc::new(snapshot));
                }
                Err(e) => {
                    tracing::warn!("Config reload failed, keeping previous snapshot: {e}");
                }
            },
            Err(e) => {
                tracing::warn!("Config stat failed, keeping previous snapshot: {e}");
            }
        }
    }

    async fn files_changed(&self, current: &Snapshot) -> std::io::Result<bool> {
        // A new service config file showing up also counts as a change
        let known = &current.mod_times;
        let mut seen = 0usize;
        for path in list_config_files(&self.paths).await? {
            match (known.get(&path), file_mtime(&path).await) {
                (Some(prev), Ok(mtime)) if *prev == mtime => seen += 1,
                // Modified, or newly appeared
                (Some(_), Ok(_)) | (None, Ok(_)) => return Ok(true),
                // Tracked file went away
                (Some(_), Err(_)) => return Ok(true),
                // Optional file that still does not exist
                (None, Err(_)) => {}
            }
        }
        // Fewer matches than tracked files means something was deleted
        Ok(seen != known.len())
    }
}

async fn file_mtime(path: &Path) -> std::io::Result<SystemTime> {
    fs::metadata(path).await?.modified()
}

async fn list_config_files(paths: &ConfigPaths) -> std::io::Result<Vec<PathBuf>> {
    let mut files = vec![
        paths.services_yaml.clone(),
        paths.internal_config(),
        paths.envoy_client(),
    ];
    let mut dir = fs::read_dir(&paths.srv_configs).await?;
    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        let is_yaml = path.extension().map(|e| e == "yaml").unwrap_or(false);
        if is_yaml && !paths.is_reserved(&path) {
            files.push(path);
        }
    }
    Ok(files)
}

/// Loads every source into one snapshot. With `previous` set (a reload), a
/// file that fails to load keeps its previously loaded value; at startup any
/// failure of the smartstack registry or internal config is fatal while
/// per-destination files are skipped with a warning.
async fn load_snapshot(
    paths: &ConfigPaths,
    previous: Option<&Snapshot>,
) -> Result<Snapshot, ConfigError> {
    let mut mod_times = BTreeMap::new();

    // SmartStack registry
    let services_path = paths.services_yaml.clone();
    let smartstack = match load_smartstack(&services_path).await {
        Ok(table) => {
            if let Ok(mtime) = file_mtime(&services_path).await {
                mod_times.insert(services_path.clone(), mtime);
            }
            table
        }
        Err(e) => match previous {
            Some(prev) => {
                tracing::warn!("Failed to reload smartstack registry: {e}");
                prev.smartstack.clone()
            }
            None => return Err(e),
        },
    };

    // Internal settings
    let internal_path = paths.internal_config();
    let internal = match fs::read(&internal_path).await {
        Ok(data) => {
            let parsed = parse_internal_config(&data);
            match (parsed, previous) {
                (Ok(config), _) => {
                    if let Ok(mtime) = file_mtime(&internal_path).await {
                        mod_times.insert(internal_path.clone(), mtime);
                    }
                    Arc::new(config)
                }
                (Err(e), Some(prev)) => {
                    tracing::warn!("Failed to reload {INTERNAL_CONFIG_NAME}: {e}");
                    prev.internal.clone()
                }
                (Err(e), None) => return Err(e),
            }
        }
        Err(e) => match previous {
            Some(prev) => {
                tracing::warn!("Failed to read {INTERNAL_CONFIG_NAME}: {e}");
                prev.internal.clone()
            }
            None => return Err(e.into()),
        },
    };

    // Envoy client config is optional even at startup
    let envoy_path = paths.envoy_client();
    let envoy = match fs::read(&envoy_path).await {
        Ok(data) => match serde_yaml::from_slice::<EnvoyConfig>(&data) {
            Ok(config) => {
                if let Ok(mtime) = file_mtime(&envoy_path).await {
                    mod_times.insert(envoy_path.clone(), mtime);
                }
                Some(config)
            }
            Err(e) => {
                tracing::warn!("Failed to parse envoy_client.yaml: {e}");
                previous.and_then(|prev| prev.envoy.clone())
            }
        },
        Err(_) => previous.and_then(|prev| prev.envoy.clone()),
    };

    // Per-destination service configs
    let mut services = HashMap::new();
    let mut dir = fs::read_dir(&paths.srv_configs).await?;
    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        let is_yaml = path.extension().map(|e| e == "yaml").unwrap_or(false);
        if !is_yaml || paths.is_reserved(&path) {
            continue;
        }
        let destination = match path.file_stem().and_then(|s| s.to_str()) {
            Some(stem) => stem.to_string(),
            None => continue,
        };
        let loaded = match fs::read(&path).await {
            Ok(data) => parse_service_config(&data),
            Err(e) => Err(e.into()),
        };
        match (loaded, previous) {
            (Ok(config), _) => {
                if let Ok(mtime) = file_mtime(&path).await {
                    mod_times.insert(path.clone(), mtime);
                }
                services.insert(destination, Arc::new(config));
            }
            // A reload keeps the destination's previous config
            (Err(e), Some(prev)) => {
                tracing::warn!("Failed to load service config {}: {e}", path.display());
                if let Some(prev_config) = prev.services.get(&destination).cloned() {
                    services.insert(destination.clone(), prev_config);
                    if let Some(mtime) = prev.mod_times.get(&path) {
                        mod_times.insert(path.clone(), *mtime);
                    }
                }
            }
            // At startup broken configuration is fatal
            (Err(e), None) => return Err(e),
        }
    }

    Ok(Snapshot {
        services,
        smartstack,
        envoy,
        internal,
        mod_times,
    })
}

async fn load_smartstack(path: &Path) -> Result<HashMap<String, SmartstackEntry>, ConfigError> {
    let data = fs::read(path).await?;
    Ok(serde_yaml::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "{contents}").unwrap();
        path
    }

    fn test_paths(root: &Path) -> ConfigPaths {
        ConfigPaths {
            srv_configs: root.to_path_buf(),
            services_yaml: root.join("services.yaml"),
            envoy_configs: root.join("envoy"),
        }
    }

    fn seed_configs(root: &Path) {
        write_file(
            root,
            "services.yaml",
            "backend.main:\n  host: 10.5.0.3\n  port: 9080\n",
        );
        write_file(root, "casper.internal.yaml", "casper:\n  disable_caching: false\n");
        write_file(
            root,
            "backend.main.yaml",
            "cached_endpoints:\n  timestamp:\n    pattern: \"^/timestamp/\"\n    ttl: 60\n",
        );
    }

    #[tokio::test]
    async fn test_load_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        seed_configs(dir.path());

        let registry = ConfigRegistry::load(test_paths(dir.path())).await.unwrap();
        let snapshot = registry.snapshot();

        let service = snapshot.service("backend.main").unwrap();
        assert!(service.entry("timestamp").is_some());
        assert_eq!(
            snapshot.smartstack.get("backend.main"),
            Some(&SmartstackEntry {
                host: "10.5.0.3".to_string(),
                port: 9080
            })
        );
        assert!(snapshot.service("backend.other").is_none());
        // services.yaml + internal + backend.main.yaml
        assert_eq!(snapshot.mod_times.len(), 3);
    }

    #[tokio::test]
    async fn test_reload_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        seed_configs(dir.path());

        let registry = ConfigRegistry::load(test_paths(dir.path())).await.unwrap();
        assert!(registry
            .snapshot()
            .service("backend.main")
            .unwrap()
            .entry("long_ttl")
            .is_none());

        // mtime granularity can be a full second on some filesystems
        tokio::time::sleep(Duration::from_millis(1100)).await;
        write_file(
            dir.path(),
            "backend.main.yaml",
            "cached_endpoints:\n  long_ttl:\n    pattern: \"^/long_ttl/\"\n    ttl: 600\n",
        );

        registry.reload_if_changed().await;
        let snapshot = registry.snapshot();
        assert!(snapshot
            .service("backend.main")
            .unwrap()
            .entry("long_ttl")
            .is_some());
    }

    #[tokio::test]
    async fn test_bad_reload_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        seed_configs(dir.path());

        let registry = ConfigRegistry::load(test_paths(dir.path())).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        write_file(dir.path(), "backend.main.yaml", ": not [ valid yaml");

        registry.reload_if_changed().await;
        let snapshot = registry.snapshot();
        // Previous config for the destination survives the broken file
        assert!(snapshot
            .service("backend.main")
            .unwrap()
            .entry("timestamp")
            .is_some());
    }

    #[tokio::test]
    async fn test_snapshot_is_stable_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        seed_configs(dir.path());

        let registry = ConfigRegistry::load(test_paths(dir.path())).await.unwrap();
        let before = registry.snapshot();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        write_file(
            dir.path(),
            "backend.main.yaml",
            "cached_endpoints:\n  other:\n    pattern: \"^/other/\"\n    ttl: 1\n",
        );
        registry.reload_if_changed().await;

        // The earlier pointer still sees the old view
        assert!(before.service("backend.main").unwrap().entry("timestamp").is_some());
        assert!(registry
            .snapshot()
            .service("backend.main")
            .unwrap()
            .entry("timestamp")
            .is_none());
    }

    #[tokio::test]
    async fn test_missing_smartstack_listed() {
        let dir = tempfile::tempdir().unwrap();
        seed_configs(dir.path());
        write_file(
            dir.path(),
            "backend.other.yaml",
            "cached_endpoints: {}\n",
        );

        let registry = ConfigRegistry::load(test_paths(dir.path())).await.unwrap();
        let snapshot = registry.snapshot();
        assert_eq!(
            snapshot.destinations_missing_smartstack(),
            vec!["backend.other".to_string()]
        );
    }
}
