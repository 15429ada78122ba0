use precache_core::manifest::{DEFAULT_URLS, DEFAULT_VERSION};
use precache_core::{PrecacheManifest, Registration};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid [precache] section: {0}")]
    Manifest(#[from] precache_core::Error),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub precache: PrecacheConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamConfig {
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    Disk,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_backend")]
    pub backend: Backend,
    /// Root directory for the disk backend.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PrecacheConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_urls")]
    pub urls: Vec<String>,
    #[serde(default = "default_skip_waiting")]
    pub skip_waiting: bool,
    /// A client with no request for this long counts as a closed page.
    #[serde(default = "default_client_idle_timeout_secs")]
    pub client_idle_timeout_secs: u64,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        // Surface a bad manifest at load time rather than at install.
        config.precache.manifest()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Config {
            server: ServerConfig::default(),
            upstream: UpstreamConfig {
                url: "http://127.0.0.1:3000".to_string(),
            },
            cache: CacheConfig::default(),
            precache: PrecacheConfig::default(),
        }
    }
}

impl PrecacheConfig {
    pub fn manifest(&self) -> Result<PrecacheManifest, precache_core::Error> {
        PrecacheManifest::new(self.version.clone(), self.urls.clone())
    }

    pub fn client_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.client_idle_timeout_secs.max(1))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            dir: default_cache_dir(),
        }
    }
}

impl Default for PrecacheConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            urls: default_urls(),
            skip_waiting: default_skip_waiting(),
            client_idle_timeout_secs: default_client_idle_timeout_secs(),
        }
    }
}

/// What a config change requires.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReloadPlan {
    /// Install (and possibly activate) a worker for the new manifest.
    pub reinstall: bool,
    /// Changed settings that only take effect after a restart.
    pub restart_required: Vec<&'static str>,
}

/// Compare old and new config and decide what can be applied live.
///
/// - Precache version changed → install a new generation
/// - URLs changed without a version bump → WARN, ignored (the generation name
///   must change with its contents)
/// - Listen addresses, upstream, storage backend, client idle timeout →
///   restart required
pub fn plan_reload(old: &Config, new: &Config) -> ReloadPlan {
    let mut plan = ReloadPlan::default();

    if old.server.listen_addr != new.server.listen_addr {
        plan.restart_required.push("server.listen_addr");
    }
    if old.server.metrics_addr != new.server.metrics_addr {
        plan.restart_required.push("server.metrics_addr");
    }
    if old.upstream.url != new.upstream.url {
        plan.restart_required.push("upstream.url");
    }
    if old.cache != new.cache {
        plan.restart_required.push("cache");
    }
    if old.precache.client_idle_timeout_secs != new.precache.client_idle_timeout_secs {
        plan.restart_required.push("precache.client_idle_timeout_secs");
    }

    plan.reinstall = old.precache.version != new.precache.version;
    plan
}

/// Apply the live part of a config change.
pub fn diff_and_apply(
    old: &Config,
    new: &Config,
    registration: &Arc<Registration>,
    runtime: &tokio::runtime::Handle,
) {
    let plan = plan_reload(old, new);

    for setting in &plan.restart_required {
        tracing::warn!(setting, "config change detected, ignoring. Restart to apply it");
    }

    if !plan.reinstall {
        if old.precache.urls != new.precache.urls {
            tracing::warn!(
                version = %new.precache.version,
                "precache urls changed without a version bump, ignoring"
            );
        }
        return;
    }

    let manifest = match new.precache.manifest() {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(error = %e, "config reloaded with an invalid manifest");
            return;
        }
    };

    tracing::info!(
        old = %old.precache.version,
        new = %new.precache.version,
        "config reloaded: precache version changed, installing new generation"
    );
    let registration = Arc::clone(registration);
    let skip_waiting = new.precache.skip_waiting;
    runtime.spawn(async move {
        crate::register_manifest(&registration, manifest, skip_waiting).await;
    });
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_backend() -> Backend {
    Backend::Memory
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from("precache-data")
}
fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}
fn default_urls() -> Vec<String> {
    DEFAULT_URLS.iter().map(|u| u.to_string()).collect()
}
fn default_skip_waiting() -> bool {
    true
}
fn default_client_idle_timeout_secs() -> u64 {
    30 * 60
}
