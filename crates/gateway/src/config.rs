use crate::gateway::Gateway;
use crate::lifecycle::{GenerationSet, Lifecycle};
use crate::request::Scope;
use arcade_cache::{CacheStore, StorageError};
use axum::http::Uri;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub scope: ScopeConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    pub url: String,
}

/// Extra hosts intercepted besides the upstream. Empty = intercept everything.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ScopeConfig {
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// Version stamps for the two partitions. Bumping either one invalidates
/// that partition on the next activation.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GenerationConfig {
    #[serde(default = "default_app")]
    pub app: String,
    #[serde(default = "default_version")]
    pub general_version: u32,
    #[serde(default = "default_version")]
    pub image_version: u32,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Disk,
    Memory,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_storage_kind")]
    pub backend: StorageKind,
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Config {
            server: ServerConfig::default(),
            upstream: UpstreamConfig {
                url: "http://127.0.0.1:3000".to_string(),
            },
            scope: ScopeConfig::default(),
            generation: GenerationConfig::default(),
            storage: StorageConfig::default(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.upstream_uri()?;
        for name in [self.generation.general_name(), self.generation.image_name()] {
            arcade_cache::traits::validate_partition_name(&name)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(())
    }

    pub fn upstream_uri(&self) -> Result<Uri, ConfigError> {
        let uri: Uri = self
            .upstream
            .url
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("upstream.url: {e}")))?;
        if !matches!(uri.scheme_str(), Some("http" | "https")) || uri.host().is_none() {
            return Err(ConfigError::Invalid(format!(
                "upstream.url must be an absolute http(s) URL, got {}",
                self.upstream.url
            )));
        }
        Ok(uri)
    }

    pub fn intercept_scope(&self) -> Scope {
        let upstream = self.upstream_uri().ok();
        Scope::new(upstream.as_ref().and_then(|u| u.host()), &self.scope.hosts)
    }
}

impl GenerationConfig {
    /// `"<app>-v<N>-cache"`
    pub fn general_name(&self) -> String {
        format!("{}-v{}-cache", self.app, self.general_version)
    }

    /// `"<app>-image-cache-v<M>"`
    pub fn image_name(&self) -> String {
        format!("{}-image-cache-v{}", self.app, self.image_version)
    }

    pub fn resolve(&self, store: &CacheStore) -> Result<GenerationSet, StorageError> {
        GenerationSet::new(store, &self.general_name(), &self.image_name())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_addr: default_admin_addr(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            app: default_app(),
            general_version: default_version(),
            image_version: default_version(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_kind(),
            dir: default_storage_dir(),
        }
    }
}

/// Compare old and new config, apply safe changes, reject unsafe ones.
///
/// - Generation changed → install + activate the new one (old partitions dropped)
/// - Scope changed → atomic update
/// - Listener, upstream or storage changed → WARN log, ignore (restart required)
pub async fn diff_and_apply(old: &Config, new: &Config, gateway: &Gateway, lifecycle: &Lifecycle) {
    if old.server != new.server {
        tracing::warn!("listener change detected ignored. Restart to rebind");
    }
    if old.upstream != new.upstream {
        tracing::warn!(
            old = %old.upstream.url,
            new = %new.upstream.url,
            "upstream change detected ignored. Restart to switch origin"
        );
    }
    if old.storage != new.storage {
        tracing::warn!("storage change detected ignored. Restart to switch backend");
    }

    let old_scope = old.intercept_scope();
    let new_scope = new.intercept_scope();
    if old_scope != new_scope {
        gateway.set_scope(new_scope);
        tracing::info!(hosts = ?new.scope.hosts, "config reloaded: scope changed");
    }

    if old.generation != new.generation {
        let generation = match new.generation.resolve(lifecycle.store()) {
            Ok(g) => g,
            Err(e) => {
                tracing::error!(error = %e, "config reloaded: invalid generation, keeping current");
                return;
            }
        };
        match lifecycle.install_and_activate(generation).await {
            Ok(report) => tracing::info!(
                general = %new.generation.general_name(),
                image = %new.generation.image_name(),
                deleted = ?report.deleted,
                "config reloaded: generation bumped"
            ),
            Err(e) => tracing::error!(error = %e, "config reloaded: generation activation failed"),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_admin_addr() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_app() -> String {
    "game".to_string()
}
fn default_version() -> u32 {
    1
}
fn default_storage_kind() -> StorageKind {
    StorageKind::Disk
}
fn default_storage_dir() -> PathBuf {
    PathBuf::from("cache-data")
}
