//! Configuration management for Neural Limiter.
//!
//! Settings are read from a YAML file and may be overridden from the
//! environment with the `NEURAL_` prefix and `__` as the nesting separator,
//! e.g. `NEURAL_STORE__URL=redis://cache:6379`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ::config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};
use crate::limiter::DEFAULT_RELOAD_CHANNEL;
use crate::store::{MemoryStore, Store, DEFAULT_CONCURRENT_KEY_TTL};

const ENV_PREFIX: &str = "NEURAL";

/// Main configuration of a limiter deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NeuralConfig {
    /// Shared store connection
    #[serde(default)]
    pub store: StoreSettings,

    /// Hot reload of limiter configs
    #[serde(default)]
    pub reload: ReloadSettings,

    /// Path to the limiter rule file
    #[serde(default)]
    pub rules_path: Option<PathBuf>,
}

/// Which store implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, for a single instance and tests
    #[default]
    Memory,
    /// Redis server, requires the `redis` feature
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL, required for the redis backend
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix of every store key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Expiry of concurrency counters in seconds
    #[serde(default = "default_concurrent_key_ttl_secs")]
    pub concurrent_key_ttl_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            key_prefix: default_key_prefix(),
            concurrent_key_ttl_secs: default_concurrent_key_ttl_secs(),
        }
    }
}

fn default_key_prefix() -> String {
    "neural:limiter:".to_string()
}

fn default_concurrent_key_ttl_secs() -> u64 {
    DEFAULT_CONCURRENT_KEY_TTL.as_secs()
}

/// Hot reload configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadSettings {
    #[serde(default = "default_reload_enabled")]
    pub enabled: bool,

    /// Pub/sub channel carrying changed limiter configs
    #[serde(default = "default_reload_channel")]
    pub channel: String,
}

impl Default for ReloadSettings {
    fn default() -> Self {
        Self {
            enabled: default_reload_enabled(),
            channel: default_reload_channel(),
        }
    }
}

fn default_reload_enabled() -> bool {
    true
}

fn default_reload_channel() -> String {
    DEFAULT_RELOAD_CHANNEL.to_string()
}

impl NeuralConfig {
    /// Load configuration from a file path, applying environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(LimiterError::Config(format!(
                "settings file not found: {}",
                path.display()
            )));
        }
        Self::build(File::from(path).format(FileFormat::Yaml), env_overrides())
    }

    /// Load configuration from YAML text, applying environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::build(File::from_str(yaml, FileFormat::Yaml), env_overrides())
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        Self::build(File::from_str("", FileFormat::Yaml), env_overrides())
    }

    fn build<S>(file: S, env: Environment) -> Result<Self>
    where
        S: ::config::Source + Send + Sync + 'static,
    {
        let config: NeuralConfig = Config::builder()
            .add_source(file)
            .add_source(env)
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        if self.reload.enabled && self.reload.channel.is_empty() {
            return Err(LimiterError::Config("reload.channel must not be empty".to_string()));
        }
        Ok(())
    }
}

fn env_overrides() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

impl StoreSettings {
    pub fn concurrent_key_ttl(&self) -> Duration {
        Duration::from_secs(self.concurrent_key_ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrent_key_ttl_secs == 0 {
            return Err(LimiterError::Config(
                "store.concurrent_key_ttl_secs must be positive".to_string(),
            ));
        }
        if self.backend == StoreBackend::Redis && self.url.as_deref().map_or(true, str::is_empty) {
            return Err(LimiterError::Config(
                "store.url is required for the redis backend".to_string(),
            ));
        }
        Ok(())
    }

    /// Open the configured store.
    pub async fn connect(&self) -> Result<Arc<dyn Store>> {
        self.validate()?;
        match self.backend {
            StoreBackend::Memory => Ok(Arc::new(
                MemoryStore::new().with_concurrent_key_ttl(self.concurrent_key_ttl()),
            )),
            StoreBackend::Redis => self.connect_redis().await,
        }
    }

    #[cfg(feature = "redis")]
    async fn connect_redis(&self) -> Result<Arc<dyn Store>> {
        use crate::store::{RedisStore, RedisStoreConfig};

        let url = self.url.as_deref().unwrap_or_default();
        let store = RedisStore::connect_with_config(
            url,
            RedisStoreConfig {
                key_prefix: self.key_prefix.clone(),
                concurrent_key_ttl: self.concurrent_key_ttl(),
            },
        )
        .await?;
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "redis"))]
    async fn connect_redis(&self) -> Result<Arc<dyn Store>> {
        Err(LimiterError::Config(
            "redis backend requested but built without the `redis` feature".to_string(),
        ))
    }
}
