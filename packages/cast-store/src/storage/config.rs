// Store configuration management
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory for content objects and the metadata database
    pub root: PathBuf,

    /// Storage type (currently only "local" is supported)
    #[serde(default = "default_storage_type")]
    pub storage_type: String,

    /// Limit assigned to an owner on first activity
    #[serde(default = "default_byte_limit")]
    pub default_byte_limit: u64,

    /// How long an operation waits for a fingerprint or owner lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// SQLite connection pool size
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_storage_type() -> String {
    "local".to_string()
}

fn default_byte_limit() -> u64 {
    10_000_000
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_max_connections() -> u32 {
    1
}

impl StoreConfig {
    /// Load configuration with the following priority:
    /// 1. CAST_STORE environment variable
    /// 2. config.toml file
    /// 3. Default: ~/.cache/cast
    ///
    /// CAST_BYTE_LIMIT overrides the default byte limit in every case.
    pub async fn load() -> Result<Self> {
        let mut config = Self::load_base().await?;

        if let Ok(limit) = std::env::var("CAST_BYTE_LIMIT") {
            config.default_byte_limit = limit
                .parse()
                .with_context(|| format!("Invalid CAST_BYTE_LIMIT: {}", limit))?;
        }

        config.validate()?;
        Ok(config)
    }

    async fn load_base() -> Result<Self> {
        if let Ok(env_path) = std::env::var("CAST_STORE") {
            return Ok(Self::with_root(env_path));
        }

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                let content = fs::read_to_string(&config_path).await.with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

                let config: StoreConfig = toml::from_str(&content).with_context(|| {
                    format!("Failed to parse config file: {}", config_path.display())
                })?;

                return Ok(config);
            }
        }

        Ok(Self::default())
    }

    /// Build a config rooted at `root` with default settings
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.storage_type != "local" {
            anyhow::bail!("Unsupported storage type: {}", self.storage_type);
        }
        if self.max_connections == 0 {
            anyhow::bail!("max_connections must be at least 1");
        }
        Ok(())
    }

    /// Get the config file path (~/.config/cast/config.toml)
    fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("cast").join("config.toml"))
    }

    /// Save configuration to config file
    pub async fn save(&self) -> Result<()> {
        let config_path =
            Self::config_file_path().context("Failed to determine config directory")?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&config_path, content)
            .await
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Get the store directory path
    pub fn store_path(&self) -> PathBuf {
        self.root.join("store")
    }

    /// Get the metadata database path
    pub fn db_path(&self) -> PathBuf {
        self.root.join("meta.db")
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        let root = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cast");

        Self {
            root,
            storage_type: default_storage_type(),
            default_byte_limit: default_byte_limit(),
            lock_timeout_ms: default_lock_timeout_ms(),
            max_connections: default_max_connections(),
        }
    }
}
