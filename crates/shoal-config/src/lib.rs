//! # shoal-config
//!
//! Configuration management for Shoal.
//!
//! Loads configuration from:
//! 1. `~/.shoal/config.toml` (global)
//! 2. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| {
    RwLock::new(Config::load().unwrap_or_else(|e| {
        eprintln!("[shoal-config] WARNING: Failed to load config: {e}. Using defaults.");
        Config::default()
    }))
});

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap() = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub download: DownloadConfig,
}

impl Config {
    /// Load config from the standard location, then apply env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Global config path: ~/.shoal/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".shoal/config.toml"))
    }

    /// Apply environment variable overrides (highest priority)
    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("SHOAL_CACHE_ROOT") {
            self.storage.cache_root = PathBuf::from(root);
        }
        if let Ok(limit) = std::env::var("SHOAL_LIMIT_BYTES") {
            if let Ok(n) = limit.parse() {
                self.storage.limit_bytes = n;
            }
        }
        if let Ok(threshold) = std::env::var("SHOAL_FLUSH_THRESHOLD") {
            if let Ok(n) = threshold.parse() {
                self.download.flush_threshold = n;
            }
        }
        if let Ok(threads) = std::env::var("SHOAL_POOL_THREADS") {
            if let Ok(n) = threads.parse() {
                self.download.pool_threads = Some(n);
            }
        }
    }

    /// Get cache root directory
    pub fn cache_root(&self) -> &Path {
        &self.storage.cache_root
    }

    /// Get the durability/publication threshold in bytes
    pub fn flush_threshold(&self) -> u64 {
        self.download.flush_threshold
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding one subdirectory per cached remote file.
    /// Env override: SHOAL_CACHE_ROOT
    pub cache_root: PathBuf,
    /// Soft cap on total cached bytes (0 = unlimited). Enforcement is the
    /// eviction layer's job; the registry only keeps the counter.
    pub limit_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_root: dirs::home_dir()
                .map(|h| h.join(".shoal/cache"))
                .unwrap_or_else(|| PathBuf::from("/tmp/shoal_cache")),
            limit_bytes: 0,
        }
    }
}

/// Download configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Unflushed bytes that trigger a durability barrier and reader wakeup.
    pub flush_threshold: u64,
    /// Number of task pool worker threads (None = auto)
    pub pool_threads: Option<usize>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 64 * 1024,
            pool_threads: None,
        }
    }
}
