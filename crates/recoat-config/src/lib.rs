//! # recoat-config
//!
//! Configuration for recoat.
//!
//! Loads configuration from:
//! 1. `~/.recoat/config.toml`
//! 2. Environment variables (highest priority)

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

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
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub patch: PatchConfig,
    pub watch: WatchConfig,
    pub link: LinkConfig,
}

impl Config {
    /// Load config from the standard location, then apply env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(path) = Self::config_path() {
            if path.exists() {
                debug!("Loading config from {:?}", path);
                let contents = std::fs::read_to_string(&path)?;
                config = toml::from_str(&contents)?;
            }
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Config path: `~/.recoat/config.toml`
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".recoat/config.toml"))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("RECOAT_CACHE_ROOT") {
            self.cache.root = Some(PathBuf::from(root));
        }
        if let Ok(key) = std::env::var("RECOAT_TARGET_KEY") {
            self.cache.target_key = key;
        }
        if let Ok(dir) = std::env::var("RECOAT_SKIN_DIR") {
            self.patch.skin_dir = Some(PathBuf::from(dir));
        }
        if let Ok(ms) = std::env::var("RECOAT_DEBOUNCE_MS") {
            if let Ok(n) = ms.parse() {
                self.watch.debounce_ms = n;
            }
        }
    }
}

/// Where the cache lives and what to look for in it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Explicit cache root; `None` means the caller supplies it.
    pub root: Option<PathBuf>,
    /// Substring of the entry key identifying the target resource.
    pub target_key: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            target_key: "friends.css".to_string(),
        }
    }
}

/// How patched content points back at the skin files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Base URL of the loopback host serving original/custom files.
    pub loopback_base: String,
    /// Directory holding the user skin and the generated side files;
    /// `None` means a `skins` directory next to the cache root.
    pub skin_dir: Option<PathBuf>,
    /// Suppress already-patched log lines.
    pub quiet: bool,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            loopback_base: "https://127.0.0.1".to_string(),
            skin_dir: None,
            quiet: false,
        }
    }
}

/// Debounce tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Debounce window in milliseconds, fixed from a key's first event.
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { debounce_ms: 400 }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Hard-link aliasing tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Name of the alias subdirectory created next to locked files.
    pub alias_dir: String,
    /// Force aliasing on or off; `None` keeps the platform default.
    pub force: Option<bool>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            alias_dir: ".recoat-links".to_string(),
            force: None,
        }
    }
}

impl LinkConfig {
    /// Whether aliasing is enabled, honoring the platform default when
    /// not forced.
    pub fn enabled(&self) -> bool {
        self.force.unwrap_or(cfg!(windows))
    }
}
