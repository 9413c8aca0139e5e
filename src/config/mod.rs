//! Configuration management for kiln

pub mod schema;

pub use schema::Config;

use crate::error::{KilnError, KilnResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiln")
            .join("config.toml")
    }

    /// Get the state directory path
    pub fn state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiln")
    }

    /// Layer store directory, unless configured otherwise
    pub fn default_store_dir() -> PathBuf {
        Self::state_dir().join("store")
    }

    /// Load the file, falling back to defaults, then apply the environment
    pub async fn load(&self) -> KilnResult<Config> {
        let mut config = if self.config_path.exists() {
            self.load_from_file(&self.config_path).await?
        } else {
            debug!("Config file not found, using defaults");
            Config::default()
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> KilnResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| KilnError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| KilnError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Layer store directory after defaults
    pub fn store_dir(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(ConfigManager::default_store_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn clear_env() {
        for key in ["NO_CACHE", "NO_TTY", "KILN_OMIT", "KILN_ENGINE"] {
            std::env::remove_var(key);
        }
    }

    #[tokio::test]
    #[serial]
    async fn load_default_when_missing() {
        clear_env();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nonexistent.toml");
        let manager = ConfigManager::with_path(path);

        let config = manager.load().await.unwrap();
        assert!(config.build.cache);
        assert!(config.store_dir().ends_with("kiln/store"));
    }

    #[tokio::test]
    #[serial]
    async fn environment_overrides_file() {
        clear_env();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[build]\ncache = true\nomit = [\"debug\"]\n\n[store]\npath = \"/srv/kiln\"\n").unwrap();

        std::env::set_var("NO_CACHE", "1");
        std::env::set_var("KILN_OMIT", "run");
        let config = ConfigManager::with_path(path).load().await;
        clear_env();

        let config = config.unwrap();
        assert!(!config.build.cache);
        assert_eq!(config.build.omit, ["debug", "run"]);
        assert_eq!(config.store_dir(), PathBuf::from("/srv/kiln"));
    }

    #[tokio::test]
    #[serial]
    async fn invalid_file_is_reported() {
        clear_env();
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[build]\ncache = \"sometimes\"\n").unwrap();

        let err = ConfigManager::with_path(path).load().await.unwrap_err();
        assert!(matches!(err, KilnError::ConfigInvalid { .. }));
    }
}
