//! Configuration management for strata

pub mod schema;

pub use schema::Config;

use crate::error::{StrataError, StrataResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Name of the project-local config file
pub const LOCAL_CONFIG_FILE: &str = ".strata.toml";

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
            .join("strata")
            .join("config.toml")
    }

    /// Load configuration, creating default if not exists
    pub async fn load(&self) -> StrataResult<Config> {
        self.load_merged(None).await
    }

    /// Load the global configuration with a project-local file laid on top.
    ///
    /// Keys set in the local file win; tables are merged key by key.
    pub async fn load_merged(&self, local: Option<&Path>) -> StrataResult<Config> {
        let mut merged = if self.config_path.exists() {
            read_toml(&self.config_path).await?
        } else {
            debug!("Config file not found, using defaults");
            toml::Value::Table(toml::map::Map::new())
        };

        if let Some(local) = local {
            let overlay = read_toml(local).await?;
            merge_toml(&mut merged, overlay);
        }

        merged
            .try_into::<Config>()
            .map_err(|e: toml::de::Error| StrataError::ConfigInvalid {
                path: local.unwrap_or(&self.config_path).to_path_buf(),
                reason: e.to_string(),
            })
    }

    /// Find `.strata.toml` in `start` or any of its ancestors
    pub fn find_local_config(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(LOCAL_CONFIG_FILE))
            .find(|candidate| candidate.is_file())
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> StrataResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            StrataError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> StrataResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StrataError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
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

async fn read_toml(path: &Path) -> StrataResult<toml::Value> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| StrataError::io(format!("reading config from {}", path.display()), e))?;
    content
        .parse()
        .map_err(|e: toml::de::Error| StrataError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Deep-merge `overlay` into `base`; non-table values replace
fn merge_toml(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_toml(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Directories strata keeps its state in
#[derive(Debug, Clone)]
pub struct DataDirs {
    root: PathBuf,
}

impl DataDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<data_dir>/strata`
    pub fn default_root() -> PathBuf {
        dirs::data_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("strata")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// On-disk layer cache
    pub fn cache(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Saved images and their layers
    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Container root filesystems
    pub fn containers(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Shared base snapshots
    pub fn bases(&self) -> PathBuf {
        self.root.join("bases")
    }

    /// Scratch roots of RUN steps
    pub fn tmp(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Ensure all state directories exist
    pub async fn ensure(&self) -> StrataResult<()> {
        for dir in [
            self.cache(),
            self.images(),
            self.containers(),
            self.bases(),
            self.tmp(),
        ] {
            fs::create_dir_all(&dir).await.map_err(|e| {
                StrataError::io(format!("creating directory {}", dir.display()), e)
            })?;
        }
        Ok(())
    }
}

impl Default for DataDirs {
    fn default() -> Self {
        Self::new(Self::default_root())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheMode;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_default_when_missing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nonexistent.toml");
        let manager = ConfigManager::with_path(path);

        let config = manager.load().await.unwrap();
        assert_eq!(config.build.descriptor, "Stratafile");
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        let manager = ConfigManager::with_path(path);

        let mut config = Config::default();
        config.cache.max_size_mb = 64;

        manager.save(&config).await.unwrap();
        let loaded = manager.load().await.unwrap();

        assert_eq!(loaded.cache.max_size_mb, 64);
    }

    #[tokio::test]
    async fn local_config_overrides_keys() {
        let temp = TempDir::new().unwrap();
        let global = temp.path().join("config.toml");
        std::fs::write(&global, "[cache]\nmax_size_mb = 100\nmode = \"disk\"\n").unwrap();
        let project = temp.path().join("project");
        std::fs::create_dir_all(project.join("src")).unwrap();
        std::fs::write(project.join(LOCAL_CONFIG_FILE), "[cache]\nmode = \"memory\"\n").unwrap();

        let local = ConfigManager::find_local_config(&project.join("src")).unwrap();
        let config = ConfigManager::with_path(global)
            .load_merged(Some(&local))
            .await
            .unwrap();

        assert_eq!(config.cache.mode, CacheMode::Memory);
        assert_eq!(config.cache.max_size_mb, 100);
    }

    #[tokio::test]
    async fn invalid_config_reports_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[cache]\nmode = \"tape\"\n").unwrap();

        let err = ConfigManager::with_path(path.clone()).load().await.unwrap_err();
        match err {
            StrataError::ConfigInvalid { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn data_dirs_layout() {
        let dirs = DataDirs::new("/var/lib/strata");
        assert_eq!(dirs.cache(), PathBuf::from("/var/lib/strata/cache"));
        assert_eq!(dirs.containers(), PathBuf::from("/var/lib/strata/containers"));
    }
}
