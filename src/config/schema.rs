//! Configuration schema for strata
//!
//! Configuration is stored at `~/.config/strata/config.toml`, optionally
//! overlaid by a project-local `.strata.toml`.

use crate::cache::CacheMode;
use crate::descriptor::DEFAULT_DESCRIPTOR;
use crate::sandbox::Isolation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Build settings
    pub build: BuildConfig,

    /// Layer cache settings
    pub cache: CacheConfig,

    /// Launch settings
    pub launch: LaunchConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Enable verbose logging
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
        }
    }
}

/// Build settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Descriptor file name inside the build context
    pub descriptor: String,

    /// Isolation of RUN steps
    pub isolation: Isolation,

    /// Extra directories searched for base snapshots
    pub base_dirs: Vec<PathBuf>,

    /// Environment set for RUN steps
    pub env: BTreeMap<String, String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            descriptor: DEFAULT_DESCRIPTOR.to_string(),
            isolation: Isolation::None,
            base_dirs: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

/// Layer cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Consult and populate the layer cache (default: true)
    pub enabled: bool,

    /// Where cache entries live
    pub mode: CacheMode,

    /// Size bound used by `strata cache prune`
    pub max_size_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: CacheMode::Disk,
            max_size_mb: 10 * 1024,
        }
    }
}

/// Launch settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Isolation of launched containers
    pub isolation: Isolation,

    /// Environment set on top of the inherited one
    pub env: BTreeMap<String, String>,

    /// Keep container directories after exit
    pub keep_rootfs: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[cache]"));
        assert!(toml.contains("mode = \"disk\""));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.build.descriptor, "Stratafile");
        assert!(config.cache.enabled);
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [cache]
            mode = "memory"

            [launch]
            isolation = "chroot"
            env = { APP_ENV = "test" }
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.cache.mode, CacheMode::Memory);
        assert_eq!(config.cache.max_size_mb, 10 * 1024); // default preserved
        assert_eq!(config.launch.isolation, Isolation::Chroot);
        assert_eq!(config.launch.env["APP_ENV"], "test");
    }

    #[test]
    fn unknown_isolation_rejected() {
        assert!(toml::from_str::<Config>("[build]\nisolation = \"vm\"").is_err());
    }
}
