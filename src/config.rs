//! Configuration for a SentinelFS mount.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure.
///
/// Every field has a default, so a config file only needs to name what it
/// overrides. CLI flags win over the file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Detection thresholds
    #[serde(default)]
    pub detection: DetectionConfig,

    /// JIT backup behavior
    #[serde(default)]
    pub backup: BackupConfig,

    /// Mount options
    #[serde(default)]
    pub mount: MountConfig,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Entropy above which a non-whitelisted write is blocked (bits per
    /// byte, exclusive range 0-8). Writes measuring exactly this value
    /// pass.
    #[serde(default = "default_entropy_threshold")]
    pub entropy_threshold: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            entropy_threshold: default_entropy_threshold(),
        }
    }
}

/// JIT backup behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Pre-images larger than this many bytes are never backed up
    #[serde(default = "default_size_limit")]
    pub size_limit: u64,

    /// Backup directory name, created under the storage root
    #[serde(default = "default_backup_dir")]
    pub dir_name: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            size_limit: default_size_limit(),
            dir_name: default_backup_dir(),
        }
    }
}

/// Mount options
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MountConfig {
    /// Allow other users to access the mount
    #[serde(default)]
    pub allow_other: bool,

    /// Unmount automatically when the process exits
    #[serde(default)]
    pub auto_unmount: bool,
}

// Default value functions for serde

fn default_entropy_threshold() -> f64 {
    7.5
}

fn default_size_limit() -> u64 {
    50 * 1024 * 1024
}

fn default_backup_dir() -> String {
    ".sentinelfs_backups".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = Config::default();
        assert_eq!(config.detection.entropy_threshold, 7.5);
        assert_eq!(config.backup.size_limit, 52_428_800);
        assert_eq!(config.backup.dir_name, ".sentinelfs_backups");
        assert!(!config.mount.allow_other);
        assert!(!config.mount.auto_unmount);
    }

    #[test]
    fn partial_yaml_keeps_remaining_defaults() {
        let yaml = "detection:\n  entropy_threshold: 6.9\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.detection.entropy_threshold, 6.9);
        assert_eq!(config.backup.size_limit, 52_428_800);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = Config::default();
        config.backup.size_limit = 1024;
        config.mount.allow_other = true;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.backup.size_limit, 1024);
        assert!(loaded.mount.allow_other);
        assert_eq!(loaded.detection.entropy_threshold, 7.5);
    }
}
