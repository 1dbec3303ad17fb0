//! Per-user configuration
//!
//! Configuration lives in `beak.conf` under the user's config root; every
//! storage gets its own cache subdirectory under the cache root, named
//! after the sanitized storage URL. The file format is deliberately plain:
//! `key = value` lines with `#` comments.

use crate::error::{BeakError, Result};
use crate::storage::Storage;
use crate::types::ChunkingPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the configuration file inside the config root
pub const CONFIG_FILE: &str = "beak.conf";

/// Resolved per-user configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeakConfig {
    /// Directory `beak.conf` is read from
    pub config_dir: PathBuf,
    /// Directory storage caches live under
    pub cache_dir: PathBuf,
    /// Raw `key = value` settings from the file
    pub settings: BTreeMap<String, String>,
}

impl BeakConfig {
    /// Resolve the default per-user directories and load `beak.conf`
    ///
    /// Follows the XDG layout: `$XDG_CONFIG_HOME/beak` (or
    /// `~/.config/beak`) and `$XDG_CACHE_HOME/beak` (or `~/.cache/beak`).
    /// A missing config file is not an error; a malformed one is.
    pub fn load() -> Result<Self> {
        let config_dir = user_dir("XDG_CONFIG_HOME", ".config")?;
        let cache_dir = user_dir("XDG_CACHE_HOME", ".cache")?;
        Self::from_dirs(config_dir, cache_dir)
    }

    /// Load with explicit directories (tests, unusual setups)
    pub fn from_dirs(config_dir: PathBuf, cache_dir: PathBuf) -> Result<Self> {
        let file = config_dir.join(CONFIG_FILE);
        let settings = if file.exists() {
            parse_conf(&std::fs::read_to_string(&file)?)?
        } else {
            debug!("no {} at {}", CONFIG_FILE, config_dir.display());
            BTreeMap::new()
        };
        Ok(BeakConfig {
            config_dir,
            cache_dir,
            settings,
        })
    }

    /// Cache directory for one storage, creating it if necessary
    pub fn cache_dir_for(&self, storage: &Storage) -> Result<PathBuf> {
        let dir = self.cache_dir.join(storage.sanitized_name());
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Chunking policy from the settings, defaults applied
    pub fn chunking_policy(&self) -> Result<ChunkingPolicy> {
        match self.settings.get("target_size") {
            None => Ok(ChunkingPolicy::default()),
            Some(raw) => {
                let target_size = raw.parse().map_err(|_| {
                    BeakError::InvalidConfiguration(format!("target_size = {raw:?}"))
                })?;
                Ok(ChunkingPolicy::with_target_size(target_size))
            }
        }
    }
}

fn user_dir(xdg_var: &str, fallback: &str) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(xdg_var) {
        if !dir.is_empty() {
            return Ok(Path::new(&dir).join("beak"));
        }
    }
    let home = std::env::var("HOME")
        .map_err(|_| BeakError::InvalidConfiguration("HOME is not set".to_string()))?;
    Ok(Path::new(&home).join(fallback).join("beak"))
}

fn parse_conf(text: &str) -> Result<BTreeMap<String, String>> {
    let mut settings = BTreeMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            BeakError::InvalidConfiguration(format!("{CONFIG_FILE}:{}: {line:?}", lineno + 1))
        })?;
        settings.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_conf() {
        let settings = parse_conf("# comment\ntarget_size = 4096\n\nstorage = remote:b\n").unwrap();
        assert_eq!(settings.get("target_size").unwrap(), "4096");
        assert_eq!(settings.get("storage").unwrap(), "remote:b");
        assert!(parse_conf("no equals sign here").is_err());
    }

    #[test]
    fn test_policy_from_settings() {
        let config_dir = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        std::fs::write(
            config_dir.path().join(CONFIG_FILE),
            "target_size = 2048\n",
        )
        .unwrap();
        let config = BeakConfig::from_dirs(
            config_dir.path().to_path_buf(),
            cache_dir.path().to_path_buf(),
        )
        .unwrap();
        assert_eq!(config.chunking_policy().unwrap().target_size, 2048);
    }

    #[test]
    fn test_missing_conf_is_fine() {
        let config_dir = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let config = BeakConfig::from_dirs(
            config_dir.path().to_path_buf(),
            cache_dir.path().to_path_buf(),
        )
        .unwrap();
        assert!(config.settings.is_empty());
        assert_eq!(
            config.chunking_policy().unwrap(),
            ChunkingPolicy::default()
        );
    }

    #[test]
    fn test_cache_dir_per_storage() {
        let config_dir = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let config = BeakConfig::from_dirs(
            config_dir.path().to_path_buf(),
            cache_dir.path().to_path_buf(),
        )
        .unwrap();
        let dir = config
            .cache_dir_for(&Storage::rclone("gdrive:backups/tree"))
            .unwrap();
        assert!(dir.ends_with("gdrive_backups_tree"));
        assert!(dir.is_dir());
    }
}
