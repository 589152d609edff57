//! EngineConfig - TOML 設定
//!
//! 全キー省略可。省略時は既定値（件数 50 / 100 MiB / 再試行 5 回 / 7 日 / 30 秒）。
//! 設定は構築時にのみ読まれ、実行中に変わらない。

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::RetryPolicy;
use crate::ports::StoreLimits;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read or write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub upload: UploadConfig,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub max_pending_captures: usize,
    pub max_storage_bytes: u64,
    pub retention_days: u32,
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let limits = StoreLimits::default();
        Self {
            max_pending_captures: limits.max_captures,
            max_storage_bytes: limits.max_bytes,
            retention_days: 7,
            db_path: PathBuf::from("capsync.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_retry_attempts: u32,
    pub interval_ms: u64,
    pub retention_sweep_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: RetryPolicy::default().max_attempts,
            interval_ms: 30_000,
            retention_sweep_interval_ms: 60 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub base_url: String,
    pub path: String,
    pub timeout_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            path: "/monitoring/submit".to_string(),
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub check_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 5_000,
        }
    }
}

impl EngineConfig {
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&s).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let s = toml::to_string_pretty(self)?;
        std::fs::write(path, s).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn store_limits(&self) -> StoreLimits {
        StoreLimits {
            max_captures: self.storage.max_pending_captures,
            max_bytes: self.storage.max_storage_bytes,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.sync.max_retry_attempts)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync.interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sync.retention_sweep_interval_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload.timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.network.check_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.storage.max_pending_captures, 50);
        assert_eq!(cfg.storage.max_storage_bytes, 104_857_600);
        assert_eq!(cfg.storage.retention_days, 7);
        assert_eq!(cfg.sync.max_retry_attempts, 5);
        assert_eq!(cfg.sync_interval(), Duration::from_secs(30));
        assert_eq!(cfg.upload_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.upload.path, "/monitoring/submit");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let cfg: EngineConfig = toml::from_str(
            r#"
            [storage]
            max_pending_captures = 10

            [sync]
            interval_ms = 1000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.storage.max_pending_captures, 10);
        assert_eq!(cfg.storage.max_storage_bytes, 104_857_600);
        assert_eq!(cfg.sync.interval_ms, 1000);
        assert_eq!(cfg.sync.max_retry_attempts, 5);
        assert_eq!(cfg.upload, UploadConfig::default());
    }

    #[test]
    fn save_then_load_gives_the_same_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("capsync.toml");
        let mut cfg = EngineConfig::default();
        cfg.upload.base_url = "https://api.example.test".into();
        cfg.storage.retention_days = 3;

        cfg.save_to(&path).unwrap();
        assert_eq!(EngineConfig::load_from(&path).unwrap(), cfg);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = EngineConfig::load_from(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[storage\nmax = ").unwrap();
        assert!(matches!(
            EngineConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
