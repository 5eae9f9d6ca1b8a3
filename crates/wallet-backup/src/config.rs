/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Configuration for the wallet backup system
//!
//! Loaded from a TOML file, then overridden by `WALLET_BACKUP_*` environment
//! variables, then validated.

use crate::{
    compression::CompressionConfig,
    encryption::{EncryptionConfig, MAX_ITERATIONS, MAX_MEMORY_COST_KIB, MAX_PARALLELISM},
    error::{BackupError, Result},
    naming::{NamingConfig, NamingPolicy},
    scheduler::{ScheduleConfig, MAX_SCHEDULE_DELAY},
    storage::{LocalStorageConfig, StorageBackendType, StorageConfig},
};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, warn};

/// Main configuration for the wallet backup system
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletBackupConfig {
    pub naming: NamingConfig,
    pub schedule: ScheduleConfig,
    pub compression: CompressionConfig,
    pub encryption: EncryptionConfig,
    pub storage: StorageConfig,
    pub paths: PathsConfig,
}

/// Wallet and working paths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Live wallet data directory.
    pub data_dir: PathBuf,
    /// File inside `data_dir` every valid backup must contain.
    pub primary_data_file: String,
    /// Parent of the per-run scratch directories.
    pub scratch_dir: PathBuf,
    pub settings_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("wallet"),
            primary_data_file: "wallet.sqlite".to_string(),
            scratch_dir: std::env::temp_dir().join("wallet-backup"),
            settings_file: PathBuf::from("wallet-backup-settings.json"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend_type: StorageBackendType::Local,
            local: Some(LocalStorageConfig {
                path: PathBuf::from("backups"),
                create_directories: true,
            }),
        }
    }
}

impl WalletBackupConfig {
    /// Create a default configuration with local storage at the specified path
    pub fn default_with_path(path: &Path) -> Self {
        Self {
            storage: StorageConfig {
                backend_type: StorageBackendType::Local,
                local: Some(LocalStorageConfig {
                    path: path.to_path_buf(),
                    create_directories: true,
                }),
            },
            ..Self::default()
        }
    }

    /// Load configuration from an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => {
                debug!("No configuration file given, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading configuration from file: {}", path.display());
        let content = std::fs::read_to_string(path)
            .map_err(|e| BackupError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| BackupError::Config(format!("TOML parse error: {}", e)))
    }

    /// Apply `WALLET_BACKUP_*` overrides resolved through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(prefix) = lookup("WALLET_BACKUP_PREFIX") {
            self.naming.prefix = prefix;
        }

        if let Some(data_dir) = lookup("WALLET_BACKUP_DATA_DIR") {
            self.paths.data_dir = data_dir.into();
        }

        if let Some(primary) = lookup("WALLET_BACKUP_PRIMARY_FILE") {
            self.paths.primary_data_file = primary;
        }

        if let Some(scratch_dir) = lookup("WALLET_BACKUP_SCRATCH_DIR") {
            self.paths.scratch_dir = scratch_dir.into();
        }

        if let Some(settings_file) = lookup("WALLET_BACKUP_SETTINGS_FILE") {
            self.paths.settings_file = settings_file.into();
        }

        if let Some(storage_path) = lookup("WALLET_BACKUP_STORAGE_PATH") {
            self.storage.backend_type = StorageBackendType::Local;
            match self.storage.local.as_mut() {
                Some(local) => local.path = storage_path.into(),
                None => {
                    self.storage.local = Some(LocalStorageConfig {
                        path: storage_path.into(),
                        create_directories: true,
                    })
                }
            }
        }

        if let Some(interval) = lookup("WALLET_BACKUP_INTERVAL_SECS") {
            self.schedule.backup_interval = Duration::from_secs(interval.parse().map_err(|e| {
                BackupError::Config(format!("Invalid WALLET_BACKUP_INTERVAL_SECS: {}", e))
            })?);
        }

        if let Some(delay) = lookup("WALLET_BACKUP_RETRY_DELAY_SECS") {
            self.schedule.retry_delay = Duration::from_secs(delay.parse().map_err(|e| {
                BackupError::Config(format!("Invalid WALLET_BACKUP_RETRY_DELAY_SECS: {}", e))
            })?);
        }

        if let Some(max_retries) = lookup("WALLET_BACKUP_MAX_RETRIES") {
            self.schedule.max_retries = max_retries.parse().map_err(|e| {
                BackupError::Config(format!("Invalid WALLET_BACKUP_MAX_RETRIES: {}", e))
            })?;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        NamingPolicy::new(&self.naming)?;

        if self.schedule.backup_interval.is_zero() {
            return Err(BackupError::Config("schedule.backup_interval must be positive".to_string()));
        }
        if self.schedule.backup_interval > MAX_SCHEDULE_DELAY {
            return Err(BackupError::Config(format!(
                "schedule.backup_interval must not exceed {}s",
                MAX_SCHEDULE_DELAY.as_secs()
            )));
        }
        if self.schedule.retry_delay > MAX_SCHEDULE_DELAY {
            return Err(BackupError::Config(format!(
                "schedule.retry_delay must not exceed {}s",
                MAX_SCHEDULE_DELAY.as_secs()
            )));
        }
        if self.schedule.retry_delay > self.schedule.backup_interval {
            warn!(
                "Retry delay {:?} is longer than the backup interval {:?}",
                self.schedule.retry_delay, self.schedule.backup_interval
            );
        }

        let primary = Path::new(&self.paths.primary_data_file);
        if self.paths.primary_data_file.is_empty()
            || primary.is_absolute()
            || primary
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(BackupError::Config(format!(
                "paths.primary_data_file must be a relative path inside the data directory: {:?}",
                self.paths.primary_data_file
            )));
        }

        let kdf = &self.encryption.key_derivation;
        if kdf.iterations == 0
            || kdf.iterations > MAX_ITERATIONS
            || kdf.parallelism == 0
            || kdf.parallelism > MAX_PARALLELISM
            || kdf.memory_cost_kib < 8 * kdf.parallelism
            || kdf.memory_cost_kib > MAX_MEMORY_COST_KIB
        {
            return Err(BackupError::Config(
                "encryption.key_derivation parameters are out of range".to_string(),
            ));
        }

        if self.storage.backend_type == StorageBackendType::Local && self.storage.local.is_none() {
            return Err(BackupError::Config("Missing local storage config".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = WalletBackupConfig::default();
        config.validate().unwrap();
        assert_eq!(config.naming.prefix, "Wallet-Backup-");
        assert_eq!(config.schedule.backup_interval, Duration::from_secs(300));
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.toml");
        std::fs::write(
            &path,
            r#"
[naming]
prefix = "Tari-Aurora-Backup-"

[schedule]
max_retries = 2

[storage]
backend_type = "local"

[storage.local]
path = "/mnt/backups"
create_directories = false
"#,
        )
        .unwrap();

        let config = WalletBackupConfig::load_from_file(&path).unwrap();
        assert_eq!(config.naming.prefix, "Tari-Aurora-Backup-");
        assert_eq!(config.schedule.max_retries, 2);
        assert_eq!(config.schedule.retry_delay, Duration::from_secs(60));
        assert_eq!(config.storage.local.unwrap().path, PathBuf::from("/mnt/backups"));
        assert_eq!(config.paths.primary_data_file, "wallet.sqlite");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("WALLET_BACKUP_PREFIX", "Env-Backup-"),
            ("WALLET_BACKUP_STORAGE_PATH", "/srv/backups"),
            ("WALLET_BACKUP_MAX_RETRIES", "9"),
        ]
        .into_iter()
        .collect();

        let mut config = WalletBackupConfig::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.naming.prefix, "Env-Backup-");
        assert_eq!(config.schedule.max_retries, 9);
        assert_eq!(config.storage.local.unwrap().path, PathBuf::from("/srv/backups"));

        let mut config = WalletBackupConfig::default();
        let result = config.apply_env_overrides(|key| {
            (key == "WALLET_BACKUP_INTERVAL_SECS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(BackupError::Config(_))));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = WalletBackupConfig::default();
        config.naming.prefix.clear();
        assert!(config.validate().is_err());

        let mut config = WalletBackupConfig::default();
        config.paths.primary_data_file = "../outside.db".to_string();
        assert!(config.validate().is_err());

        let mut config = WalletBackupConfig::default();
        config.schedule.backup_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = WalletBackupConfig::default();
        config.encryption.key_derivation.iterations = u32::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_schedule_bounds() {
        let mut config = WalletBackupConfig::default();
        config
            .apply_env_overrides(|key| {
                (key == "WALLET_BACKUP_INTERVAL_SECS").then(|| "10000000000000".to_string())
            })
            .unwrap();
        assert!(matches!(config.validate(), Err(BackupError::Config(_))));

        let mut config = WalletBackupConfig::default();
        config.schedule.backup_interval = MAX_SCHEDULE_DELAY + Duration::from_secs(1);
        config.schedule.retry_delay = MAX_SCHEDULE_DELAY + Duration::from_secs(1);
        assert!(config.validate().is_err());

        let mut config = WalletBackupConfig::default();
        config.schedule.backup_interval = MAX_SCHEDULE_DELAY;
        config.schedule.retry_delay = MAX_SCHEDULE_DELAY;
        config.validate().unwrap();
    }
}
