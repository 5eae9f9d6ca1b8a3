/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Wallet collaborator
//!
//! The backup pipeline treats the wallet's persisted data as an opaque set of
//! files. This module defines what it needs from the wallet and a plain
//! directory-backed implementation.

use crate::error::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Prefix of the staging directories created inside the data directory
/// during a restore. They are never part of a backup.
pub const RESTORE_STAGING_PREFIX: &str = ".restore-staging-";

/// A file to be placed in an archive under `archive_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub archive_name: String,
}

/// What the backup subsystem requires from the wallet.
#[async_trait]
pub trait WalletDataSource: Send + Sync + std::fmt::Debug {
    /// Live data directory restores are installed into.
    fn data_dir(&self) -> &Path;

    /// Name, relative to [`data_dir`](Self::data_dir), of the file without
    /// which a restore is rejected.
    fn primary_data_file_name(&self) -> &str;

    /// Every persisted data file, used for full (password protected) backups.
    async fn data_files(&self) -> Result<Vec<SourceFile>>;

    /// Write a lightweight snapshot of the essential data below `destination`
    /// and return the written files.
    async fn request_partial_snapshot(&self, destination: &Path) -> Result<Vec<SourceFile>>;

    /// Reload wallet state after files were replaced by a restore.
    async fn reload_after_restore(&self) -> Result<()>;
}

/// Wallet whose state is a directory on the local file system.
///
/// A partial snapshot contains only the primary data file.
#[derive(Debug, Clone)]
pub struct DirectoryWallet {
    data_dir: PathBuf,
    primary_data_file: String,
}

impl DirectoryWallet {
    pub fn new(data_dir: impl Into<PathBuf>, primary_data_file: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            primary_data_file: primary_data_file.into(),
        }
    }

    fn primary_path(&self) -> PathBuf {
        self.data_dir.join(&self.primary_data_file)
    }
}

#[async_trait]
impl WalletDataSource for DirectoryWallet {
    fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn primary_data_file_name(&self) -> &str {
        &self.primary_data_file
    }

    async fn data_files(&self) -> Result<Vec<SourceFile>> {
        let data_dir = self.data_dir.clone();
        tokio::task::spawn_blocking(move || collect_files(&data_dir)).await?
    }

    async fn request_partial_snapshot(&self, destination: &Path) -> Result<Vec<SourceFile>> {
        let source = self.primary_path();
        if !tokio::fs::try_exists(&source).await? {
            return Err(BackupError::BuildInterrupted(format!(
                "Wallet data file not found: {}",
                source.display()
            )));
        }

        let target = destination.join(&self.primary_data_file);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, &target).await?;
        debug!("Partial snapshot written to {}", target.display());

        Ok(vec![SourceFile {
            path: target,
            archive_name: archive_name(Path::new(&self.primary_data_file)),
        }])
    }

    async fn reload_after_restore(&self) -> Result<()> {
        info!("Wallet data restored into {}", self.data_dir.display());
        Ok(())
    }
}

fn collect_files(data_dir: &Path) -> Result<Vec<SourceFile>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(data_dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            !entry
                .file_name()
                .to_string_lossy()
                .starts_with(RESTORE_STAGING_PREFIX)
        });

    for entry in walker {
        let entry = entry.map_err(|e| BackupError::BuildInterrupted(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(data_dir)
            .map_err(|e| BackupError::BuildInterrupted(e.to_string()))?;
        files.push(SourceFile {
            archive_name: archive_name(relative),
            path: entry.path().to_path_buf(),
        });
    }
    Ok(files)
}

/// Zip entry names always use forward slashes.
fn archive_name(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
