/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Restore processing
//!
//! Turns a downloaded artifact back into wallet files. The archive is
//! extracted into a staging directory inside the data directory and only
//! installed once the primary data file is known to be present, so a rejected
//! archive never leaves files behind.

use crate::{
    compression::ZipCompression,
    encryption::{is_encrypted_file, AesGcmCipher},
    error::{BackupError, Result},
    naming::NamingPolicy,
    secret::BackupSecret,
    wallet::{WalletDataSource, RESTORE_STAGING_PREFIX},
};
use chrono::{DateTime, Utc};
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info, warn};

/// Outcome of a successful restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub files_restored: usize,
    /// Creation time encoded in the artifact's name, if it follows the
    /// naming policy.
    pub artifact_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct RestoreProcessor {
    naming: NamingPolicy,
    compression: ZipCompression,
    cipher: AesGcmCipher,
    wallet: Arc<dyn WalletDataSource>,
}

impl RestoreProcessor {
    pub fn new(
        naming: NamingPolicy,
        compression: ZipCompression,
        cipher: AesGcmCipher,
        wallet: Arc<dyn WalletDataSource>,
    ) -> Self {
        Self {
            naming,
            compression,
            cipher,
            wallet,
        }
    }

    /// Restore `source` into the wallet's data directory.
    pub async fn restore(
        &self,
        source: &Path,
        scratch_dir: &Path,
        secret: Option<&BackupSecret>,
    ) -> Result<RestoreReport> {
        let file_name = source
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_string();
        let encrypted = self.naming.extension_of(&file_name) == Some(AesGcmCipher::EXTENSION)
            || is_encrypted_file(source)?;

        let archive = match (secret, encrypted) {
            (None, true) => return Err(BackupError::BackupIsEncrypted),
            (Some(secret), true) => {
                let decrypted = scratch_dir.join("restore.zip");
                let cipher = self.cipher.clone();
                let secret = secret.clone();
                let (input, output) = (source.to_path_buf(), decrypted.clone());
                tokio::task::spawn_blocking(move || cipher.decrypt_file(&secret, &input, &output))
                    .await??;
                decrypted
            }
            (Some(_), false) => {
                warn!("Backup {} is not encrypted, ignoring the password", file_name);
                source.to_path_buf()
            }
            (None, false) => source.to_path_buf(),
        };

        let data_dir = self.wallet.data_dir().to_path_buf();
        tokio::fs::create_dir_all(&data_dir).await?;
        let staging = tempfile::Builder::new()
            .prefix(RESTORE_STAGING_PREFIX)
            .tempdir_in(&data_dir)?;
        let incoming = staging.path().join("incoming");
        let previous = staging.path().join("previous");
        tokio::fs::create_dir(&incoming).await?;

        let compression = self.compression.clone();
        let extract_to = incoming.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            compression.decompress(&archive, &extract_to)
        })
        .await?
        .map_err(|e| match e {
            BackupError::Compression(reason) => {
                BackupError::StorageTampered(format!("Invalid backup archive: {}", reason))
            }
            other => other,
        })?;

        if !incoming.join(self.wallet.primary_data_file_name()).is_file() {
            return Err(BackupError::StorageTampered("Invalid encrypted backup.".to_string()));
        }

        tokio::task::spawn_blocking(move || install(&incoming, &previous, &data_dir)).await??;
        drop(staging);

        let report = RestoreReport {
            files_restored: extracted.len(),
            artifact_created_at: self.naming.parse(&file_name),
        };
        info!("Restored {} files from {}", report.files_restored, file_name);
        Ok(report)
    }
}

/// Move every top-level entry of `incoming` into `target`.
///
/// Replaced entries are parked in `previous` until every entry is in place.
/// If any step fails the entries already installed are reverted, so the
/// target ends up either fully restored or unchanged.
fn install(incoming: &Path, previous: &Path, target: &Path) -> Result<()> {
    install_with(incoming, previous, target, |from, to| std::fs::rename(from, to))
}

fn install_with<F>(incoming: &Path, previous: &Path, target: &Path, rename: F) -> Result<()>
where
    F: Fn(&Path, &Path) -> io::Result<()>,
{
    let mut names = std::fs::read_dir(incoming)?
        .map(|entry| entry.map(|entry| entry.file_name()))
        .collect::<io::Result<Vec<_>>>()?;
    names.sort();
    std::fs::create_dir_all(previous)?;

    let mut steps: Vec<InstallStep> = Vec::with_capacity(names.len());
    for name in names {
        let mut step = InstallStep {
            destination: target.join(&name),
            parked: previous.join(&name),
            original: Original::Absent,
            placed: false,
        };
        let result = step.apply(&incoming.join(&name), &rename);
        steps.push(step);

        if let Err(e) = result {
            warn!("Restore install failed, rolling back: {}", e);
            for step in steps.iter().rev() {
                step.undo(&rename);
            }
            return Err(e.into());
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Original {
    Absent,
    // Hard link in `previous`; the live file stays in place until replaced.
    Linked,
    Moved,
}

#[derive(Debug)]
struct InstallStep {
    destination: PathBuf,
    parked: PathBuf,
    original: Original,
    placed: bool,
}

impl InstallStep {
    fn apply<F>(&mut self, source: &Path, rename: &F) -> io::Result<()>
    where
        F: Fn(&Path, &Path) -> io::Result<()>,
    {
        match std::fs::symlink_metadata(&self.destination) {
            Ok(metadata) => {
                let linked = metadata.is_file()
                    && std::fs::symlink_metadata(source)?.is_file()
                    && std::fs::hard_link(&self.destination, &self.parked).is_ok();
                if linked {
                    self.original = Original::Linked;
                } else {
                    rename(&self.destination, &self.parked)?;
                    self.original = Original::Moved;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        rename(source, &self.destination)?;
        self.placed = true;
        debug!("Installed {}", self.destination.display());
        Ok(())
    }

    fn undo<F>(&self, rename: &F)
    where
        F: Fn(&Path, &Path) -> io::Result<()>,
    {
        let result = match (self.original, self.placed) {
            (Original::Absent, false) | (Original::Linked, false) => Ok(()),
            (Original::Absent, true) => remove_path(&self.destination),
            (Original::Linked, true) => rename(&self.parked, &self.destination),
            (Original::Moved, placed) => {
                let cleared = if placed {
                    remove_path(&self.destination)
                } else {
                    Ok(())
                };
                cleared.and_then(|_| rename(&self.parked, &self.destination))
            }
        };
        if let Err(e) = result {
            warn!("Failed to roll back {}: {}", self.destination.display(), e);
        }
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    if std::fs::symlink_metadata(path)?.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}
