/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Backup artifact creation
//!
//! Gathers the wallet's files, zips them and, when a password is present,
//! encrypts the archive. The result is a single named file in the scratch
//! directory ready for upload.

use crate::{
    compression::ZipCompression,
    encryption::AesGcmCipher,
    error::{BackupError, Result},
    naming::NamingPolicy,
    secret::BackupSecret,
    wallet::WalletDataSource,
};
use chrono::{DateTime, SubsecRound, Utc};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info};

/// A built backup artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub mime_type: String,
    pub is_encrypted: bool,
}

impl ArtifactDescriptor {
    pub fn file_name(&self) -> Result<String> {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                BackupError::BuildInterrupted(format!("Invalid artifact path {}", self.path.display()))
            })
    }
}

/// Builds backup artifacts from the wallet's data.
#[derive(Debug)]
pub struct ArtifactBuilder {
    naming: NamingPolicy,
    compression: ZipCompression,
    cipher: AesGcmCipher,
    wallet: Arc<dyn WalletDataSource>,
}

impl ArtifactBuilder {
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

    pub fn naming(&self) -> &NamingPolicy {
        &self.naming
    }

    /// Build an artifact inside `scratch_dir`.
    ///
    /// Without a secret only a partial snapshot of the wallet is archived;
    /// with one, every persisted data file is. The caller owns `scratch_dir`
    /// and removes it afterwards.
    pub async fn build(
        &self,
        scratch_dir: &Path,
        secret: Option<&BackupSecret>,
    ) -> Result<ArtifactDescriptor> {
        let created_at = Utc::now().trunc_subsecs(0);

        let sources = match secret {
            Some(_) => self.wallet.data_files().await?,
            None => {
                let snapshot_dir = scratch_dir.join("snapshot");
                tokio::fs::create_dir_all(&snapshot_dir).await?;
                self.wallet.request_partial_snapshot(&snapshot_dir).await?
            }
        };

        let primary = self.wallet.primary_data_file_name();
        if sources.is_empty() {
            return Err(BackupError::BuildInterrupted("Wallet has no data files".to_string()));
        }
        if !sources.iter().any(|file| file.archive_name == primary) {
            return Err(BackupError::BuildInterrupted(format!(
                "Wallet data file {} is missing",
                primary
            )));
        }

        let zip_path = scratch_dir.join(self.naming.format(created_at, ZipCompression::EXTENSION));
        let compression = self.compression.clone();
        let zip_target = zip_path.clone();
        let file_count = sources.len();
        let bytes = tokio::task::spawn_blocking(move || compression.compress(&sources, &zip_target))
            .await??;
        debug!("Archived {} files ({} bytes)", file_count, bytes);

        let descriptor = match secret {
            None => ArtifactDescriptor {
                path: zip_path,
                created_at,
                mime_type: ZipCompression::MIME_TYPE.to_string(),
                is_encrypted: false,
            },
            Some(secret) => {
                let enc_path = scratch_dir.join(self.naming.format(created_at, AesGcmCipher::EXTENSION));
                let cipher = self.cipher.clone();
                let secret = secret.clone();
                let (source, target) = (zip_path.clone(), enc_path.clone());
                tokio::task::spawn_blocking(move || cipher.encrypt_file(&secret, &source, &target))
                    .await??;
                tokio::fs::remove_file(&zip_path).await?;

                ArtifactDescriptor {
                    path: enc_path,
                    created_at,
                    mime_type: AesGcmCipher::MIME_TYPE.to_string(),
                    is_encrypted: true,
                }
            }
        };

        info!(
            "Built backup artifact {} (encrypted: {})",
            descriptor.path.display(),
            descriptor.is_encrypted
        );
        Ok(descriptor)
    }
}
