/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Error types for backup and restore operations

use std::sync::Arc;
use thiserror::Error;

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Errors raised by the backup pipeline, the storage backends and the
/// coordinator.
///
/// The type is cheap to clone so that a `Failed` state can keep the exact
/// cause that produced it.
#[derive(Error, Debug, Clone)]
pub enum BackupError {
    /// Source files are unavailable or a scratch file could not be created.
    #[error("Backup interrupted: {0}")]
    BuildInterrupted(String),

    /// The expected artifact is missing, or a restored file set lacks the
    /// wallet's primary data file.
    #[error("Backup storage tampered: {0}")]
    StorageTampered(String),

    /// Restore was attempted without the password the artifact requires.
    #[error("Backup file is encrypted, a password is needed")]
    BackupIsEncrypted,

    /// Authenticated decryption failed.
    #[error("Decryption failed: wrong password or corrupted archive")]
    DecryptionFailed,

    #[error("Backup storage setup cancelled")]
    StorageSetupCancelled,

    #[error("Backup storage setup failed: {0}")]
    StorageSetupFailed(String),

    #[error("Access to backup storage was revoked")]
    StorageAuthRevoked,

    #[error("Backup storage is full")]
    StorageFull,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl BackupError {
    /// Whether a scheduled run that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackupError::BuildInterrupted(_)
                | BackupError::Storage(_)
                | BackupError::Io(_)
                | BackupError::Compression(_)
                | BackupError::Task(_)
        )
    }

    /// Errors whose resolution requires an explicit user action.
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            BackupError::StorageTampered(_)
                | BackupError::BackupIsEncrypted
                | BackupError::DecryptionFailed
                | BackupError::StorageSetupCancelled
                | BackupError::StorageSetupFailed(_)
                | BackupError::StorageAuthRevoked
                | BackupError::StorageFull
        )
    }

    /// Get error category for metrics and logs
    pub fn category(&self) -> &'static str {
        match self {
            BackupError::BuildInterrupted(_) => "build_interrupted",
            BackupError::StorageTampered(_) => "storage_tampered",
            BackupError::BackupIsEncrypted => "backup_is_encrypted",
            BackupError::DecryptionFailed => "decryption_failed",
            BackupError::StorageSetupCancelled => "storage_setup_cancelled",
            BackupError::StorageSetupFailed(_) => "storage_setup_failed",
            BackupError::StorageAuthRevoked => "storage_auth_revoked",
            BackupError::StorageFull => "storage_full",
            BackupError::Storage(_) => "storage",
            BackupError::Io(_) => "io",
            BackupError::Compression(_) => "compression",
            BackupError::Encryption(_) => "encryption",
            BackupError::Serialization(_) => "serialization",
            BackupError::Config(_) => "config",
            BackupError::Task(_) => "task",
        }
    }
}

impl From<std::io::Error> for BackupError {
    fn from(err: std::io::Error) -> Self {
        BackupError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

impl From<zip::result::ZipError> for BackupError {
    fn from(err: zip::result::ZipError) -> Self {
        BackupError::Compression(err.to_string())
    }
}

impl From<tokio::task::JoinError> for BackupError {
    fn from(err: tokio::task::JoinError) -> Self {
        BackupError::Task(err.to_string())
    }
}
