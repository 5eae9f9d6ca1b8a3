/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! # Wallet Backup System
//!
//! Client-side data protection for a wallet application:
//!
//! - Timestamped, policy-named archives of the wallet's data files
//! - Zip compression and optional password encryption (AES-256-GCM, Argon2id)
//! - Pluggable storage backends with tamper detection
//! - A single-timer scheduler with bounded fixed-delay retries
//! - Restore with verification before anything is installed
//!
//! [`BackupCoordinator`] ties the pieces together and publishes its
//! [`BackupState`] through a watch channel.

pub mod backup;
pub mod compression;
pub mod config;
pub mod coordinator;
pub mod encryption;
pub mod error;
pub mod metrics;
pub mod naming;
pub mod restore;
pub mod scheduler;
pub mod secret;
pub mod settings;
pub mod state;
pub mod storage;
pub mod wallet;

pub use backup::{ArtifactBuilder, ArtifactDescriptor};
pub use compression::{CompressionConfig, CompressionLevel, ZipCompression};
pub use config::{PathsConfig, WalletBackupConfig};
pub use coordinator::{BackupCollaborators, BackupCoordinator, BackupOutcome};
pub use encryption::{AesGcmCipher, EncryptionConfig, KeyDerivationConfig};
pub use error::{BackupError, Result};
pub use naming::{NamingConfig, NamingPolicy};
pub use restore::{RestoreProcessor, RestoreReport};
pub use scheduler::{BackupScheduler, ScheduleConfig};
pub use secret::{BackupSecret, CredentialStore, MemoryCredentialStore};
pub use settings::{BackupSettings, JsonSettingsStore, MemorySettingsStore, RetryState, SettingsStore};
pub use state::{BackupState, BackupStateMachine};
pub use storage::{
    create_backend, LocalStorageBackend, LocalStorageConfig, MemoryStorageBackend, StorageBackend,
    StorageBackendType, StorageConfig,
};
pub use wallet::{DirectoryWallet, SourceFile, WalletDataSource};
