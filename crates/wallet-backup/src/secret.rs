/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Backup passwords and their secure storage

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

/// Password protecting a backup artifact.
///
/// The buffer is wiped when the value is dropped and never printed.
#[derive(Clone)]
pub struct BackupSecret(Zeroizing<Vec<u8>>);

impl BackupSecret {
    /// Returns `None` for an empty password, which means "no encryption".
    pub fn from_password(password: &str) -> Option<Self> {
        if password.is_empty() {
            None
        } else {
            Some(Self(Zeroizing::new(password.as_bytes().to_vec())))
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        let bytes = Zeroizing::new(bytes);
        if bytes.is_empty() {
            None
        } else {
            Some(Self(bytes))
        }
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for BackupSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BackupSecret(<redacted>)")
    }
}

/// Secure credential store holding the remembered backup password.
#[async_trait]
pub trait CredentialStore: Send + Sync + fmt::Debug {
    async fn backup_password(&self) -> Result<Option<BackupSecret>>;

    async fn set_backup_password(&self, secret: Option<BackupSecret>) -> Result<()>;
}

/// Process-local credential store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    password: RwLock<Option<BackupSecret>>,
}

impl MemoryCredentialStore {
    pub fn new(password: Option<BackupSecret>) -> Self {
        Self {
            password: RwLock::new(password),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn backup_password(&self) -> Result<Option<BackupSecret>> {
        Ok(self.password.read().await.clone())
    }

    async fn set_backup_password(&self, secret: Option<BackupSecret>) -> Result<()> {
        *self.password.write().await = secret;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_password_means_no_secret() {
        assert!(BackupSecret::from_password("").is_none());
        assert!(BackupSecret::from_bytes(Vec::new()).is_none());
        let secret = BackupSecret::from_password("hunter2").unwrap();
        assert_eq!(secret.expose(), b"hunter2");
    }

    #[test]
    fn test_debug_is_redacted() {
        let secret = BackupSecret::from_password("hunter2").unwrap();
        assert!(!format!("{:?}", secret).contains("hunter2"));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryCredentialStore::default();
        assert!(store.backup_password().await.unwrap().is_none());

        store
            .set_backup_password(BackupSecret::from_password("pw"))
            .await
            .unwrap();
        assert_eq!(store.backup_password().await.unwrap().unwrap().expose(), b"pw");

        store.set_backup_password(None).await.unwrap();
        assert!(store.backup_password().await.unwrap().is_none());
    }
}
