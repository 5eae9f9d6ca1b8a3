/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Handlers for the wallet backup commands

use std::{io::Write, sync::Arc};

use anyhow::{Context, bail};
use serde_json::json;
use tracing::{debug, info};
use wallet_backup::{
    BackupCollaborators, BackupCoordinator, BackupOutcome, BackupSecret, DirectoryWallet,
    JsonSettingsStore, MemoryCredentialStore, WalletBackupConfig, create_backend, NamingPolicy,
};

use super::Commands;

/// Environment variable holding the backup password for non-interactive use.
pub const PASSWORD_ENV: &str = "WALLET_BACKUP_PASSWORD";

/// Everything a command needs to talk to the backup system.
pub struct BackupContext {
    pub config: WalletBackupConfig,
    pub coordinator: BackupCoordinator,
}

impl BackupContext {
    pub fn build(config: WalletBackupConfig) -> anyhow::Result<Self> {
        let naming = NamingPolicy::new(&config.naming)?;
        let storage = create_backend(&config.storage, naming)?;
        let wallet = Arc::new(DirectoryWallet::new(
            config.paths.data_dir.clone(),
            config.paths.primary_data_file.clone(),
        ));
        let settings = Arc::new(JsonSettingsStore::new(config.paths.settings_file.clone()));

        // The password is not persisted between invocations.
        let remembered = std::env::var(PASSWORD_ENV)
            .ok()
            .and_then(|password| BackupSecret::from_password(&password));
        let credentials = Arc::new(MemoryCredentialStore::new(remembered));

        let coordinator = BackupCoordinator::new(
            &config,
            BackupCollaborators {
                wallet,
                storage,
                settings,
                credentials,
            },
        )
        .context("Failed to initialize the backup coordinator")?;

        Ok(Self {
            config,
            coordinator,
        })
    }
}

impl Commands {
    pub async fn exec(self, ctx: BackupContext) -> anyhow::Result<()> {
        let coordinator = ctx.coordinator;
        coordinator.start().await;

        match self {
            Commands::Status => {
                let settings = coordinator.settings().await?;
                let state = coordinator.state();
                let status = json!({
                    "state": state.name(),
                    "detail": state.to_string(),
                    "settings": settings,
                    "storage": ctx.config.storage,
                });
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            Commands::Enable { encrypt } => {
                let secret = if encrypt {
                    Some(prompt_new_password()?)
                } else {
                    None
                };
                println!("Enabling wallet backups...");
                let outcome = coordinator.enable_backups(secret).await?;
                report_outcome(outcome)?;
            }
            Commands::Backup => {
                if !coordinator.settings().await?.backup_enabled {
                    bail!("Backups are disabled. Run `wallet-backup enable` first.");
                }
                println!("Backing up wallet...");
                report_outcome(coordinator.backup_now(false, None).await)?;
            }
            Commands::Check => {
                let settings = coordinator.settings().await?;
                match settings.last_successful_backup_at {
                    Some(created_at) if settings.backup_enabled => {
                        coordinator.check_storage_status().await?;
                        println!("✓ Backup from {} is present in storage", created_at.to_rfc3339());
                    }
                    _ => println!("No backup to check"),
                }
            }
            Commands::Restore { password } => {
                let secret = if password {
                    prompt_password("Backup password: ")?
                } else {
                    None
                };
                println!("Restoring wallet from the latest backup...");
                let report = coordinator.restore_latest(secret).await?;
                match report.artifact_created_at {
                    Some(created_at) => println!(
                        "✓ Restored {} files from the backup created at {}",
                        report.files_restored,
                        created_at.to_rfc3339()
                    ),
                    None => println!("✓ Restored {} files", report.files_restored),
                }
            }
            Commands::ChangePassword { remove } => {
                let secret = if remove {
                    None
                } else {
                    Some(prompt_new_password()?)
                };
                match coordinator.change_password(secret).await? {
                    BackupOutcome::Skipped => {
                        println!("Password updated. Backups are disabled, nothing was re-encrypted.")
                    }
                    outcome => report_outcome(outcome)?,
                }
            }
            Commands::Wipe { yes } => {
                if !yes && !confirm("Delete every wallet backup and disable backups? [y/N] ")? {
                    println!("Aborted");
                    return Ok(());
                }
                coordinator.disable_and_wipe().await?;
                println!("✓ Backups disabled and deleted");
            }
            Commands::Run => {
                schedule_on_entry(&coordinator).await?;
                let mut states = coordinator.subscribe();
                info!("Backup state: {}", coordinator.state());
                loop {
                    tokio::select! {
                        changed = states.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let state = states.borrow_and_update().clone();
                            info!("Backup state: {}", state);
                        }
                        signal = tokio::signal::ctrl_c() => {
                            signal.context("Failed to listen for ctrl-c")?;
                            debug!("Interrupt received");
                            break;
                        }
                    }
                }
            }
        }

        coordinator.shutdown().await;
        Ok(())
    }
}

/// Keep a persisted schedule, otherwise schedule a backup one interval out.
async fn schedule_on_entry(coordinator: &BackupCoordinator) -> anyhow::Result<()> {
    if !coordinator.has_pending_timer().await {
        coordinator.notify_wallet_changed().await?;
    }
    Ok(())
}

fn report_outcome(outcome: BackupOutcome) -> anyhow::Result<()> {
    match outcome {
        BackupOutcome::Completed { created_at } => {
            println!("✓ Backup created at {}", created_at.to_rfc3339());
        }
        BackupOutcome::Skipped => {
            println!("Backup skipped, another operation is in progress");
        }
        BackupOutcome::RetryScheduled { due_at: Some(due_at) } => {
            println!("Backup failed, retry scheduled for {}", due_at.to_rfc3339());
        }
        BackupOutcome::RetryScheduled { due_at: None } => {
            println!("Backup failed, a retry is already pending");
        }
        BackupOutcome::Failed(e) => bail!("Backup failed: {}", e),
    }
    Ok(())
}

fn prompt_password(prompt: &str) -> anyhow::Result<Option<BackupSecret>> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(BackupSecret::from_password(&password));
    }
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(BackupSecret::from_password(&password))
}

fn prompt_new_password() -> anyhow::Result<BackupSecret> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return BackupSecret::from_password(&password)
            .with_context(|| format!("{} is empty", PASSWORD_ENV));
    }
    let password = rpassword::prompt_password("New backup password: ")
        .context("Failed to read password")?;
    let confirmation = rpassword::prompt_password("Repeat password: ")
        .context("Failed to read password")?;
    if password != confirmation {
        bail!("Passwords do not match");
    }
    BackupSecret::from_password(&password).context("Password must not be empty")
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{}", prompt);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wallet_backup::BackupState;

    fn context(dir: &TempDir) -> BackupContext {
        let mut config = WalletBackupConfig::default_with_path(&dir.path().join("backups"));
        config.paths.data_dir = dir.path().join("wallet");
        config.paths.scratch_dir = dir.path().join("scratch");
        config.paths.settings_file = dir.path().join("settings.json");
        std::fs::create_dir_all(&config.paths.data_dir).unwrap();
        std::fs::create_dir_all(&config.paths.scratch_dir).unwrap();
        std::fs::write(config.paths.data_dir.join("wallet.sqlite"), b"wallet").unwrap();
        BackupContext::build(config).unwrap()
    }

    #[tokio::test]
    async fn test_build_context_starts_disabled() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        ctx.coordinator.start().await;
        assert!(matches!(ctx.coordinator.state(), BackupState::Disabled));
        let local = ctx.config.storage.local.unwrap();
        assert_eq!(local.path, dir.path().join("backups"));
        assert!(local.create_directories);
    }

    #[tokio::test]
    async fn test_run_schedules_backup_on_entry() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let coordinator = ctx.coordinator;
        coordinator.start().await;

        schedule_on_entry(&coordinator).await.unwrap();
        assert!(!coordinator.has_pending_timer().await);

        let outcome = coordinator.enable_backups(None).await.unwrap();
        assert!(matches!(outcome, BackupOutcome::Completed { .. }));
        assert!(matches!(coordinator.state(), BackupState::UpToDate));

        schedule_on_entry(&coordinator).await.unwrap();
        assert!(coordinator.has_pending_timer().await);
        assert!(matches!(coordinator.state(), BackupState::Scheduled(_)));
        coordinator.shutdown().await;
    }

    #[test]
    fn test_report_outcome() {
        assert!(report_outcome(BackupOutcome::Skipped).is_ok());
        assert!(report_outcome(BackupOutcome::RetryScheduled { due_at: None }).is_ok());
        assert!(
            report_outcome(BackupOutcome::Failed(wallet_backup::BackupError::StorageFull)).is_err()
        );
    }
}
