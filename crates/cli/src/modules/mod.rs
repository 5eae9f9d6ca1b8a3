/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

pub mod backup;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, about, long_about = None)]
#[command(name = "wallet-backup")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the backup state and persisted settings
    Status,

    /// Enable backups and run the initial backup
    Enable {
        /// Encrypt backups with a password
        #[arg(short, long)]
        encrypt: bool,
    },

    /// Run a backup now
    Backup,

    /// Verify that the latest backup is still present in storage
    Check,

    /// Restore the wallet from the latest backup
    Restore {
        /// Prompt for the backup password instead of using the stored one
        #[arg(short, long)]
        password: bool,
    },

    /// Change the backup password and re-encrypt
    ChangePassword {
        /// Disable encryption instead of setting a new password
        #[arg(long)]
        remove: bool,
    },

    /// Disable backups and delete every backup from storage
    Wipe {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Resume a persisted schedule, or schedule a backup one interval out,
    /// then keep the scheduler running until interrupted
    Run,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_commands() {
        let cli = Cli::parse_from(["wallet-backup", "--config", "backup.toml", "enable", "--encrypt"]);
        assert_eq!(cli.config, Some(PathBuf::from("backup.toml")));
        assert!(matches!(cli.command, Commands::Enable { encrypt: true }));

        let cli = Cli::parse_from(["wallet-backup", "change-password", "--remove"]);
        assert!(matches!(cli.command, Commands::ChangePassword { remove: true }));
    }
}
