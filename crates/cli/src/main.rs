/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;
use wallet_backup::WalletBackupConfig;
use wallet_backup_cli::{BackupContext, Cli};

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    if let Err(err) = run(args).await {
        error!("{:#}", err);
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

async fn run(args: Cli) -> anyhow::Result<()> {
    let config = WalletBackupConfig::load(args.config.as_deref())?;
    debug!("Using wallet data directory {}", config.paths.data_dir.display());

    let ctx = BackupContext::build(config)?;
    args.command.exec(ctx).await
}
