/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Wallet backup CLI library
//!
//! Command definitions and handlers for the `wallet-backup` binary.

pub mod modules;

pub use modules::{Cli, Commands, backup::BackupContext};
