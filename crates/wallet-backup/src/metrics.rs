/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Metrics collection for backup and restore operations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};

/// Backup and restore metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupMetrics {
    pub backup_stats: BackupStats,
    pub restore_stats: RestoreStats,
}

/// Backup operation statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupStats {
    pub total_backups: u64,
    pub successful_backups: u64,
    pub failed_backups: u64,
    pub encrypted_backups: u64,
    pub average_backup_duration: f64,
    pub last_successful_backup: Option<DateTime<Utc>>,
    /// Failures by error category.
    pub failures: HashMap<String, u64>,
}

/// Restore operation statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreStats {
    pub total_restores: u64,
    pub successful_restores: u64,
    pub failed_restores: u64,
    pub total_files_restored: u64,
    pub average_restore_duration: f64,
    pub last_restore_time: Option<DateTime<Utc>>,
}

/// Result of a single backup run, as seen by the metrics.
#[derive(Debug, Clone)]
pub enum BackupRunResult {
    Completed {
        created_at: DateTime<Utc>,
        encrypted: bool,
    },
    Failed {
        category: &'static str,
    },
}

impl BackupMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a backup run
    pub fn record_backup(&mut self, result: &BackupRunResult, duration: Duration) {
        self.backup_stats.total_backups += 1;

        let label = match result {
            BackupRunResult::Completed {
                created_at,
                encrypted,
            } => {
                self.backup_stats.successful_backups += 1;
                if *encrypted {
                    self.backup_stats.encrypted_backups += 1;
                }
                self.backup_stats.last_successful_backup = Some(*created_at);
                "success"
            }
            BackupRunResult::Failed { category } => {
                self.backup_stats.failed_backups += 1;
                *self
                    .backup_stats
                    .failures
                    .entry(category.to_string())
                    .or_insert(0) += 1;
                "failure"
            }
        };

        // Update average duration
        let total_duration =
            self.backup_stats.average_backup_duration * (self.backup_stats.total_backups - 1) as f64;
        self.backup_stats.average_backup_duration =
            (total_duration + duration.as_secs_f64()) / self.backup_stats.total_backups as f64;

        ::metrics::counter!("wallet_backup_runs_total", "result" => label).increment(1);
        ::metrics::histogram!("wallet_backup_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a restore operation
    pub fn record_restore(&mut self, files_restored: Option<usize>, duration: Duration) {
        self.restore_stats.total_restores += 1;

        let label = match files_restored {
            Some(files) => {
                self.restore_stats.successful_restores += 1;
                self.restore_stats.total_files_restored += files as u64;
                self.restore_stats.last_restore_time = Some(Utc::now());
                "success"
            }
            None => {
                self.restore_stats.failed_restores += 1;
                "failure"
            }
        };

        let total_duration =
            self.restore_stats.average_restore_duration * (self.restore_stats.total_restores - 1) as f64;
        self.restore_stats.average_restore_duration =
            (total_duration + duration.as_secs_f64()) / self.restore_stats.total_restores as f64;

        ::metrics::counter!("wallet_backup_restores_total", "result" => label).increment(1);
    }
}
