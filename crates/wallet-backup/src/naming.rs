/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Backup archive naming
//!
//! Every artifact is named `<prefix><yyyy-MM-dd_HH-mm-ss>.<extension>` with the
//! timestamp in UTC. The extension reflects the last pipeline stage applied,
//! so the restore path can tell from the name alone whether a password is
//! needed. Other tools rely on this format, it must stay bit-exact.

use crate::error::{BackupError, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Naming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    pub prefix: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix: "Wallet-Backup-".to_string(),
        }
    }
}

/// Maps artifact timestamps to and from canonical file names.
#[derive(Debug, Clone)]
pub struct NamingPolicy {
    prefix: String,
    pattern: Regex,
}

impl NamingPolicy {
    pub fn new(config: &NamingConfig) -> Result<Self> {
        if config.prefix.is_empty() {
            return Err(BackupError::Config("Backup name prefix must not be empty".to_string()));
        }

        let pattern = Regex::new(&format!(
            r"^{}(\d{{4}}-(?:0[1-9]|1[0-2])-(?:0[1-9]|[12]\d|3[01])_(?:[01]\d|2[0-3])-[0-5]\d-[0-5]\d)\.([^./\\][^/\\]*)$",
            regex::escape(&config.prefix)
        ))
        .map_err(|e| BackupError::Config(format!("Invalid backup name prefix: {}", e)))?;

        Ok(Self {
            prefix: config.prefix.clone(),
            pattern,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Canonical file name for an artifact created at `created_at`.
    ///
    /// Sub-second precision is dropped.
    pub fn format(&self, created_at: DateTime<Utc>, extension: &str) -> String {
        format!(
            "{}{}.{}",
            self.prefix,
            created_at.format(TIMESTAMP_FORMAT),
            extension
        )
    }

    /// Extract the creation timestamp from an artifact name.
    pub fn parse(&self, name: &str) -> Option<DateTime<Utc>> {
        let captures = self.pattern.captures(name)?;
        let naive = NaiveDateTime::parse_from_str(captures.get(1)?.as_str(), TIMESTAMP_FORMAT).ok()?;
        Some(Utc.from_utc_datetime(&naive))
    }

    pub fn is_valid_name(&self, name: &str) -> bool {
        self.parse(name).is_some()
    }

    /// Extension of a valid artifact name.
    pub fn extension_of<'a>(&self, name: &'a str) -> Option<&'a str> {
        if !self.is_valid_name(name) {
            return None;
        }
        self.pattern
            .captures(name)
            .and_then(|captures| captures.get(2))
            .map(|m| m.as_str())
    }
}
