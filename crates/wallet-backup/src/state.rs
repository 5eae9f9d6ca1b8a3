/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Observable backup state

use crate::error::BackupError;
use chrono::{DateTime, Utc};
use std::fmt;
use tokio::sync::watch;
use tracing::debug;

/// State of the backup subsystem as observed by the UI.
#[derive(Debug, Clone)]
pub enum BackupState {
    Disabled,
    CheckingStorage,
    Scheduled(DateTime<Utc>),
    InProgress,
    UpToDate,
    Failed(Option<BackupError>),
}

impl BackupState {
    /// States from which a run may enter `InProgress`.
    pub fn can_start_backup(&self) -> bool {
        matches!(
            self,
            BackupState::Disabled
                | BackupState::Scheduled(_)
                | BackupState::UpToDate
                | BackupState::Failed(_)
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, BackupState::Failed(_))
    }

    pub fn failure(&self) -> Option<&BackupError> {
        match self {
            BackupState::Failed(cause) => cause.as_ref(),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BackupState::Disabled => "disabled",
            BackupState::CheckingStorage => "checking_storage",
            BackupState::Scheduled(_) => "scheduled",
            BackupState::InProgress => "in_progress",
            BackupState::UpToDate => "up_to_date",
            BackupState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupState::Scheduled(due_at) => write!(f, "scheduled for {}", due_at.to_rfc3339()),
            BackupState::Failed(Some(cause)) => write!(f, "failed: {}", cause),
            other => f.write_str(other.name()),
        }
    }
}

/// Single observable cell holding the current [`BackupState`].
///
/// Subscribers always see the latest value; a slow subscriber may skip
/// intermediate states but never blocks transitions.
#[derive(Debug)]
pub struct BackupStateMachine {
    sender: watch::Sender<BackupState>,
}

impl BackupStateMachine {
    pub fn new(initial: BackupState) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    pub fn current(&self) -> BackupState {
        self.sender.borrow().clone()
    }

    /// Overwrite the state and notify subscribers.
    pub fn transition(&self, to: BackupState) {
        let from = self.sender.send_replace(to.clone());
        debug!("Backup state {} -> {}", from.name(), to);
    }

    pub fn subscribe(&self) -> watch::Receiver<BackupState> {
        self.sender.subscribe()
    }
}

impl Default for BackupStateMachine {
    fn default() -> Self {
        Self::new(BackupState::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_sources() {
        assert!(BackupState::Disabled.can_start_backup());
        assert!(BackupState::Scheduled(Utc::now()).can_start_backup());
        assert!(BackupState::UpToDate.can_start_backup());
        assert!(BackupState::Failed(None).can_start_backup());
        assert!(!BackupState::InProgress.can_start_backup());
        assert!(!BackupState::CheckingStorage.can_start_backup());
    }

    #[tokio::test]
    async fn test_subscribers_see_latest_value() {
        let machine = BackupStateMachine::default();
        let mut first = machine.subscribe();
        let second = machine.subscribe();

        machine.transition(BackupState::InProgress);
        machine.transition(BackupState::UpToDate);

        first.changed().await.unwrap();
        assert!(matches!(*first.borrow_and_update(), BackupState::UpToDate));
        assert!(matches!(*second.borrow(), BackupState::UpToDate));
        assert!(matches!(machine.current(), BackupState::UpToDate));
    }

    #[test]
    fn test_transition_without_subscribers() {
        let machine = BackupStateMachine::default();
        machine.transition(BackupState::Failed(Some(BackupError::StorageFull)));
        assert!(matches!(
            machine.current().failure(),
            Some(BackupError::StorageFull)
        ));
    }
}
