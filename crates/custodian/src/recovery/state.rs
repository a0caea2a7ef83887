//! Pure recovery state transitions. Nothing here touches the network or storage.

use super::model::{LocalRecovery, RecoveryConflictData};
use crate::f8e::{PhysicalFactor, ServerRecovery};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Local shadow reconciled against the server record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryStatus {
    NoActiveRecovery,
    /// Ours, still pending on the server or already completed there.
    StillRecovering(LocalRecovery),
    SomeoneElseIsRecovering(RecoveryConflictData),
    /// We had one, the server no longer does: canceled from elsewhere.
    NoLongerRecovering(LocalRecovery),
}

pub fn reconcile(local: Option<&LocalRecovery>, server: Option<&ServerRecovery>) -> RecoveryStatus {
    match (local, server) {
        (None, None) => RecoveryStatus::NoActiveRecovery,
        (Some(l), _) if l.progress.server_completed() => RecoveryStatus::StillRecovering(l.clone()),
        (Some(l), Some(s)) if l.matches(s) => RecoveryStatus::StillRecovering(LocalRecovery {
            server_recovery: s.clone(),
            ..l.clone()
        }),
        (Some(l), None) => RecoveryStatus::NoLongerRecovering(l.clone()),
        (l, Some(s)) => RecoveryStatus::SomeoneElseIsRecovering(RecoveryConflictData {
            server_recovery: s.clone(),
            local_lost_factor: l.map(|l| l.lost_factor),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryState {
    NoActiveRecovery,
    Initiating { lost_factor: PhysicalFactor },
    DelayInProgress(LocalRecovery),
    ReadyToComplete(LocalRecovery),
    Completing(LocalRecovery),
    Completed { keyset_id: String },
    Canceled,
    ConflictDetected(RecoveryConflictData),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryEvent {
    InitiateRequested(PhysicalFactor),
    Initiated(LocalRecovery),
    InitiateFailed,
    ConflictFound(RecoveryConflictData),
    Synced(RecoveryStatus),
    CompletionStarted,
    CompletionFailed,
    Completed { keyset_id: String },
    Canceled,
}

impl RecoveryEvent {
    const fn name(&self) -> &'static str {
        match self {
            Self::InitiateRequested(_) => "initiate_requested",
            Self::Initiated(_) => "initiated",
            Self::InitiateFailed => "initiate_failed",
            Self::ConflictFound(_) => "conflict_found",
            Self::Synced(_) => "synced",
            Self::CompletionStarted => "completion_started",
            Self::CompletionFailed => "completion_failed",
            Self::Completed { .. } => "completed",
            Self::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("recovery event `{event}` is not valid in state `{state}`")]
pub struct InvalidTransition {
    pub state: &'static str,
    pub event: &'static str,
}

fn waiting(local: LocalRecovery, now: DateTime<Utc>) -> RecoveryState {
    if local.progress.server_completed() {
        RecoveryState::Completing(local)
    } else if local.server_recovery.delay_elapsed_at(now) {
        RecoveryState::ReadyToComplete(local)
    } else {
        RecoveryState::DelayInProgress(local)
    }
}

/// The state a freshly reconciled status puts us in, e.g. after a restart.
pub fn state_for(status: RecoveryStatus, now: DateTime<Utc>) -> RecoveryState {
    match status {
        RecoveryStatus::NoActiveRecovery => RecoveryState::NoActiveRecovery,
        RecoveryStatus::StillRecovering(local) => waiting(local, now),
        RecoveryStatus::SomeoneElseIsRecovering(data) => RecoveryState::ConflictDetected(data),
        RecoveryStatus::NoLongerRecovering(_) => RecoveryState::Canceled,
    }
}

impl RecoveryState {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NoActiveRecovery => "no_active_recovery",
            Self::Initiating { .. } => "initiating",
            Self::DelayInProgress(_) => "delay_in_progress",
            Self::ReadyToComplete(_) => "ready_to_complete",
            Self::Completing(_) => "completing",
            Self::Completed { .. } => "completed",
            Self::Canceled => "canceled",
            Self::ConflictDetected(_) => "conflict_detected",
        }
    }

    pub fn on(self, event: RecoveryEvent, now: DateTime<Utc>) -> Result<Self, InvalidTransition> {
        use RecoveryEvent as E;
        use RecoveryState as S;

        let invalid = InvalidTransition {
            state: self.name(),
            event: event.name(),
        };
        match (self, event) {
            // The server re-reports a conflict that still stands.
            (
                S::NoActiveRecovery | S::Canceled | S::Completed { .. } | S::ConflictDetected(_),
                E::InitiateRequested(f),
            ) => Ok(S::Initiating { lost_factor: f }),
            (S::Initiating { .. }, E::Initiated(local)) => Ok(waiting(local, now)),
            (S::Initiating { .. }, E::InitiateFailed) => Ok(S::NoActiveRecovery),

            (S::Completed { .. } | S::Canceled, E::ConflictFound(_)) => Err(invalid),
            (_, E::ConflictFound(data)) => Ok(S::ConflictDetected(data)),

            // Syncs run under the operation lock, so nothing is in flight when one lands.
            (_, E::Synced(status)) => Ok(state_for(status, now)),

            (S::ReadyToComplete(local), E::CompletionStarted) => Ok(S::Completing(local)),
            (S::DelayInProgress(local), E::CompletionStarted)
                if local.server_recovery.delay_elapsed_at(now) =>
            {
                Ok(S::Completing(local))
            }
            (S::Completing(local), E::CompletionFailed) => Ok(waiting(local, now)),
            (S::Completing(_), E::Completed { keyset_id }) => Ok(S::Completed { keyset_id }),

            (
                S::NoActiveRecovery
                | S::DelayInProgress(_)
                | S::ReadyToComplete(_)
                | S::ConflictDetected(_),
                E::Canceled,
            ) => Ok(S::Canceled),

            _ => Err(invalid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        f8e::DelayNotifyAuthKeys,
        keybox::{test_support::sample_keybox, FullAccountId},
        keys::{generate_auth_keypair, BitcoinNetworkType},
        recovery::model::CompletionProgress,
    };
    use chrono::TimeDelta;

    fn local(now: DateTime<Utc>) -> eyre::Result<LocalRecovery> {
        let kb = sample_keybox(BitcoinNetworkType::Regtest)?;
        let app = kb.active_app_key_bundle;
        let hw = kb.active_hw_key_bundle;
        Ok(LocalRecovery {
            account_id: FullAccountId("account-1".to_owned()),
            lost_factor: PhysicalFactor::App,
            server_recovery: ServerRecovery {
                lost_factor: PhysicalFactor::App,
                delay_start_time: now,
                delay_end_time: now + TimeDelta::days(7),
                auth_keys: DelayNotifyAuthKeys {
                    app: app.auth_key,
                    hardware: hw.auth_key,
                    recovery: app.recovery_auth_key,
                },
            },
            destination_app_key_bundle: app,
            destination_hw_key_bundle: hw,
            config: kb.config,
            progress: CompletionProgress::AwaitingDelay,
        })
    }

    #[test]
    fn reconcile_distinguishes_ours_theirs_and_gone() -> eyre::Result<()> {
        let now = Utc::now();
        let ours = local(now)?;
        let server = ours.server_recovery.clone();
        assert_eq!(reconcile(None, None), RecoveryStatus::NoActiveRecovery);
        assert!(matches!(
            reconcile(Some(&ours), Some(&server)),
            RecoveryStatus::StillRecovering(_)
        ));
        assert!(matches!(
            reconcile(Some(&ours), None),
            RecoveryStatus::NoLongerRecovering(_)
        ));

        let theirs = ServerRecovery {
            lost_factor: PhysicalFactor::Hardware,
            auth_keys: DelayNotifyAuthKeys {
                hardware: generate_auth_keypair()?.public_key,
                ..server.auth_keys
            },
            ..server
        };
        assert_eq!(
            reconcile(Some(&ours), Some(&theirs)),
            RecoveryStatus::SomeoneElseIsRecovering(RecoveryConflictData {
                server_recovery: theirs.clone(),
                local_lost_factor: Some(PhysicalFactor::App),
            })
        );
        assert!(matches!(
            reconcile(None, Some(&theirs)),
            RecoveryStatus::SomeoneElseIsRecovering(RecoveryConflictData {
                local_lost_factor: None,
                ..
            })
        ));

        // Once the server accepted completion its record is gone, and that is expected.
        let completing = LocalRecovery {
            progress: CompletionProgress::RotatedAuthKeys,
            ..ours
        };
        assert!(matches!(
            reconcile(Some(&completing), None),
            RecoveryStatus::StillRecovering(_)
        ));
        Ok(())
    }

    #[test]
    fn happy_path_walks_every_state() -> eyre::Result<()> {
        let start = Utc::now();
        let l = local(start)?;
        let s = RecoveryState::NoActiveRecovery
            .on(RecoveryEvent::InitiateRequested(PhysicalFactor::App), start)?;
        let s = s.on(RecoveryEvent::Initiated(l.clone()), start)?;
        assert_eq!(s.name(), "delay_in_progress");

        // Completion before the delay elapses is refused.
        assert!(s.clone().on(RecoveryEvent::CompletionStarted, start).is_err());

        let later = start + TimeDelta::days(7);
        let s = s.on(RecoveryEvent::Synced(RecoveryStatus::StillRecovering(l)), later)?;
        assert_eq!(s.name(), "ready_to_complete");
        let s = s.on(RecoveryEvent::CompletionStarted, later)?;
        let s = s.on(
            RecoveryEvent::Completed {
                keyset_id: "keyset-2".to_owned(),
            },
            later,
        )?;
        assert_eq!(
            s,
            RecoveryState::Completed {
                keyset_id: "keyset-2".to_owned()
            }
        );
        Ok(())
    }

    #[test]
    fn conflicts_and_cancellation() -> eyre::Result<()> {
        let now = Utc::now();
        let l = local(now)?;
        let data = RecoveryConflictData {
            server_recovery: l.server_recovery.clone(),
            local_lost_factor: None,
        };
        let s = RecoveryState::DelayInProgress(l.clone())
            .on(RecoveryEvent::ConflictFound(data.clone()), now)?;
        assert_eq!(s, RecoveryState::ConflictDetected(data));

        let s = s.on(RecoveryEvent::Canceled, now)?;
        assert_eq!(s, RecoveryState::Canceled);
        assert!(s.clone().on(RecoveryEvent::CompletionStarted, now).is_err());

        let failed = RecoveryState::Completing(l).on(RecoveryEvent::CompletionFailed, now)?;
        assert_eq!(failed.name(), "delay_in_progress");
        Ok(())
    }

    #[test]
    fn a_new_initiation_may_follow_a_conflict() -> eyre::Result<()> {
        let now = Utc::now();
        let l = local(now)?;
        let s = RecoveryState::ConflictDetected(RecoveryConflictData {
            server_recovery: l.server_recovery,
            local_lost_factor: None,
        });
        let s = s.on(RecoveryEvent::InitiateRequested(PhysicalFactor::App), now)?;
        assert_eq!(
            s,
            RecoveryState::Initiating {
                lost_factor: PhysicalFactor::App
            }
        );
        Ok(())
    }

    #[test]
    fn sync_replaces_leftover_in_flight_states() -> eyre::Result<()> {
        let now = Utc::now();
        let l = local(now)?;
        let stale = RecoveryState::Initiating {
            lost_factor: PhysicalFactor::App,
        };
        assert_eq!(
            stale.on(RecoveryEvent::Synced(RecoveryStatus::NoActiveRecovery), now)?,
            RecoveryState::NoActiveRecovery
        );

        let later = now + TimeDelta::days(7);
        let s = RecoveryState::Completing(l.clone())
            .on(RecoveryEvent::Synced(RecoveryStatus::StillRecovering(l.clone())), later)?;
        assert_eq!(s.name(), "ready_to_complete");

        // A shadow past the server step stays completing.
        let rotated = LocalRecovery {
            progress: CompletionProgress::RotatedAuthKeys,
            ..l
        };
        let s = RecoveryState::NoActiveRecovery
            .on(RecoveryEvent::Synced(RecoveryStatus::StillRecovering(rotated)), later)?;
        assert_eq!(s.name(), "completing");
        Ok(())
    }
}
