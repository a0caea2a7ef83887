use super::{model::RecoveryConflictData, state::InvalidTransition};
use crate::{
    errors::{ErrorCode, StorageError},
    f8e::{
        CancelDelayNotifyRecoveryErrorCode, CompleteDelayNotifyErrorCode, F8eError,
        InitiateAccountDelayNotifyErrorCode, NoClientErrorCode,
    },
    hardware::HardwareError,
    keys::KeyBundleError,
};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("no recovery to act on")]
    NotFound,

    /// Someone else's recovery is pending. Resolve with `cancel_conflicting_recovery`.
    #[error("another {} recovery is in progress", .0.server_recovery.lost_factor)]
    Conflict(RecoveryConflictData),

    #[error("recovery delay ends at {delay_end_time}")]
    NotReady { delay_end_time: DateTime<Utc> },

    #[error("recovery was canceled on the server")]
    NoLongerRecovering,

    #[error("a lost-{0} recovery is already in progress on this device")]
    AlreadyRecovering(crate::f8e::PhysicalFactor),

    #[error("an active keybox is required for this recovery")]
    MissingKeybox,

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Initiate(#[from] F8eError<InitiateAccountDelayNotifyErrorCode>),

    #[error(transparent)]
    Cancel(#[from] F8eError<CancelDelayNotifyRecoveryErrorCode>),

    #[error(transparent)]
    Complete(#[from] F8eError<CompleteDelayNotifyErrorCode>),

    #[error(transparent)]
    Server(#[from] F8eError<NoClientErrorCode>),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    KeyBundle(#[from] KeyBundleError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ErrorCode for RecoveryError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "recovery_not_found",
            Self::Conflict(_) => "recovery_conflict",
            Self::NotReady { .. } => "recovery_delay_not_elapsed",
            Self::NoLongerRecovering => "recovery_canceled_elsewhere",
            Self::AlreadyRecovering(_) => "recovery_already_in_progress",
            Self::MissingKeybox => "keybox_missing",
            Self::InvalidTransition(_) => "recovery_invalid_transition",
            Self::Initiate(e) => e.code(),
            Self::Cancel(e) => e.code(),
            Self::Complete(e) => e.code(),
            Self::Server(e) => e.code(),
            Self::Hardware(e) => e.code(),
            Self::KeyBundle(e) => e.code(),
            Self::Storage(e) => e.code(),
        }
    }
}
