use crate::{
    f8e::{DelayNotifyAuthKeys, PhysicalFactor, ServerRecovery},
    keybox::{AppKeyBundle, FullAccountId, HwKeyBundle, KeyboxConfig, SpendingKeyset},
};
use serde::{Deserialize, Serialize};

/// How far completion got. Persisted after every step so an interrupted completion resumes
/// instead of repeating server calls that can only succeed once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum CompletionProgress {
    AwaitingDelay,
    RotatedAuthKeys,
    CreatedKeyset { keyset: SpendingKeyset },
    ActivatedKeyset { keyset: SpendingKeyset },
}

impl CompletionProgress {
    /// The server has accepted completion; its delay-notify record is gone for good.
    pub const fn server_completed(&self) -> bool {
        !matches!(self, Self::AwaitingDelay)
    }
}

/// This app's shadow of a recovery it initiated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRecovery {
    pub account_id: FullAccountId,
    pub lost_factor: PhysicalFactor,
    pub destination_app_key_bundle: AppKeyBundle,
    pub destination_hw_key_bundle: HwKeyBundle,
    /// Last server record seen. Refreshed on every sync.
    pub server_recovery: ServerRecovery,
    pub config: KeyboxConfig,
    pub progress: CompletionProgress,
}

impl LocalRecovery {
    pub const fn destination_auth_keys(&self) -> DelayNotifyAuthKeys {
        DelayNotifyAuthKeys {
            app: self.destination_app_key_bundle.auth_key,
            hardware: self.destination_hw_key_bundle.auth_key,
            recovery: self.destination_app_key_bundle.recovery_auth_key,
        }
    }

    /// Whether `server` describes the recovery this app started.
    pub fn matches(&self, server: &ServerRecovery) -> bool {
        server.lost_factor == self.lost_factor && server.auth_keys == self.destination_auth_keys()
    }
}

/// A recovery the server knows about that this app did not start. Needs an explicit decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConflictData {
    pub server_recovery: ServerRecovery,
    /// What this app was recovering, if anything.
    pub local_lost_factor: Option<PhysicalFactor>,
}
