use super::{
    error::RecoveryError,
    model::{CompletionProgress, LocalRecovery},
    state::{InvalidTransition, RecoveryEvent, RecoveryState, RecoveryStatus},
    DelayNotifyRecovery,
};
use crate::{
    f8e::{completion_challenge, AuthTokenScope},
    hardware::HardwareFactor,
    keybox::{FullAccountId, Keybox, SpendingKeyset},
};

/// What a finished recovery hands to the sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryCompletion {
    pub keybox: Keybox,
    /// Older keysets may still hold funds.
    pub needs_sweep: bool,
}

impl DelayNotifyRecovery {
    /// Finish a recovery whose delay has elapsed: rotate auth keys, create and activate a new
    /// keyset, and make it the active keybox.
    ///
    /// Every step is recorded before the next starts, so calling this again after a failure
    /// resumes where it stopped.
    pub async fn complete(
        &self,
        account_id: &FullAccountId,
        hardware: &dyn HardwareFactor,
    ) -> Result<RecoveryCompletion, RecoveryError> {
        let _op = self.op_lock.lock().await;
        let local = match self.sync_locked(account_id).await? {
            RecoveryStatus::StillRecovering(local) => local,
            RecoveryStatus::SomeoneElseIsRecovering(data) => {
                return Err(RecoveryError::Conflict(data))
            }
            RecoveryStatus::NoLongerRecovering(_) => return Err(RecoveryError::NoLongerRecovering),
            RecoveryStatus::NoActiveRecovery => return Err(RecoveryError::NotFound),
        };
        if !local.progress.server_completed()
            && !local.server_recovery.delay_elapsed_at(self.clock.now())
        {
            return Err(RecoveryError::NotReady {
                delay_end_time: local.server_recovery.delay_end_time,
            });
        }
        // A shadow past the server step syncs straight to completing.
        let in_flight = if matches!(self.state(), RecoveryState::Completing(_)) {
            None
        } else {
            Some(self.enter(RecoveryEvent::CompletionStarted)?)
        };

        let outcome = self.run_completion(local, hardware).await;
        if let Some(guard) = in_flight {
            guard.finish();
        }
        match outcome {
            Ok(done) => {
                self.apply(RecoveryEvent::Completed {
                    keyset_id: done.keybox.active_spending_keyset.keyset_id().to_owned(),
                })?;
                Ok(done)
            }
            Err(e) => {
                tracing::warn!(account_id = %account_id, error = %e, "recovery completion failed");
                self.apply(RecoveryEvent::CompletionFailed)?;
                Err(e)
            }
        }
    }

    async fn run_completion(
        &self,
        mut local: LocalRecovery,
        hardware: &dyn HardwareFactor,
    ) -> Result<RecoveryCompletion, RecoveryError> {
        let account_id = local.account_id.clone();
        let app = local.destination_app_key_bundle.clone();
        let hw = local.destination_hw_key_bundle.clone();

        if !local.progress.server_completed() {
            let keys = local.destination_auth_keys();
            let challenge = completion_challenge(&keys);
            let app_signature = self
                .generator
                .dao()
                .require_auth_private_key(&keys.app)
                .await?
                .sign(challenge.as_bytes());
            let hw_signature = hardware.sign_challenge(challenge.as_bytes()).await?;
            self.recovery
                .complete(&account_id, &challenge, &app_signature, &hw_signature)
                .await?;
            self.advance(&mut local, CompletionProgress::RotatedAuthKeys).await?;
            tracing::info!(account_id = %account_id, "rotated auth keys");
        }

        self.tokens
            .register_key(&account_id, AuthTokenScope::Global, app.auth_key)
            .await;
        if let Some(recovery_key) = app.recovery_auth_key {
            self.tokens
                .register_key(&account_id, AuthTokenScope::Recovery, recovery_key)
                .await;
        }
        let token = self.tokens.access_token(&account_id, AuthTokenScope::Global).await?;
        let pop = hardware.proof_of_possession(&token).await?;

        if local.progress == CompletionProgress::RotatedAuthKeys {
            let f8e_keyset = self
                .keysets
                .create_keyset(
                    &account_id,
                    &app.spending_key,
                    &hw.spending_key,
                    local.config.network_type,
                    &pop,
                )
                .await?;
            let keyset = SpendingKeyset {
                local_id: uuid::Uuid::new_v4().to_string(),
                network_type: local.config.network_type,
                app_key: app.spending_key.clone(),
                hardware_key: hw.spending_key.clone(),
                f8e_spending_keyset: f8e_keyset,
            };
            self.advance(&mut local, CompletionProgress::CreatedKeyset { keyset })
                .await?;
        }

        if let CompletionProgress::CreatedKeyset { keyset } = &local.progress {
            let keyset = keyset.clone();
            self.keysets
                .set_active_keyset(&account_id, keyset.keyset_id(), &pop)
                .await?;
            tracing::info!(keyset_id = keyset.keyset_id(), "activated keyset on server");
            self.advance(&mut local, CompletionProgress::ActivatedKeyset { keyset })
                .await?;
        }

        let CompletionProgress::ActivatedKeyset { keyset } = local.progress.clone() else {
            return Err(InvalidTransition {
                state: "completing",
                event: "completed",
            }
            .into());
        };

        let ours = self
            .keyboxes
            .active()
            .is_some_and(|kb| kb.full_account_id == account_id);
        let keybox = if ours {
            self.keyboxes.promote_keyset(keyset, app, hw).await?
        } else {
            // Lost app on a fresh device: rebuild the keybox from the server's keysets.
            let inactive_keysets = self
                .keysets
                .list_keysets(&account_id)
                .await?
                .into_iter()
                .filter(|k| k.keyset_id() != keyset.keyset_id())
                .collect();
            let keybox = Keybox {
                local_id: uuid::Uuid::new_v4().to_string(),
                full_account_id: account_id.clone(),
                active_spending_keyset: keyset,
                active_app_key_bundle: app,
                active_hw_key_bundle: hw,
                inactive_keysets,
                config: local.config.clone(),
            };
            self.keyboxes.activate(keybox.clone()).await?;
            keybox
        };

        self.dao.clear().await?;
        tracing::info!(
            account_id = %account_id,
            keyset_id = keybox.active_spending_keyset.keyset_id(),
            inactive = keybox.inactive_keysets.len(),
            "recovery completed"
        );
        Ok(RecoveryCompletion {
            needs_sweep: !keybox.inactive_keysets.is_empty(),
            keybox,
        })
    }

    async fn advance(
        &self,
        local: &mut LocalRecovery,
        progress: CompletionProgress,
    ) -> Result<(), RecoveryError> {
        local.progress = progress;
        self.dao.set(local).await?;
        Ok(())
    }
}
