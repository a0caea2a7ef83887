use super::{
    error::RecoveryError,
    model::RecoveryConflictData,
    state::{reconcile, InvalidTransition, RecoveryState, RecoveryStatus},
    DelayNotifyRecovery,
};
use crate::{
    f8e::{CancelDelayNotifyRecoveryErrorCode, F8eError},
    hardware::HwFactorProofOfPossession,
    keybox::FullAccountId,
};

fn already_gone(e: &F8eError<CancelDelayNotifyRecoveryErrorCode>) -> bool {
    e.client_code() == Some(CancelDelayNotifyRecoveryErrorCode::NoRecoveryExists)
}

impl DelayNotifyRecovery {
    /// Cancel this device's recovery. Safe to repeat: if the server has nothing left to cancel
    /// but we still hold a shadow, the shadow is cleared and the cancel succeeds.
    pub async fn cancel(
        &self,
        account_id: &FullAccountId,
        hw_pop: Option<&HwFactorProofOfPossession>,
    ) -> Result<(), RecoveryError> {
        let _op = self.op_lock.lock().await;
        let local = self.dao.get().await?;
        if local.as_ref().is_some_and(|l| l.progress.server_completed()) {
            return Err(InvalidTransition {
                state: "completing",
                event: "canceled",
            }
            .into());
        }

        match self.recovery.cancel(account_id, hw_pop).await {
            Ok(()) => {}
            Err(e) if already_gone(&e) => {
                if local.is_none() {
                    return Err(RecoveryError::NotFound);
                }
                tracing::info!(account_id = %account_id, "server had no recovery left to cancel");
            }
            Err(e) => return Err(e.into()),
        }

        self.dao.clear().await?;
        tracing::info!(account_id = %account_id, "canceled delay-notify recovery");
        self.publish(RecoveryState::Canceled);
        Ok(())
    }

    /// Cancel a recovery this device did not start, after the user chose to. The server record
    /// is re-read first so a recovery that changed in the meantime is never canceled blindly.
    pub async fn cancel_conflicting_recovery(
        &self,
        account_id: &FullAccountId,
        hw_pop: Option<&HwFactorProofOfPossession>,
    ) -> Result<RecoveryConflictData, RecoveryError> {
        let _op = self.op_lock.lock().await;
        let local = self.dao.get().await?;
        let server = self.recovery.status(account_id).await?;
        let RecoveryStatus::SomeoneElseIsRecovering(data) =
            reconcile(local.as_ref(), server.as_ref())
        else {
            return Err(RecoveryError::NotFound);
        };

        match self.recovery.cancel(account_id, hw_pop).await {
            Ok(()) => {}
            Err(e) if already_gone(&e) => {}
            Err(e) => return Err(e.into()),
        }
        // Any shadow we held was for a recovery the server no longer tracks.
        self.dao.clear().await?;
        tracing::warn!(
            account_id = %account_id,
            lost_factor = %data.server_recovery.lost_factor,
            "canceled conflicting recovery"
        );
        self.publish(RecoveryState::Canceled);
        Ok(data)
    }
}
