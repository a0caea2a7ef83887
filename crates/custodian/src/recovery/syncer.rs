use super::{
    dao::RecoveryDao,
    error::RecoveryError,
    state::{reconcile, RecoveryStatus},
    DelayNotifyRecovery,
};
use crate::{errors::ErrorCode as _, f8e::RecoveryService, keybox::FullAccountId};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

/// Fetches the server's recovery record and reconciles it with the local shadow.
#[derive(Debug)]
pub struct RecoverySyncer {
    service: Arc<dyn RecoveryService>,
    dao: RecoveryDao,
    tx: watch::Sender<Option<RecoveryStatus>>,
    sync_lock: Mutex<()>,
}

impl RecoverySyncer {
    pub fn new(service: Arc<dyn RecoveryService>, dao: RecoveryDao) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            service,
            dao,
            tx,
            sync_lock: Mutex::new(()),
        }
    }

    /// `None` until the first successful sync.
    pub fn subscribe(&self) -> watch::Receiver<Option<RecoveryStatus>> {
        self.tx.subscribe()
    }

    pub async fn sync(&self, account_id: &FullAccountId) -> Result<RecoveryStatus, RecoveryError> {
        let _guard = self.sync_lock.lock().await;
        let local = self.dao.get().await?;
        let server = self.service.status(account_id).await?;
        let status = reconcile(local.as_ref(), server.as_ref());

        // Keep the shadow's copy of the server record current, e.g. a shortened test delay.
        if let RecoveryStatus::StillRecovering(refreshed) = &status {
            if local.as_ref() != Some(refreshed) {
                self.dao.set(refreshed).await?;
            }
        }
        tracing::debug!(
            account_id = %account_id,
            server_has_recovery = server.is_some(),
            status = status_name(&status),
            "synced recovery status"
        );
        self.tx.send_replace(Some(status.clone()));
        Ok(status)
    }
}

const fn status_name(status: &RecoveryStatus) -> &'static str {
    match status {
        RecoveryStatus::NoActiveRecovery => "no_active_recovery",
        RecoveryStatus::StillRecovering(_) => "still_recovering",
        RecoveryStatus::SomeoneElseIsRecovering(_) => "someone_else_is_recovering",
        RecoveryStatus::NoLongerRecovering(_) => "no_longer_recovering",
    }
}

/// Sync now, then every `interval`, until `cancel` fires. Failures are logged and retried on
/// the next tick.
pub fn launch_recovery_sync(
    recovery: Arc<DelayNotifyRecovery>,
    account_id: FullAccountId,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::debug!(account_id = %account_id, "recovery sync cancelled");
                    break;
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = recovery.sync(&account_id).await {
                tracing::warn!(
                    account_id = %account_id,
                    code = e.code(),
                    error = %e,
                    "recovery sync failed"
                );
            }
        }
    })
}
