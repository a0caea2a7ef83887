use super::{
    dao::RecoveryDao,
    error::RecoveryError,
    state::{InvalidTransition, RecoveryEvent, RecoveryState, RecoveryStatus},
    syncer::RecoverySyncer,
};
use crate::{
    clock::Clock,
    f8e::{AuthTokenProvider, KeysetService, RecoveryService},
    keybox::{ActiveKeyboxRepository, FullAccountId},
    keys::AppKeysGenerator,
};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// Collaborators for [`DelayNotifyRecovery`].
#[derive(Debug, Clone)]
pub struct RecoveryDeps {
    pub recovery: Arc<dyn RecoveryService>,
    pub keysets: Arc<dyn KeysetService>,
    pub tokens: Arc<dyn AuthTokenProvider>,
    pub generator: AppKeysGenerator,
    pub keyboxes: Arc<ActiveKeyboxRepository>,
    pub dao: RecoveryDao,
    pub clock: Arc<dyn Clock>,
}

/// Drives lost-app and lost-hardware recoveries for one device.
///
/// Operations are serialized: at most one initiate, cancel, complete or sync runs at a time,
/// and each re-reads the server before changing anything that moves funds or keys.
#[derive(Debug)]
pub struct DelayNotifyRecovery {
    pub(super) recovery: Arc<dyn RecoveryService>,
    pub(super) keysets: Arc<dyn KeysetService>,
    pub(super) tokens: Arc<dyn AuthTokenProvider>,
    pub(super) generator: AppKeysGenerator,
    pub(super) keyboxes: Arc<ActiveKeyboxRepository>,
    pub(super) dao: RecoveryDao,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) syncer: RecoverySyncer,
    pub(super) op_lock: Mutex<()>,
    state: watch::Sender<RecoveryState>,
}

impl DelayNotifyRecovery {
    pub fn new(deps: RecoveryDeps) -> Self {
        let (state, _rx) = watch::channel(RecoveryState::NoActiveRecovery);
        Self {
            syncer: RecoverySyncer::new(Arc::clone(&deps.recovery), deps.dao.clone()),
            recovery: deps.recovery,
            keysets: deps.keysets,
            tokens: deps.tokens,
            generator: deps.generator,
            keyboxes: deps.keyboxes,
            dao: deps.dao,
            clock: deps.clock,
            op_lock: Mutex::new(()),
            state,
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecoveryState> {
        self.state.subscribe()
    }

    /// Latest reconciled status, `None` before the first sync.
    pub fn subscribe_status(&self) -> watch::Receiver<Option<RecoveryStatus>> {
        self.syncer.subscribe()
    }

    /// Re-read the server, refresh the local shadow and move the state machine to match.
    pub async fn sync(&self, account_id: &FullAccountId) -> Result<RecoveryStatus, RecoveryError> {
        let _op = self.op_lock.lock().await;
        self.sync_locked(account_id).await
    }

    /// Callers hold `op_lock`.
    pub(super) async fn sync_locked(
        &self,
        account_id: &FullAccountId,
    ) -> Result<RecoveryStatus, RecoveryError> {
        let status = self.syncer.sync(account_id).await?;
        self.apply(RecoveryEvent::Synced(status.clone()))?;
        Ok(status)
    }

    /// Callers hold `op_lock`, so the read-then-replace below cannot interleave.
    pub(super) fn apply(&self, event: RecoveryEvent) -> Result<RecoveryState, InvalidTransition> {
        let current = self.state();
        let from = current.name();
        let next = current.on(event, self.clock.now())?;
        if from != next.name() {
            tracing::info!(from, to = next.name(), "recovery state changed");
        }
        self.state.send_replace(next.clone());
        Ok(next)
    }

    /// Apply the event that starts an operation. Dropping the returned guard before
    /// [`InFlight::finish`] puts the previous state back.
    pub(super) fn enter(&self, event: RecoveryEvent) -> Result<InFlight<'_>, InvalidTransition> {
        let restore = self.state();
        self.apply(event)?;
        Ok(InFlight {
            state: &self.state,
            restore: Some(restore),
        })
    }

    /// For outcomes the server already made final, whatever the local state was.
    pub(super) fn publish(&self, next: RecoveryState) {
        let from = self.state.borrow().name();
        tracing::info!(from, to = next.name(), "recovery state changed");
        self.state.send_replace(next);
    }
}

/// An operation that has published its in-flight state and not yet its outcome.
///
/// Callers can abandon any operation by dropping its future; this keeps the state machine
/// from being left in `initiating` or `completing` with nobody to finish it.
#[must_use]
#[derive(Debug)]
pub(super) struct InFlight<'a> {
    state: &'a watch::Sender<RecoveryState>,
    restore: Option<RecoveryState>,
}

impl InFlight<'_> {
    /// The operation reached an outcome and will apply it itself.
    pub(super) fn finish(mut self) {
        self.restore = None;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(previous) = self.restore.take() {
            let from = self.state.borrow().name();
            tracing::warn!(from, to = previous.name(), "recovery operation abandoned");
            self.state.send_replace(previous);
        }
    }
}
