use super::{AppKeyBundle, HwKeyBundle, Keybox, SpendingKeyset};
use crate::{errors::StorageError, secure_store::SecureStore};
use tokio::sync::{watch, Mutex};

const ACTIVE_KEYBOX_KEY: &str = "active-keybox";

/// Single source of truth for the active keybox.
///
/// Every change is persisted before it is published, so subscribers never see a keybox that
/// would be lost on restart.
#[derive(Debug)]
pub struct ActiveKeyboxRepository {
    store: SecureStore,
    tx: watch::Sender<Option<Keybox>>,
    write_lock: Mutex<()>,
}

impl ActiveKeyboxRepository {
    /// Rehydrate from storage.
    pub async fn load(store: SecureStore) -> Result<Self, StorageError> {
        let current: Option<Keybox> = store.get_json(ACTIVE_KEYBOX_KEY).await?;
        let (tx, _rx) = watch::channel(current);
        Ok(Self {
            store,
            tx,
            write_lock: Mutex::new(()),
        })
    }

    pub fn active(&self) -> Option<Keybox> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Keybox>> {
        self.tx.subscribe()
    }

    /// Set on account creation or restore. Replaces any previous keybox.
    pub async fn activate(&self, keybox: Keybox) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        self.store.put_json(ACTIVE_KEYBOX_KEY, &keybox).await?;
        tracing::info!(
            account_id = %keybox.full_account_id,
            keyset_id = keybox.active_spending_keyset.keyset_id(),
            "activated keybox"
        );
        self.tx.send_replace(Some(keybox));
        Ok(())
    }

    /// Rotate the active keyset during recovery completion.
    pub async fn promote_keyset(
        &self,
        keyset: SpendingKeyset,
        app_key_bundle: AppKeyBundle,
        hw_key_bundle: HwKeyBundle,
    ) -> Result<Keybox, StorageError> {
        let _guard = self.write_lock.lock().await;
        let current = self.tx.borrow().clone().ok_or_else(|| StorageError::Read {
            key: ACTIVE_KEYBOX_KEY.to_owned(),
            reason: "no active keybox to promote a keyset into".to_owned(),
        })?;
        let next = current.promote_keyset(keyset, app_key_bundle, hw_key_bundle);
        self.store.put_json(ACTIVE_KEYBOX_KEY, &next).await?;
        tracing::info!(
            keyset_id = next.active_spending_keyset.keyset_id(),
            inactive = next.inactive_keysets.len(),
            "promoted keyset"
        );
        self.tx.send_replace(Some(next.clone()));
        Ok(next)
    }

    pub async fn teardown(&self) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        self.store.remove(ACTIVE_KEYBOX_KEY).await?;
        self.tx.send_replace(None);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        keybox::test_support::{sample_keybox, sample_keyset},
        keys::BitcoinNetworkType,
    };

    #[tokio::test]
    async fn survives_reload_and_publishes_changes() -> eyre::Result<()> {
        let store = SecureStore::in_memory();
        let repo = ActiveKeyboxRepository::load(store.clone()).await?;
        assert!(repo.active().is_none());
        let mut rx = repo.subscribe();

        let kb = sample_keybox(BitcoinNetworkType::Regtest)?;
        repo.activate(kb.clone()).await?;
        rx.changed().await?;
        assert_eq!(rx.borrow_and_update().as_ref(), Some(&kb));

        let reloaded = ActiveKeyboxRepository::load(store.clone()).await?;
        assert_eq!(reloaded.active(), Some(kb));

        reloaded.teardown().await?;
        assert!(ActiveKeyboxRepository::load(store).await?.active().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn promote_requires_an_active_keybox() -> eyre::Result<()> {
        let repo = ActiveKeyboxRepository::load(SecureStore::in_memory()).await?;
        let kb = sample_keybox(BitcoinNetworkType::Regtest)?;
        let res = repo
            .promote_keyset(
                sample_keyset(BitcoinNetworkType::Regtest, "k2")?,
                kb.active_app_key_bundle.clone(),
                kb.active_hw_key_bundle.clone(),
            )
            .await;
        assert!(matches!(res, Err(StorageError::Read { .. })));
        Ok(())
    }
}
