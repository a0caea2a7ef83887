use super::model::LocalRecovery;
use crate::{errors::StorageError, secure_store::SecureStore};

const LOCAL_RECOVERY_KEY: &str = "delay-notify-recovery";

/// Persists the local recovery shadow across restarts.
#[derive(Debug, Clone)]
pub struct RecoveryDao {
    store: SecureStore,
}

impl RecoveryDao {
    pub const fn new(store: SecureStore) -> Self {
        Self { store }
    }

    pub async fn get(&self) -> Result<Option<LocalRecovery>, StorageError> {
        self.store.get_json(LOCAL_RECOVERY_KEY).await
    }

    pub async fn set(&self, recovery: &LocalRecovery) -> Result<(), StorageError> {
        self.store.put_json(LOCAL_RECOVERY_KEY, recovery).await
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.store.remove(LOCAL_RECOVERY_KEY).await
    }
}
