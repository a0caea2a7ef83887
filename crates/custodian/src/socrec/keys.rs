use crate::{
    errors::StorageError,
    keys::{generate_auth_keypair, AuthKeypair},
    secure_store::SecureStore,
};
use tokio::sync::Mutex;

const IDENTITY_KEY_NAME: &str = "socrec-trusted-contact-identity-keypair";

/// The account's social recovery identity key: created on first use, then reused, including
/// across cloud backups.
#[derive(Debug)]
pub struct SocRecKeysRepository {
    store: SecureStore,
    create_lock: Mutex<()>,
}

impl SocRecKeysRepository {
    pub fn new(store: SecureStore) -> Self {
        Self {
            store,
            create_lock: Mutex::new(()),
        }
    }

    pub async fn get_or_create_identity_keypair(&self) -> Result<AuthKeypair, StorageError> {
        let _guard = self.create_lock.lock().await;
        if let Some(existing) = self.store.get_json(IDENTITY_KEY_NAME).await? {
            return Ok(existing);
        }
        let kp = generate_auth_keypair().map_err(|e| StorageError::Write {
            key: IDENTITY_KEY_NAME.to_owned(),
            reason: e.to_string(),
        })?;
        self.store.put_json(IDENTITY_KEY_NAME, &kp).await?;
        tracing::info!(identity_key = %kp.public_key, "created trusted contact identity key");
        Ok(kp)
    }

    pub async fn identity_keypair(&self) -> Result<Option<AuthKeypair>, StorageError> {
        self.store.get_json(IDENTITY_KEY_NAME).await
    }

    /// Put back a keypair recovered from a backup, replacing any local one.
    pub async fn restore_identity_keypair(&self, kp: &AuthKeypair) -> Result<(), StorageError> {
        let _guard = self.create_lock.lock().await;
        self.store.put_json(IDENTITY_KEY_NAME, kp).await
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.store.remove(IDENTITY_KEY_NAME).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_callers_share_one_key() -> eyre::Result<()> {
        let repo = Arc::new(SocRecKeysRepository::new(SecureStore::in_memory()));
        let (a, b) = tokio::join!(
            repo.get_or_create_identity_keypair(),
            repo.get_or_create_identity_keypair()
        );
        assert_eq!(a?, b?);
        Ok(())
    }

    #[tokio::test]
    async fn restored_key_wins() -> eyre::Result<()> {
        let repo = SocRecKeysRepository::new(SecureStore::in_memory());
        let original = repo.get_or_create_identity_keypair().await?;
        let restored = generate_auth_keypair()?;
        repo.restore_identity_keypair(&restored).await?;
        let now = repo.get_or_create_identity_keypair().await?;
        assert_eq!(now, restored);
        assert_ne!(now, original);
        Ok(())
    }
}
