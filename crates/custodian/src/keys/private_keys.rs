use super::{AuthKeypair, AuthPrivateKey, AuthPublicKey, DescriptorPublicKey, ExtendedPrivateKey, SpendingKeypair};
use crate::{errors::StorageError, secure_store::SecureStore};

/// App-held private keys, indexed by their public halves.
#[derive(Debug, Clone)]
pub struct AppPrivateKeyDao {
    store: SecureStore,
}

fn spending_key_name(public: &DescriptorPublicKey) -> String {
    format!("app-spending-private-key:{public}")
}

fn auth_key_name(public: &AuthPublicKey) -> String {
    format!("app-auth-private-key:{public}")
}

impl AppPrivateKeyDao {
    pub const fn new(store: SecureStore) -> Self {
        Self { store }
    }

    pub async fn store_spending_keypair(&self, kp: &SpendingKeypair) -> Result<(), StorageError> {
        self.store
            .put_json(&spending_key_name(&kp.public_key), &kp.private_key)
            .await
    }

    pub async fn spending_private_key(
        &self,
        public: &DescriptorPublicKey,
    ) -> Result<Option<ExtendedPrivateKey>, StorageError> {
        self.store.get_json(&spending_key_name(public)).await
    }

    /// Like [`Self::spending_private_key`], but absence is an error.
    pub async fn require_spending_private_key(
        &self,
        public: &DescriptorPublicKey,
    ) -> Result<ExtendedPrivateKey, StorageError> {
        let name = spending_key_name(public);
        self.store
            .get_json(&name)
            .await?
            .ok_or(StorageError::Read {
                key: name,
                reason: "no private key stored for this spending key".to_owned(),
            })
    }

    pub async fn store_auth_keypair(&self, kp: &AuthKeypair) -> Result<(), StorageError> {
        self.store
            .put_json(&auth_key_name(&kp.public_key), &kp.private_key)
            .await
    }

    pub async fn auth_private_key(
        &self,
        public: &AuthPublicKey,
    ) -> Result<Option<AuthPrivateKey>, StorageError> {
        self.store.get_json(&auth_key_name(public)).await
    }

    pub async fn require_auth_private_key(
        &self,
        public: &AuthPublicKey,
    ) -> Result<AuthPrivateKey, StorageError> {
        let name = auth_key_name(public);
        self.store
            .get_json(&name)
            .await?
            .ok_or(StorageError::Read {
                key: name,
                reason: "no private key stored for this auth key".to_owned(),
            })
    }

    pub async fn remove_spending_private_key(
        &self,
        public: &DescriptorPublicKey,
    ) -> Result<(), StorageError> {
        self.store.remove(&spending_key_name(public)).await
    }

    pub async fn remove_auth_private_key(&self, public: &AuthPublicKey) -> Result<(), StorageError> {
        self.store.remove(&auth_key_name(public)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{generate_auth_keypair, generator::generate_spending_keypair, BitcoinNetworkType};

    #[tokio::test]
    async fn missing_keys_are_reported_as_read_errors_when_required() -> eyre::Result<()> {
        let dao = AppPrivateKeyDao::new(SecureStore::in_memory());
        let kp = generate_auth_keypair()?;
        assert!(dao.auth_private_key(&kp.public_key).await?.is_none());
        assert!(matches!(
            dao.require_auth_private_key(&kp.public_key).await,
            Err(StorageError::Read { .. })
        ));

        dao.store_auth_keypair(&kp).await?;
        assert_eq!(dao.require_auth_private_key(&kp.public_key).await?, kp.private_key);
        dao.remove_auth_private_key(&kp.public_key).await?;
        assert!(dao.auth_private_key(&kp.public_key).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn spending_keys_roundtrip() -> eyre::Result<()> {
        let dao = AppPrivateKeyDao::new(SecureStore::in_memory());
        let kp = generate_spending_keypair(BitcoinNetworkType::Regtest)?;
        dao.store_spending_keypair(&kp).await?;
        assert_eq!(
            dao.require_spending_private_key(&kp.public_key).await?,
            kp.private_key
        );
        Ok(())
    }
}
