use super::{DescriptorSpendingWallet, SpendingWallet, WalletError};
use crate::{
    chain::ChainDataProvider, clock::Clock, keybox::SpendingKeyset, keys::AppPrivateKeyDao,
    secure_store::SecureStore,
};
use async_trait::async_trait;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

/// Hands out one wallet per keyset.
#[async_trait]
pub trait SpendingWalletProvider: Send + Sync + std::fmt::Debug {
    async fn wallet_for(
        &self,
        keyset: &SpendingKeyset,
    ) -> Result<Arc<dyn SpendingWallet>, WalletError>;
}

/// Builds [`DescriptorSpendingWallet`]s, signing with the app key when the app holds it.
#[derive(Debug)]
pub struct DescriptorWalletProvider {
    chain: Arc<dyn ChainDataProvider>,
    dao: AppPrivateKeyDao,
    store: SecureStore,
    clock: Arc<dyn Clock>,
    gap_limit: u32,
    wallets: Mutex<HashMap<String, Arc<DescriptorSpendingWallet>>>,
}

impl DescriptorWalletProvider {
    pub fn new(
        chain: Arc<dyn ChainDataProvider>,
        dao: AppPrivateKeyDao,
        store: SecureStore,
        clock: Arc<dyn Clock>,
        gap_limit: u32,
    ) -> Self {
        Self {
            chain,
            dao,
            store,
            clock,
            gap_limit,
            wallets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn descriptor_wallet(
        &self,
        keyset: &SpendingKeyset,
    ) -> Result<Arc<DescriptorSpendingWallet>, WalletError> {
        let mut wallets = self.wallets.lock().await;
        if let Some(w) = wallets.get(keyset.keyset_id()) {
            return Ok(Arc::clone(w));
        }
        let signer = self.dao.spending_private_key(&keyset.app_key).await?;
        let wallet = Arc::new(
            DescriptorSpendingWallet::load(
                keyset.clone(),
                signer,
                Arc::clone(&self.chain),
                self.store.clone(),
                Arc::clone(&self.clock),
                self.gap_limit,
            )
            .await?,
        );
        tracing::debug!(
            keyset_id = keyset.keyset_id(),
            can_sign = wallet.can_sign(),
            "opened spending wallet"
        );
        wallets.insert(keyset.keyset_id().to_owned(), Arc::clone(&wallet));
        Ok(wallet)
    }
}

#[async_trait]
impl SpendingWalletProvider for DescriptorWalletProvider {
    async fn wallet_for(
        &self,
        keyset: &SpendingKeyset,
    ) -> Result<Arc<dyn SpendingWallet>, WalletError> {
        Ok(self.descriptor_wallet(keyset).await? as Arc<dyn SpendingWallet>)
    }
}
