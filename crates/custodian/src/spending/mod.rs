//! Per-keyset spending wallets: sync, balance, addresses, PSBT construction and signing.

pub mod descriptor;
pub mod fake;
pub mod provider;
pub mod psbt;
pub mod transactions;
pub mod wallet;

pub use fake::SpendingWalletFake;
pub use provider::{DescriptorWalletProvider, SpendingWalletProvider};
pub use psbt::{Psbt, PsbtError};
pub use transactions::{BitcoinBalance, BitcoinTransaction, ConfirmationStatus};
pub use wallet::DescriptorSpendingWallet;

use crate::{
    chain::ChainError,
    errors::{ErrorCode, KeyDerivationError, StorageError},
    keys::BitcoinNetworkType,
};
use async_trait::async_trait;
use bitcoin::{address::NetworkUnchecked, Address};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Outputs below this are not relayed.
pub const DUST_LIMIT_SATS: u64 = 546;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletStatus {
    Uninitialized,
    Syncing,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadableValue<T> {
    InitialLoading,
    Loaded(T),
}

impl<T> LoadableValue<T> {
    pub const fn loaded(&self) -> Option<&T> {
        match self {
            Self::InitialLoading => None,
            Self::Loaded(v) => Some(v),
        }
    }
}

/// What readers see. Replaced as a whole on every sync, never patched in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletSnapshot {
    pub status: WalletStatus,
    pub balance: LoadableValue<BitcoinBalance>,
    pub transactions: LoadableValue<Vec<BitcoinTransaction>>,
}

impl WalletSnapshot {
    pub const fn uninitialized() -> Self {
        Self {
            status: WalletStatus::Uninitialized,
            balance: LoadableValue::InitialLoading,
            transactions: LoadableValue::InitialLoading,
        }
    }

    pub fn ready(transactions: Vec<BitcoinTransaction>) -> Self {
        Self {
            status: WalletStatus::Ready,
            balance: LoadableValue::Loaded(BitcoinBalance::from_transactions(&transactions)),
            transactions: LoadableValue::Loaded(transactions),
        }
    }

    pub fn balance_or_zero(&self) -> BitcoinBalance {
        self.balance.loaded().copied().unwrap_or(BitcoinBalance::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendAmount {
    Exact(u64),
    /// Drain the wallet to the recipient.
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeePolicy {
    Absolute(u64),
    /// Sats per vbyte.
    Rate(u64),
    MinRelayRate,
}

impl FeePolicy {
    pub const fn fee_for_vsize(self, vsize: u64) -> u64 {
        match self {
            Self::Absolute(fee) => fee,
            Self::Rate(rate) => rate.saturating_mul(vsize),
            Self::MinRelayRate => vsize,
        }
    }
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("insufficient funds: need {needed} sats, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("amount {0} sats is below the dust limit")]
    DustAmount(u64),

    #[error("chain data unavailable: {0}")]
    Networking(String),

    #[error(transparent)]
    Chain(ChainError),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Psbt(#[from] PsbtError),

    #[error(transparent)]
    KeyDerivation(#[from] KeyDerivationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<ChainError> for WalletError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::Networking(msg) => Self::Networking(msg),
            ChainError::NoEndpoints => Self::Networking(e.to_string()),
            ChainError::Rejected(_) | ChainError::Decode(_) => Self::Chain(e),
        }
    }
}

impl ErrorCode for WalletError {
    fn code(&self) -> &'static str {
        match self {
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::DustAmount(_) => "dust_amount",
            Self::Networking(_) => "wallet_networking",
            Self::Chain(e) => e.code(),
            Self::InvalidAddress(_) => "invalid_address",
            Self::Signing(_) => "signing_failed",
            Self::Psbt(e) => e.code(),
            Self::KeyDerivation(e) => e.code(),
            Self::Storage(e) => e.code(),
        }
    }
}

/// Parse `s` and require it to belong to `network`.
pub fn parse_address(s: &str, network: BitcoinNetworkType) -> Result<Address, WalletError> {
    s.trim()
        .parse::<Address<NetworkUnchecked>>()
        .map_err(|e| WalletError::InvalidAddress(e.to_string()))?
        .require_network(network.network())
        .map_err(|e| WalletError::InvalidAddress(e.to_string()))
}

#[async_trait]
pub trait SpendingWallet: Send + Sync + std::fmt::Debug {
    /// Keyset id for descriptor wallets.
    fn identifier(&self) -> &str;

    /// Move to an empty, loaded state. Safe to call more than once.
    async fn initialize(&self) -> Result<(), WalletError>;

    /// Replace the transaction set with the provider's and publish one new snapshot.
    async fn sync(&self) -> Result<(), WalletError>;

    fn subscribe(&self) -> watch::Receiver<WalletSnapshot>;

    fn snapshot(&self) -> WalletSnapshot {
        self.subscribe().borrow().clone()
    }

    fn balance(&self) -> BitcoinBalance {
        self.snapshot().balance_or_zero()
    }

    async fn get_new_address(&self) -> Result<Address, WalletError>;

    async fn get_last_unused_address(&self) -> Result<Address, WalletError>;

    async fn is_mine(&self, address: &Address) -> Result<bool, WalletError>;

    async fn create_psbt(
        &self,
        recipient: &Address,
        amount: SendAmount,
        fee_policy: FeePolicy,
    ) -> Result<Psbt, WalletError>;

    /// Whether [`SpendingWallet::sign_psbt`] can add the app signature.
    fn can_sign(&self) -> bool {
        true
    }

    /// Add this wallet's signatures. Existing signatures are kept.
    async fn sign_psbt(&self, psbt: &Psbt) -> Result<Psbt, WalletError>;
}

/// Sync now, then every `interval`, until `cancel` fires.
///
/// Failures are logged and the loop keeps going. A sync already in progress finishes before
/// the loop notices cancellation.
pub fn launch_periodic_sync(
    wallet: Arc<dyn SpendingWallet>,
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
                    tracing::debug!(wallet = wallet.identifier(), "periodic sync cancelled");
                    break;
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = wallet.sync().await {
                tracing::warn!(
                    wallet = wallet.identifier(),
                    code = e.code(),
                    error = %e,
                    "periodic wallet sync failed"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn periodic_sync_survives_failures_and_stops_on_cancel() -> eyre::Result<()> {
        let wallet = Arc::new(SpendingWalletFake::new(BitcoinNetworkType::Regtest));
        wallet.fail_next_syncs(1).await;
        let cancel = CancellationToken::new();
        let handle = launch_periodic_sync(
            Arc::clone(&wallet) as Arc<dyn SpendingWallet>,
            Duration::from_secs(30),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(wallet.sync_count(), 1);
        wallet.receive_funds(10_000).await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(wallet.sync_count(), 2);
        assert_eq!(wallet.balance().trusted_pending, 10_000);

        cancel.cancel();
        handle.await?;
        Ok(())
    }

    #[test]
    fn rejects_addresses_for_other_networks() {
        let mainnet = "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq";
        assert!(parse_address(mainnet, BitcoinNetworkType::Bitcoin).is_ok());
        assert!(matches!(
            parse_address(mainnet, BitcoinNetworkType::Regtest),
            Err(WalletError::InvalidAddress(_))
        ));
    }
}
