use super::{
    psbt::Psbt, BitcoinTransaction, ConfirmationStatus, FeePolicy, SendAmount, SpendingWallet,
    WalletError, WalletSnapshot, DUST_LIMIT_SATS,
};
use crate::keys::BitcoinNetworkType;
use async_trait::async_trait;
use bitcoin::{
    absolute::LockTime,
    hashes::Hash as _,
    secp256k1::{Secp256k1, SecretKey},
    transaction::Version,
    Address, Amount, CompressedPublicKey, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Txid, Witness,
};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{watch, Mutex};

const DEFAULT_SEND_FEE_SATS: u64 = 500;
const INITIAL_BLOCK_HEIGHT: u32 = 400;
const ADDRESS_POOL_SIZE: usize = 3;

#[derive(Debug)]
struct FakeState {
    transactions: Vec<BitcoinTransaction>,
    block_height: u32,
    block_time: DateTime<Utc>,
    next_tx: u64,
    next_address: usize,
    fail_syncs: u32,
}

/// In-memory wallet for driving balance and transaction flows in tests.
///
/// `receive_funds`, `send_funds` and `mine_block` change the backing set; nothing is visible to
/// readers until the next [`SpendingWallet::sync`].
#[derive(Debug)]
pub struct SpendingWalletFake {
    identifier: String,
    network: BitcoinNetworkType,
    addresses: Vec<Address>,
    state: Mutex<FakeState>,
    snapshot: watch::Sender<WalletSnapshot>,
    syncs: AtomicU32,
}

fn fresh_state() -> FakeState {
    FakeState {
        transactions: vec![],
        block_height: INITIAL_BLOCK_HEIGHT,
        block_time: DateTime::<Utc>::UNIX_EPOCH + TimeDelta::days(19_723),
        next_tx: 0,
        next_address: 0,
        fail_syncs: 0,
    }
}

fn fake_address(network: BitcoinNetworkType, seed: u8) -> Option<Address> {
    let sk = SecretKey::from_slice(&[seed.max(1); 32]).ok()?;
    let pk = CompressedPublicKey(sk.public_key(&Secp256k1::signing_only()));
    Some(Address::p2wpkh(&pk, network.network()))
}

fn fake_txid(n: u64) -> Txid {
    Txid::from_byte_array(crate::crypto::sha256(format!("fake-tx-{n}").as_bytes()))
}

impl SpendingWalletFake {
    pub fn new(network: BitcoinNetworkType) -> Self {
        let addresses = (1..=u8::try_from(ADDRESS_POOL_SIZE).unwrap_or(u8::MAX))
            .filter_map(|seed| fake_address(network, seed))
            .collect();
        let (snapshot, _rx) = watch::channel(WalletSnapshot::uninitialized());
        Self {
            identifier: "spending-wallet-fake".to_owned(),
            network,
            addresses,
            state: Mutex::new(fresh_state()),
            snapshot,
            syncs: AtomicU32::new(0),
        }
    }

    /// Add a pending incoming transaction.
    pub async fn receive_funds(&self, amount_sats: u64) -> Txid {
        let mut st = self.state.lock().await;
        st.next_tx += 1;
        let id = fake_txid(st.next_tx);
        let recipient = self.addresses.first().map(ToString::to_string);
        let block_time = st.block_time;
        st.transactions.push(BitcoinTransaction {
            id,
            recipient_address: recipient,
            broadcast_time: Some(block_time),
            confirmation_status: ConfirmationStatus::Pending,
            vsize: None,
            fee_sats: None,
            subtotal_sats: amount_sats,
            total_sats: amount_sats,
            incoming: true,
        });
        id
    }

    /// Add a pending outgoing transaction paying `fee_sats` (500 by default) on top of `amount_sats`.
    pub async fn send_funds(&self, amount_sats: u64, fee_sats: Option<u64>) -> Txid {
        let fee = fee_sats.unwrap_or(DEFAULT_SEND_FEE_SATS);
        let mut st = self.state.lock().await;
        st.next_tx += 1;
        let id = fake_txid(st.next_tx);
        let block_time = st.block_time;
        st.transactions.push(BitcoinTransaction {
            id,
            recipient_address: None,
            broadcast_time: Some(block_time),
            confirmation_status: ConfirmationStatus::Pending,
            vsize: None,
            fee_sats: Some(fee),
            subtotal_sats: amount_sats,
            total_sats: amount_sats.saturating_add(fee),
            incoming: false,
        });
        id
    }

    /// Confirm every pending transaction in a new block ten minutes after the last.
    pub async fn mine_block(&self) -> u32 {
        let mut st = self.state.lock().await;
        st.block_height += 1;
        st.block_time += TimeDelta::minutes(10);
        let confirmed = ConfirmationStatus::Confirmed {
            block_height: st.block_height,
            block_time: st.block_time,
        };
        for tx in &mut st.transactions {
            if !tx.confirmation_status.is_confirmed() {
                tx.confirmation_status = confirmed;
            }
        }
        st.block_height
    }

    pub async fn reset(&self) {
        *self.state.lock().await = fresh_state();
        self.snapshot.send_replace(WalletSnapshot::uninitialized());
    }

    pub async fn fail_next_syncs(&self, n: u32) {
        self.state.lock().await.fail_syncs = n;
    }

    /// Sync attempts so far, including failed ones.
    pub fn sync_count(&self) -> u32 {
        self.syncs.load(Ordering::SeqCst)
    }

    fn placeholder_psbt(&self, amount_sats: u64, fee_sats: u64) -> Result<Psbt, WalletError> {
        let recipient = self
            .addresses
            .first()
            .map_or_else(ScriptBuf::new, Address::script_pubkey);
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: fake_txid(0),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(amount_sats),
                script_pubkey: recipient.clone(),
            }],
        };
        let mut inner = bitcoin::Psbt::from_unsigned_tx(tx)
            .map_err(|e| WalletError::Psbt(super::PsbtError::Decode(e.to_string())))?;
        if let Some(input) = inner.inputs.first_mut() {
            input.witness_utxo = Some(TxOut {
                value: Amount::from_sat(amount_sats.saturating_add(fee_sats)),
                script_pubkey: recipient,
            });
        }
        Ok(Psbt::from_inner(&inner, amount_sats)?)
    }
}

#[async_trait]
impl SpendingWallet for SpendingWalletFake {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn initialize(&self) -> Result<(), WalletError> {
        self.snapshot.send_replace(WalletSnapshot::ready(vec![]));
        Ok(())
    }

    async fn sync(&self) -> Result<(), WalletError> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        let mut st = self.state.lock().await;
        if st.fail_syncs > 0 {
            st.fail_syncs -= 1;
            return Err(WalletError::Networking("fake sync failure".to_owned()));
        }
        self.snapshot
            .send_replace(WalletSnapshot::ready(st.transactions.clone()));
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<WalletSnapshot> {
        self.snapshot.subscribe()
    }

    async fn get_new_address(&self) -> Result<Address, WalletError> {
        let mut st = self.state.lock().await;
        let addr = self
            .addresses
            .get(st.next_address % self.addresses.len().max(1))
            .cloned()
            .ok_or_else(|| WalletError::InvalidAddress("fake address pool is empty".to_owned()))?;
        st.next_address = st.next_address.wrapping_add(1);
        Ok(addr)
    }

    async fn get_last_unused_address(&self) -> Result<Address, WalletError> {
        let st = self.state.lock().await;
        let last = st.next_address.checked_sub(1).unwrap_or_default();
        self.addresses
            .get(last % self.addresses.len().max(1))
            .cloned()
            .ok_or_else(|| WalletError::InvalidAddress("fake address pool is empty".to_owned()))
    }

    async fn is_mine(&self, address: &Address) -> Result<bool, WalletError> {
        Ok(self.addresses.contains(address))
    }

    async fn create_psbt(
        &self,
        _recipient: &Address,
        amount: SendAmount,
        fee_policy: FeePolicy,
    ) -> Result<Psbt, WalletError> {
        let fee = fee_policy.fee_for_vsize(150);
        let available = u64::try_from(self.balance().spendable).unwrap_or_default();
        let amount_sats = match amount {
            SendAmount::Exact(a) => a,
            SendAmount::All => available.saturating_sub(fee),
        };
        if amount_sats < DUST_LIMIT_SATS {
            return Err(WalletError::DustAmount(amount_sats));
        }
        if amount_sats.saturating_add(fee) > available {
            return Err(WalletError::InsufficientFunds {
                needed: amount_sats.saturating_add(fee),
                available,
            });
        }
        self.placeholder_psbt(amount_sats, fee)
    }

    async fn sign_psbt(&self, psbt: &Psbt) -> Result<Psbt, WalletError> {
        tracing::debug!(network = %self.network, psbt = %psbt.id, "fake wallet signed psbt");
        Ok(psbt.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_funds_confirm_after_mining_and_sync() -> eyre::Result<()> {
        let w = SpendingWalletFake::new(BitcoinNetworkType::Regtest);
        w.initialize().await?;
        w.receive_funds(50_000).await;
        w.sync().await?;
        let b = w.balance();
        assert_eq!(b.trusted_pending, 50_000);
        assert_eq!(b.confirmed, 0);

        w.mine_block().await;
        w.sync().await?;
        let b = w.balance();
        assert_eq!(b.confirmed, 50_000);
        assert_eq!(b.trusted_pending, 0);
        Ok(())
    }

    #[tokio::test]
    async fn spendable_tracks_every_interleaving() -> eyre::Result<()> {
        let w = SpendingWalletFake::new(BitcoinNetworkType::Regtest);
        w.receive_funds(40_000).await;
        w.mine_block().await;
        w.send_funds(10_000, None).await;
        w.receive_funds(3_000).await;
        w.sync().await?;
        let snap = w.snapshot();
        let txs = snap
            .transactions
            .loaded()
            .ok_or_else(|| eyre::eyre!("transactions not loaded"))?;
        let confirmed: i64 = txs
            .iter()
            .filter(|t| t.confirmation_status.is_confirmed())
            .map(BitcoinTransaction::signed_total)
            .sum();
        let pending: i64 = txs
            .iter()
            .filter(|t| !t.confirmation_status.is_confirmed())
            .map(BitcoinTransaction::signed_total)
            .sum();
        assert_eq!(snap.balance_or_zero().spendable, confirmed + pending);
        assert_eq!(snap.balance_or_zero().spendable, 40_000 - 10_500 + 3_000);
        Ok(())
    }

    #[tokio::test]
    async fn addresses_rotate() -> eyre::Result<()> {
        let w = SpendingWalletFake::new(BitcoinNetworkType::Regtest);
        let a = w.get_new_address().await?;
        let b = w.get_new_address().await?;
        assert_ne!(a, b);
        assert_eq!(w.get_last_unused_address().await?, b);
        assert!(w.is_mine(&a).await?);
        Ok(())
    }
}
