use super::{
    descriptor::{derive_script, DerivedScript, CHANGE_CHAIN, RECEIVE_CHAIN},
    psbt::{estimated_vsize, Psbt, PsbtError},
    BitcoinTransaction, ConfirmationStatus, FeePolicy, SendAmount, SpendingWallet, WalletError,
    WalletSnapshot, WalletStatus, DUST_LIMIT_SATS,
};
use crate::{
    chain::{ChainDataProvider, ChainTransaction},
    clock::Clock,
    keybox::SpendingKeyset,
    keys::{BitcoinNetworkType, ExtendedPrivateKey},
    secure_store::SecureStore,
};
use async_trait::async_trait;
use bitcoin::{
    absolute::LockTime,
    secp256k1::{All, Secp256k1},
    transaction::Version,
    Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};
use tokio::sync::{watch, Mutex};

#[derive(Debug, Clone)]
struct Utxo {
    outpoint: OutPoint,
    value_sats: u64,
    script: DerivedScript,
}

#[derive(Debug, Clone)]
struct TrackedTx {
    chain_tx: ChainTransaction,
    first_seen: DateTime<Utc>,
    status: ConfirmationStatus,
}

#[derive(Debug, Default)]
struct WalletState {
    /// Next receive index to hand out. Persisted.
    receive_index: u32,
    change_index: u32,
    by_index: HashMap<(u32, u32), ScriptBuf>,
    derived: HashMap<ScriptBuf, DerivedScript>,
    used: HashSet<ScriptBuf>,
    seen: HashMap<Txid, TrackedTx>,
    utxos: Vec<Utxo>,
}

/// A spending wallet over one keyset's 2-of-3 descriptor, backed by a chain-data provider.
///
/// Holds the app's spending key when the app has it; without one the wallet is watch-only and
/// [`SpendingWallet::sign_psbt`] fails.
pub struct DescriptorSpendingWallet {
    keyset: SpendingKeyset,
    network: BitcoinNetworkType,
    signer: Option<ExtendedPrivateKey>,
    chain: Arc<dyn ChainDataProvider>,
    store: SecureStore,
    clock: Arc<dyn Clock>,
    gap_limit: u32,
    secp: Secp256k1<All>,
    sync_lock: Mutex<()>,
    state: Mutex<WalletState>,
    snapshot: watch::Sender<WalletSnapshot>,
}

impl fmt::Debug for DescriptorSpendingWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorSpendingWallet")
            .field("keyset_id", &self.keyset.keyset_id())
            .field("network", &self.network)
            .field("can_sign", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

fn receive_index_key(keyset_id: &str) -> String {
    format!("spending-wallet-receive-index:{keyset_id}")
}

fn status_of(tx: &ChainTransaction) -> ConfirmationStatus {
    tx.confirmed
        .map_or(ConfirmationStatus::Pending, |b| ConfirmationStatus::Confirmed {
            block_height: b.height,
            block_time: DateTime::from_timestamp(b.timestamp, 0).unwrap_or_default(),
        })
}

impl DescriptorSpendingWallet {
    pub async fn load(
        keyset: SpendingKeyset,
        signer: Option<ExtendedPrivateKey>,
        chain: Arc<dyn ChainDataProvider>,
        store: SecureStore,
        clock: Arc<dyn Clock>,
        gap_limit: u32,
    ) -> Result<Self, WalletError> {
        if let Some(s) = &signer {
            if s.fingerprint() != keyset.app_key.origin_fingerprint {
                return Err(WalletError::Signing(format!(
                    "spending key {} does not belong to keyset {}",
                    s.fingerprint(),
                    keyset.keyset_id()
                )));
            }
        }
        let receive_index = store
            .get_json::<u32>(&receive_index_key(keyset.keyset_id()))
            .await?
            .unwrap_or_default();
        let (snapshot, _rx) = watch::channel(WalletSnapshot::uninitialized());
        Ok(Self {
            network: keyset.network_type,
            keyset,
            signer,
            chain,
            store,
            clock,
            gap_limit: gap_limit.max(1),
            secp: Secp256k1::new(),
            sync_lock: Mutex::new(()),
            state: Mutex::new(WalletState {
                receive_index,
                ..WalletState::default()
            }),
            snapshot,
        })
    }

    pub const fn keyset(&self) -> &SpendingKeyset {
        &self.keyset
    }

    fn derive_in(
        &self,
        st: &mut WalletState,
        chain: u32,
        index: u32,
    ) -> Result<DerivedScript, WalletError> {
        if let Some(d) = st.by_index.get(&(chain, index)).and_then(|s| st.derived.get(s)) {
            return Ok(d.clone());
        }
        let d = derive_script(&self.keyset, &self.secp, self.network, chain, index)?;
        st.by_index.insert((chain, index), d.script_pubkey.clone());
        st.derived.insert(d.script_pubkey.clone(), d.clone());
        Ok(d)
    }

    fn next_unused_in(
        &self,
        st: &mut WalletState,
        chain: u32,
        from: u32,
    ) -> Result<DerivedScript, WalletError> {
        let mut index = from;
        loop {
            let d = self.derive_in(st, chain, index)?;
            if !st.used.contains(&d.script_pubkey) {
                return Ok(d);
            }
            // Derivation fails past the last normal index, which ends the loop.
            index = index.saturating_add(1);
        }
    }

    async fn persist_receive_index(&self, index: u32) -> Result<(), WalletError> {
        self.store
            .put_json(&receive_index_key(self.keyset.keyset_id()), &index)
            .await?;
        Ok(())
    }

    fn set_status(&self, status: WalletStatus) {
        self.snapshot.send_modify(|s| s.status = status);
    }

    /// Scan one derivation chain until `gap_limit` consecutive unused scripts, and at least
    /// up to `floor`.
    async fn scan_chain(
        &self,
        chain: u32,
        floor: u32,
        found: &mut Vec<ChainTransaction>,
        used: &mut HashSet<ScriptBuf>,
    ) -> Result<(), WalletError> {
        let mut index = 0_u32;
        let mut unused_run = 0_u32;
        while unused_run < self.gap_limit || index < floor {
            let script = {
                let mut st = self.state.lock().await;
                self.derive_in(&mut st, chain, index)?
            };
            let history = self.chain.script_history(&script.script_pubkey).await?;
            if history.is_empty() {
                unused_run += 1;
            } else {
                unused_run = 0;
                used.insert(script.script_pubkey);
                found.extend(history);
            }
            index = index.saturating_add(1);
        }
        Ok(())
    }

    async fn sync_once(&self) -> Result<(), WalletError> {
        let floor = self.state.lock().await.receive_index;
        let mut found = Vec::new();
        let mut used = HashSet::new();
        self.scan_chain(RECEIVE_CHAIN, floor, &mut found, &mut used).await?;
        self.scan_chain(CHANGE_CHAIN, 0, &mut found, &mut used).await?;

        let now = self.clock.now();
        let mut st = self.state.lock().await;

        let mut seen: HashMap<Txid, TrackedTx> = HashMap::new();
        for tx in found {
            if seen.contains_key(&tx.txid) {
                continue;
            }
            let observed = status_of(&tx);
            let tracked = match st.seen.get(&tx.txid) {
                Some(prev) => TrackedTx {
                    first_seen: prev.first_seen,
                    status: prev.status.merge(observed),
                    chain_tx: tx,
                },
                None => TrackedTx {
                    first_seen: now,
                    status: observed,
                    chain_tx: tx,
                },
            };
            seen.insert(tracked.chain_tx.txid, tracked);
        }

        let spent: HashSet<OutPoint> = seen
            .values()
            .flat_map(|t| t.chain_tx.inputs.iter().map(|i| i.previous_output))
            .collect();
        let mut utxos = Vec::new();
        for t in seen.values() {
            for (vout, out) in (0_u32..).zip(t.chain_tx.outputs.iter()) {
                let outpoint = OutPoint {
                    txid: t.chain_tx.txid,
                    vout,
                };
                if spent.contains(&outpoint) {
                    continue;
                }
                if let Some(script) = st.derived.get(&out.script_pubkey) {
                    utxos.push(Utxo {
                        outpoint,
                        value_sats: out.value_sats,
                        script: script.clone(),
                    });
                }
            }
        }

        let mut transactions: Vec<BitcoinTransaction> = seen
            .values()
            .filter_map(|t| self.to_wallet_tx(&st, t))
            .collect();
        transactions.sort_by(|a, b| {
            let height = |t: &BitcoinTransaction| t.confirmation_status.block_height().unwrap_or(u32::MAX);
            height(b)
                .cmp(&height(a))
                .then_with(|| b.broadcast_time.cmp(&a.broadcast_time))
        });

        let max_used = |chain: u32| {
            used.iter()
                .filter_map(|s| st.derived.get(s))
                .filter(|d| d.chain == chain)
                .map(|d| d.index.saturating_add(1))
                .max()
                .unwrap_or_default()
        };
        let receive_floor = max_used(RECEIVE_CHAIN);
        let change_floor = max_used(CHANGE_CHAIN);
        // Nothing below changes unless the new floor is stored first.
        if receive_floor > st.receive_index {
            self.persist_receive_index(receive_floor).await?;
            st.receive_index = receive_floor;
        }
        st.change_index = st.change_index.max(change_floor);
        st.used = used;
        st.seen = seen;
        st.utxos = utxos;

        let snapshot = WalletSnapshot::ready(transactions);
        tracing::info!(
            keyset_id = self.keyset.keyset_id(),
            transactions = st.seen.len(),
            utxos = st.utxos.len(),
            spendable = snapshot.balance_or_zero().spendable,
            "wallet synced"
        );
        self.snapshot.send_replace(snapshot);
        Ok(())
    }

    fn to_wallet_tx(&self, st: &WalletState, t: &TrackedTx) -> Option<BitcoinTransaction> {
        let ours = |s: &ScriptBuf| st.derived.contains_key(s);
        let tx = &t.chain_tx;
        let ours_in: u64 = tx
            .inputs
            .iter()
            .filter_map(|i| i.prevout.as_ref())
            .filter(|p| ours(&p.script_pubkey))
            .map(|p| p.value_sats)
            .sum();
        let ours_out: u64 = tx
            .outputs
            .iter()
            .filter(|o| ours(&o.script_pubkey))
            .map(|o| o.value_sats)
            .sum();
        if ours_in == 0 && ours_out == 0 {
            return None;
        }
        let address_of = |s: &ScriptBuf| {
            Address::from_script(s, self.network.network())
                .ok()
                .map(|a| a.to_string())
        };

        let (incoming, fee_sats, subtotal_sats, total_sats, recipient) = if ours_in == 0 {
            let to = tx
                .outputs
                .iter()
                .find(|o| ours(&o.script_pubkey))
                .and_then(|o| address_of(&o.script_pubkey));
            (true, None, ours_out, ours_out, to)
        } else {
            let sent = ours_in.saturating_sub(ours_out);
            let fee = tx.fee_sats.unwrap_or_default().min(sent);
            let to = tx
                .outputs
                .iter()
                .find(|o| !ours(&o.script_pubkey))
                .and_then(|o| address_of(&o.script_pubkey));
            (false, Some(fee), sent - fee, sent, to)
        };
        Some(BitcoinTransaction {
            id: tx.txid,
            recipient_address: recipient,
            broadcast_time: Some(t.first_seen),
            confirmation_status: t.status,
            vsize: tx.vsize(),
            fee_sats,
            subtotal_sats,
            total_sats,
            incoming,
        })
    }

    fn build_psbt(
        &self,
        selection: &Selection,
        recipient: &ScriptBuf,
        change: Option<&DerivedScript>,
    ) -> Result<Psbt, WalletError> {
        let tx = skeleton_tx(
            &selection.inputs,
            &outputs_for(recipient, selection.amount_sats, change.map(|c| (&c.script_pubkey, selection.change_sats))),
        );
        let mut inner =
            bitcoin::Psbt::from_unsigned_tx(tx).map_err(|e| PsbtError::Decode(e.to_string()))?;
        for (input, utxo) in inner.inputs.iter_mut().zip(&selection.inputs) {
            input.witness_utxo = Some(TxOut {
                value: Amount::from_sat(utxo.value_sats),
                script_pubkey: utxo.script.script_pubkey.clone(),
            });
            input.witness_script = Some(utxo.script.witness_script.clone());
            input.bip32_derivation = utxo.script.key_sources.iter().cloned().collect();
        }
        if let (Some(change), Some(output)) = (change, inner.outputs.get_mut(1)) {
            output.witness_script = Some(change.witness_script.clone());
            output.bip32_derivation = change.key_sources.iter().cloned().collect();
        }
        Ok(Psbt::from_inner(&inner, selection.amount_sats)?)
    }
}

#[derive(Debug)]
struct Selection {
    inputs: Vec<Utxo>,
    amount_sats: u64,
    change_sats: u64,
}

fn outputs_for<'a>(
    recipient: &'a ScriptBuf,
    amount: u64,
    change: Option<(&'a ScriptBuf, u64)>,
) -> Vec<(&'a ScriptBuf, u64)> {
    std::iter::once((recipient, amount)).chain(change).collect()
}

fn skeleton_tx(inputs: &[Utxo], outputs: &[(&ScriptBuf, u64)]) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|u| TxIn {
                previous_output: u.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs
            .iter()
            .map(|(script, value)| TxOut {
                value: Amount::from_sat(*value),
                script_pubkey: (*script).clone(),
            })
            .collect(),
    }
}

fn fee_for(policy: FeePolicy, inputs: &[Utxo], outputs: &[(&ScriptBuf, u64)]) -> u64 {
    policy.fee_for_vsize(estimated_vsize(&skeleton_tx(inputs, outputs)))
}

/// Largest-first selection. Change below the dust limit goes to the fee.
fn select_coins(
    utxos: &[Utxo],
    amount: SendAmount,
    policy: FeePolicy,
    recipient: &ScriptBuf,
    change: &ScriptBuf,
) -> Result<Selection, WalletError> {
    let mut sorted = utxos.to_vec();
    sorted.sort_by(|a, b| b.value_sats.cmp(&a.value_sats));
    let available: u64 = sorted.iter().map(|u| u.value_sats).sum();

    match amount {
        SendAmount::All => {
            let fee = fee_for(policy, &sorted, &[(recipient, 0)]);
            let amount_sats = available
                .checked_sub(fee)
                .filter(|a| *a >= DUST_LIMIT_SATS)
                .ok_or(WalletError::InsufficientFunds {
                    needed: fee.saturating_add(DUST_LIMIT_SATS),
                    available,
                })?;
            Ok(Selection {
                inputs: sorted,
                amount_sats,
                change_sats: 0,
            })
        }
        SendAmount::Exact(amount_sats) => {
            if amount_sats < DUST_LIMIT_SATS {
                return Err(WalletError::DustAmount(amount_sats));
            }
            let mut chosen = Vec::new();
            let mut sum = 0_u64;
            for u in sorted {
                sum = sum.saturating_add(u.value_sats);
                chosen.push(u);
                let with_change = fee_for(policy, &chosen, &[(recipient, amount_sats), (change, 0)]);
                if let Some(left) = sum.checked_sub(amount_sats.saturating_add(with_change)) {
                    if left >= DUST_LIMIT_SATS {
                        return Ok(Selection {
                            inputs: chosen,
                            amount_sats,
                            change_sats: left,
                        });
                    }
                }
                let without_change = fee_for(policy, &chosen, &[(recipient, amount_sats)]);
                if sum >= amount_sats.saturating_add(without_change) {
                    return Ok(Selection {
                        inputs: chosen,
                        amount_sats,
                        change_sats: 0,
                    });
                }
            }
            Err(WalletError::InsufficientFunds {
                needed: amount_sats.saturating_add(fee_for(policy, &chosen, &[(recipient, amount_sats)])),
                available,
            })
        }
    }
}

#[async_trait]
impl SpendingWallet for DescriptorSpendingWallet {
    fn identifier(&self) -> &str {
        self.keyset.keyset_id()
    }

    fn can_sign(&self) -> bool {
        self.signer.is_some()
    }

    async fn initialize(&self) -> Result<(), WalletError> {
        if self.snapshot.borrow().status == WalletStatus::Uninitialized {
            self.snapshot.send_replace(WalletSnapshot::ready(vec![]));
        }
        Ok(())
    }

    async fn sync(&self) -> Result<(), WalletError> {
        let _guard = self.sync_lock.lock().await;
        let previous = self.snapshot.borrow().status;
        self.set_status(WalletStatus::Syncing);
        tracing::debug!(keyset_id = self.keyset.keyset_id(), "wallet sync started");
        let res = self.sync_once().await;
        if let Err(e) = &res {
            tracing::warn!(keyset_id = self.keyset.keyset_id(), error = %e, "wallet sync failed");
            let restored = if previous == WalletStatus::Syncing {
                WalletStatus::Ready
            } else {
                previous
            };
            self.set_status(restored);
        }
        res
    }

    fn subscribe(&self) -> watch::Receiver<WalletSnapshot> {
        self.snapshot.subscribe()
    }

    async fn get_new_address(&self) -> Result<Address, WalletError> {
        let mut st = self.state.lock().await;
        let from = st.receive_index;
        let d = self.next_unused_in(&mut st, RECEIVE_CHAIN, from)?;
        let next = d.index.saturating_add(1);
        self.persist_receive_index(next).await?;
        st.receive_index = next;
        tracing::debug!(keyset_id = self.keyset.keyset_id(), index = d.index, "revealed address");
        Ok(d.address)
    }

    async fn get_last_unused_address(&self) -> Result<Address, WalletError> {
        {
            let mut st = self.state.lock().await;
            if let Some(last) = st.receive_index.checked_sub(1) {
                let d = self.derive_in(&mut st, RECEIVE_CHAIN, last)?;
                if !st.used.contains(&d.script_pubkey) {
                    return Ok(d.address);
                }
            }
        }
        self.get_new_address().await
    }

    async fn is_mine(&self, address: &Address) -> Result<bool, WalletError> {
        let mut st = self.state.lock().await;
        let receive_upto = st.receive_index.saturating_add(self.gap_limit);
        let change_upto = st.change_index.saturating_add(self.gap_limit);
        for index in 0..receive_upto {
            self.derive_in(&mut st, RECEIVE_CHAIN, index)?;
        }
        for index in 0..change_upto {
            self.derive_in(&mut st, CHANGE_CHAIN, index)?;
        }
        Ok(st.derived.contains_key(&address.script_pubkey()))
    }

    async fn create_psbt(
        &self,
        recipient: &Address,
        amount: SendAmount,
        fee_policy: FeePolicy,
    ) -> Result<Psbt, WalletError> {
        let mut st = self.state.lock().await;
        let from = st.change_index;
        let change = self.next_unused_in(&mut st, CHANGE_CHAIN, from)?;
        let recipient_script = recipient.script_pubkey();
        let selection = select_coins(
            &st.utxos,
            amount,
            fee_policy,
            &recipient_script,
            &change.script_pubkey,
        )?;
        let change_used = selection.change_sats > 0;
        let psbt = self.build_psbt(&selection, &recipient_script, change_used.then_some(&change))?;
        if change_used {
            st.change_index = change.index.saturating_add(1);
        }
        tracing::info!(
            keyset_id = self.keyset.keyset_id(),
            psbt = %psbt.id,
            inputs = psbt.num_inputs,
            amount_sats = psbt.amount_sats,
            fee_sats = psbt.fee_sats,
            "created psbt"
        );
        Ok(psbt)
    }

    async fn sign_psbt(&self, psbt: &Psbt) -> Result<Psbt, WalletError> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            WalletError::Signing(format!(
                "no app spending key for keyset {}",
                self.keyset.keyset_id()
            ))
        })?;
        let mut inner = psbt.to_inner()?;
        inner
            .sign(&signer.xprv, &self.secp)
            .map_err(|(_, errors)| WalletError::Signing(format!("{} inputs failed to sign", errors.len())))?;
        let signed = psbt.with_payload(&inner)?;
        if !signed.has_signature_from(&self.keyset.app_key)? {
            return Err(WalletError::Signing(format!(
                "psbt {} spends inputs outside keyset {}",
                psbt.id,
                self.keyset.keyset_id()
            )));
        }
        tracing::debug!(keyset_id = self.keyset.keyset_id(), psbt = %psbt.id, "app signed psbt");
        Ok(signed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::BlockchainFake,
        clock::ClockFake,
        keybox::{F8eSpendingKeyset, SpendingKeyset},
        keys::generator::{generate_master_key, spending_keypair_at},
    };

    const NET: BitcoinNetworkType = BitcoinNetworkType::Regtest;

    struct Harness {
        chain: Arc<BlockchainFake>,
        wallet: DescriptorSpendingWallet,
        hw_master: ExtendedPrivateKey,
        store: SecureStore,
    }

    fn foreign_address() -> eyre::Result<Address> {
        let pk = crate::keys::generate_auth_keypair()?.public_key.0;
        Ok(Address::p2wpkh(&bitcoin::CompressedPublicKey(pk), NET.network()))
    }

    async fn harness() -> eyre::Result<Harness> {
        harness_with(SecureStore::in_memory()).await
    }

    async fn harness_with(store: SecureStore) -> eyre::Result<Harness> {
        let app = spending_keypair_at(&generate_master_key(NET)?, NET, 0)?;
        let hw_master = generate_master_key(NET)?;
        let hw = spending_keypair_at(&hw_master, NET, 0)?;
        let server = spending_keypair_at(&generate_master_key(NET)?, NET, 0)?;
        let keyset = SpendingKeyset {
            local_id: "local".into(),
            network_type: NET,
            app_key: app.public_key.clone(),
            hardware_key: hw.public_key,
            f8e_spending_keyset: F8eSpendingKeyset {
                keyset_id: "keyset-a".into(),
                spending_public_key: server.public_key,
            },
        };
        let chain = Arc::new(BlockchainFake::new());
        let wallet = DescriptorSpendingWallet::load(
            keyset,
            Some(app.private_key),
            Arc::clone(&chain) as Arc<dyn ChainDataProvider>,
            store.clone(),
            Arc::new(ClockFake::default()),
            5,
        )
        .await?;
        Ok(Harness {
            chain,
            wallet,
            hw_master,
            store,
        })
    }

    #[tokio::test]
    async fn receives_and_confirms_funds() -> eyre::Result<()> {
        let h = harness().await?;
        h.wallet.initialize().await?;
        let addr = h.wallet.get_new_address().await?;
        h.chain.fund(&addr.script_pubkey(), 50_000);

        h.wallet.sync().await?;
        assert_eq!(h.wallet.balance().trusted_pending, 50_000);
        assert_eq!(h.wallet.snapshot().status, WalletStatus::Ready);

        h.chain.mine_block();
        h.wallet.sync().await?;
        let b = h.wallet.balance();
        assert_eq!((b.confirmed, b.trusted_pending), (50_000, 0));
        Ok(())
    }

    #[tokio::test]
    async fn never_hands_out_a_used_address() -> eyre::Result<()> {
        let h = harness().await?;
        let first = h.wallet.get_new_address().await?;
        assert_eq!(h.wallet.get_last_unused_address().await?, first);
        h.chain.fund(&first.script_pubkey(), 10_000);
        h.wallet.sync().await?;

        let second = h.wallet.get_last_unused_address().await?;
        assert_ne!(first, second);
        assert_ne!(h.wallet.get_new_address().await?, second);
        assert!(h.wallet.is_mine(&first).await?);
        Ok(())
    }

    #[tokio::test]
    async fn receive_index_survives_reload() -> eyre::Result<()> {
        let h = harness().await?;
        h.wallet.get_new_address().await?;
        let second = h.wallet.get_new_address().await?;
        let reloaded = DescriptorSpendingWallet::load(
            h.wallet.keyset().clone(),
            None,
            Arc::clone(&h.chain) as Arc<dyn ChainDataProvider>,
            h.store.clone(),
            Arc::new(ClockFake::default()),
            5,
        )
        .await?;
        assert_ne!(reloaded.get_new_address().await?, second);
        Ok(())
    }

    #[tokio::test]
    async fn spends_with_app_and_hardware_signatures() -> eyre::Result<()> {
        let h = harness().await?;
        let addr = h.wallet.get_new_address().await?;
        h.chain.fund(&addr.script_pubkey(), 100_000);
        h.chain.mine_block();
        h.wallet.sync().await?;

        let dest = foreign_address()?;
        let psbt = h
            .wallet
            .create_psbt(&dest, SendAmount::Exact(40_000), FeePolicy::Rate(2))
            .await?;
        assert_eq!(psbt.num_inputs, 1);
        assert!(psbt.fee_sats > 0);
        assert!(!psbt.has_signature_from(&h.wallet.keyset().app_key)?);

        let signed = h.wallet.sign_psbt(&psbt).await?;
        assert!(signed.has_signature_from(&h.wallet.keyset().app_key)?);
        // Signing again keeps the signature.
        let again = h.wallet.sign_psbt(&signed).await?;
        assert_eq!(again.min_signatures()?, 1);

        let mut inner = again.to_inner()?;
        inner
            .sign(&h.hw_master.xprv, &Secp256k1::new())
            .map_err(|(_, e)| eyre::eyre!("hw signing failed: {e:?}"))?;
        let both = again.with_payload(&inner)?;
        let tx = both.finalize()?;
        h.chain.broadcast(&tx).await?;

        h.wallet.sync().await?;
        let b = h.wallet.balance();
        assert_eq!(
            b.spendable,
            100_000 - 40_000 - i64::try_from(psbt.fee_sats)?
        );
        Ok(())
    }

    #[tokio::test]
    async fn reports_insufficient_funds() -> eyre::Result<()> {
        let h = harness().await?;
        let addr = h.wallet.get_new_address().await?;
        h.chain.fund(&addr.script_pubkey(), 5_000);
        h.wallet.sync().await?;
        let res = h
            .wallet
            .create_psbt(&addr, SendAmount::Exact(9_000), FeePolicy::Rate(1))
            .await;
        assert!(matches!(res, Err(WalletError::InsufficientFunds { available: 5_000, .. })));
        Ok(())
    }

    #[tokio::test]
    async fn drains_the_wallet_without_change() -> eyre::Result<()> {
        let h = harness().await?;
        for _ in 0..2 {
            let addr = h.wallet.get_new_address().await?;
            h.chain.fund(&addr.script_pubkey(), 30_000);
        }
        h.wallet.sync().await?;
        let dest = foreign_address()?;
        let psbt = h
            .wallet
            .create_psbt(&dest, SendAmount::All, FeePolicy::Absolute(1_000))
            .await?;
        assert_eq!(psbt.num_inputs, 2);
        assert_eq!(psbt.amount_sats, 59_000);
        assert_eq!(psbt.fee_sats, 1_000);
        Ok(())
    }

    #[tokio::test]
    async fn failed_sync_keeps_the_last_snapshot() -> eyre::Result<()> {
        let h = harness().await?;
        let addr = h.wallet.get_new_address().await?;
        h.chain.fund(&addr.script_pubkey(), 20_000);
        h.wallet.sync().await?;
        h.chain.set_offline(true);
        assert!(matches!(h.wallet.sync().await, Err(WalletError::Networking(_))));
        let snap = h.wallet.snapshot();
        assert_eq!(snap.status, WalletStatus::Ready);
        assert_eq!(snap.balance_or_zero().trusted_pending, 20_000);
        Ok(())
    }

    #[tokio::test]
    async fn failed_index_write_leaves_coin_selection_alone() -> eyre::Result<()> {
        let td = tempfile::tempdir()?;
        let h = harness_with(SecureStore::open_file(td.path(), &[7_u8; 32])?).await?;
        h.wallet.initialize().await?;

        // Another device handed out the third receive address and it got paid.
        let other = DescriptorSpendingWallet::load(
            h.wallet.keyset.clone(),
            None,
            Arc::clone(&h.chain) as Arc<dyn ChainDataProvider>,
            SecureStore::in_memory(),
            Arc::new(ClockFake::default()),
            5,
        )
        .await?;
        other.get_new_address().await?;
        other.get_new_address().await?;
        let third = other.get_new_address().await?;
        h.chain.fund(&third.script_pubkey(), 30_000);
        h.chain.mine_block();

        // The sealed file for the receive index cannot be replaced.
        let key = receive_index_key(h.wallet.keyset.keyset_id());
        let blocker = td.path().join(hex::encode(crate::crypto::sha256(key.as_bytes())));
        std::fs::create_dir(&blocker)?;
        std::fs::write(blocker.join("occupied"), b"")?;

        assert!(matches!(h.wallet.sync().await, Err(WalletError::Storage(_))));
        {
            let st = h.wallet.state.lock().await;
            assert_eq!(st.receive_index, 0);
            assert!(st.utxos.is_empty(), "coin selection saw unpublished utxos");
            assert!(st.seen.is_empty(), "history changed without a snapshot");
        }
        assert_eq!(h.wallet.snapshot().balance_or_zero().confirmed, 0);

        std::fs::remove_dir_all(&blocker)?;
        h.wallet.sync().await?;
        assert_eq!(h.wallet.snapshot().balance_or_zero().confirmed, 30_000);
        assert_eq!(h.wallet.state.lock().await.receive_index, 3);
        Ok(())
    }
}
