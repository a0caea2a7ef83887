use super::{ChainBlockTime, ChainDataProvider, ChainError, ChainTransaction, ChainTxInput, ChainTxOutput};
use async_trait::async_trait;
use bitcoin::{
    absolute::LockTime, script::Builder, transaction::Version, Amount, OutPoint, ScriptBuf,
    Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, PoisonError},
};

const GENESIS_HEIGHT: u32 = 400;
const GENESIS_TIME: i64 = 1_704_067_200;
const BLOCK_INTERVAL_SECS: i64 = 600;

#[derive(Debug)]
struct ChainState {
    txs: Vec<ChainTransaction>,
    outputs: HashMap<OutPoint, ChainTxOutput>,
    spent: HashSet<OutPoint>,
    height: u32,
    funding_counter: i64,
    fee_rate: u64,
    offline: bool,
    reject_next_broadcasts: u32,
}

/// In-process chain: fund scripts, broadcast real transactions, mine blocks.
///
/// Broadcasts are validated against the fake's UTXO set, so double spends and spends of
/// unknown outputs are rejected the way a node would.
#[derive(Debug)]
pub struct BlockchainFake {
    state: Mutex<ChainState>,
}

impl Default for BlockchainFake {
    fn default() -> Self {
        Self {
            state: Mutex::new(ChainState {
                txs: vec![],
                outputs: HashMap::new(),
                spent: HashSet::new(),
                height: GENESIS_HEIGHT,
                funding_counter: 0,
                fee_rate: 2,
                offline: false,
                reject_next_broadcasts: 0,
            }),
        }
    }
}

impl BlockchainFake {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pay `sats` to `script_pubkey` from outside the wallet. Pending until [`Self::mine_block`].
    pub fn fund(&self, script_pubkey: &ScriptBuf, sats: u64) -> OutPoint {
        let mut st = self.lock();
        st.funding_counter += 1;
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: Builder::new().push_int(st.funding_counter).into_script(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(sats),
                script_pubkey: script_pubkey.clone(),
            }],
        };
        let txid = tx.compute_txid();
        let output = ChainTxOutput {
            script_pubkey: script_pubkey.clone(),
            value_sats: sats,
        };
        let outpoint = OutPoint { txid, vout: 0 };
        st.outputs.insert(outpoint, output.clone());
        st.txs.push(ChainTransaction {
            txid,
            inputs: vec![],
            outputs: vec![output],
            fee_sats: None,
            weight: Some(tx.weight().to_wu()),
            confirmed: None,
        });
        outpoint
    }

    /// Confirm everything pending in a new block.
    pub fn mine_block(&self) -> ChainBlockTime {
        let mut st = self.lock();
        st.height += 1;
        let block = ChainBlockTime {
            height: st.height,
            timestamp: GENESIS_TIME + i64::from(st.height - GENESIS_HEIGHT) * BLOCK_INTERVAL_SECS,
        };
        for tx in &mut st.txs {
            if tx.confirmed.is_none() {
                tx.confirmed = Some(block);
            }
        }
        block
    }

    /// While offline every call fails with a networking error.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn reject_next_broadcasts(&self, n: u32) {
        self.lock().reject_next_broadcasts = n;
    }

    pub fn set_fee_rate(&self, sats_per_vb: u64) {
        self.lock().fee_rate = sats_per_vb;
    }

    pub fn transaction(&self, txid: &Txid) -> Option<ChainTransaction> {
        self.lock().txs.iter().find(|t| t.txid == *txid).cloned()
    }

    /// Unspent value currently paying `script_pubkey`, pending or confirmed.
    pub fn unspent_value(&self, script_pubkey: &ScriptBuf) -> u64 {
        let st = self.lock();
        st.outputs
            .iter()
            .filter(|(op, out)| out.script_pubkey == *script_pubkey && !st.spent.contains(*op))
            .map(|(_, out)| out.value_sats)
            .sum()
    }

    fn check_online(st: &ChainState) -> Result<(), ChainError> {
        if st.offline {
            return Err(ChainError::Networking("fake chain is offline".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainDataProvider for BlockchainFake {
    async fn script_history(
        &self,
        script_pubkey: &ScriptBuf,
    ) -> Result<Vec<ChainTransaction>, ChainError> {
        let st = self.lock();
        Self::check_online(&st)?;
        Ok(st
            .txs
            .iter()
            .filter(|tx| {
                tx.outputs.iter().any(|o| o.script_pubkey == *script_pubkey)
                    || tx.inputs.iter().any(|i| {
                        i.prevout
                            .as_ref()
                            .is_some_and(|p| p.script_pubkey == *script_pubkey)
                    })
            })
            .cloned()
            .collect())
    }

    async fn tip_height(&self) -> Result<u32, ChainError> {
        let st = self.lock();
        Self::check_online(&st)?;
        Ok(st.height)
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        let mut st = self.lock();
        Self::check_online(&st)?;
        if st.reject_next_broadcasts > 0 {
            st.reject_next_broadcasts -= 1;
            return Err(ChainError::Rejected("broadcast rejected by fake".to_owned()));
        }

        let mut inputs = Vec::with_capacity(tx.input.len());
        let mut in_sum = 0_u64;
        for txin in &tx.input {
            let op = txin.previous_output;
            let prev = st
                .outputs
                .get(&op)
                .cloned()
                .ok_or_else(|| ChainError::Rejected(format!("missing input {op}")))?;
            if st.spent.contains(&op) {
                return Err(ChainError::Rejected(format!("input {op} already spent")));
            }
            if txin.witness.is_empty() {
                return Err(ChainError::Rejected(format!("input {op} is not signed")));
            }
            in_sum = in_sum.saturating_add(prev.value_sats);
            inputs.push(ChainTxInput {
                previous_output: op,
                prevout: Some(prev),
            });
        }
        let out_sum: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
        let fee = in_sum
            .checked_sub(out_sum)
            .ok_or_else(|| ChainError::Rejected("outputs exceed inputs".to_owned()))?;

        let txid = tx.compute_txid();
        for i in &inputs {
            st.spent.insert(i.previous_output);
        }
        let outputs: Vec<ChainTxOutput> = tx
            .output
            .iter()
            .map(|o| ChainTxOutput {
                script_pubkey: o.script_pubkey.clone(),
                value_sats: o.value.to_sat(),
            })
            .collect();
        for (vout, out) in (0_u32..).zip(outputs.iter()) {
            st.outputs.insert(OutPoint { txid, vout }, out.clone());
        }
        st.txs.push(ChainTransaction {
            txid,
            inputs,
            outputs,
            fee_sats: Some(fee),
            weight: Some(tx.weight().to_wu()),
            confirmed: None,
        });
        tracing::debug!(%txid, fee, "fake chain accepted broadcast");
        Ok(txid)
    }

    async fn fee_rate_sats_per_vb(&self, _target_blocks: u16) -> Result<u64, ChainError> {
        let st = self.lock();
        Self::check_online(&st)?;
        Ok(st.fee_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn funding_shows_up_pending_then_confirmed() -> eyre::Result<()> {
        let chain = BlockchainFake::new();
        let script = ScriptBuf::from_bytes(vec![0x00, 0x14, 0xaa]);
        let op = chain.fund(&script, 50_000);

        let hist = chain.script_history(&script).await?;
        assert_eq!(hist.len(), 1);
        assert!(hist.iter().all(|t| t.confirmed.is_none()));
        assert_eq!(chain.unspent_value(&script), 50_000);

        let block = chain.mine_block();
        let confirmed = chain
            .transaction(&op.txid)
            .and_then(|t| t.confirmed)
            .ok_or_else(|| eyre::eyre!("funding tx not confirmed"))?;
        assert_eq!(confirmed, block);
        Ok(())
    }

    #[tokio::test]
    async fn offline_chain_reports_networking_errors() {
        let chain = BlockchainFake::new();
        chain.set_offline(true);
        assert!(matches!(
            chain.tip_height().await,
            Err(ChainError::Networking(_))
        ));
    }

    #[tokio::test]
    async fn broadcast_of_unknown_inputs_is_rejected() {
        let chain = BlockchainFake::new();
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::from_slice(&[vec![1_u8]]),
            }],
            output: vec![],
        };
        assert!(matches!(
            chain.broadcast(&tx).await,
            Err(ChainError::Rejected(_))
        ));
    }
}
