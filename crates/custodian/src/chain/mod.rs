//! Chain data and broadcast, seen as an opaque, eventually consistent service.

pub mod esplora;
pub mod fake;

pub use esplora::EsploraClient;
pub use fake::BlockchainFake;

use crate::errors::ErrorCode;
use async_trait::async_trait;
use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChainBlockTime {
    pub height: u32,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTxInput {
    pub previous_output: OutPoint,
    /// Script and value of the output being spent, when the provider knows them.
    pub prevout: Option<ChainTxOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTxOutput {
    pub script_pubkey: ScriptBuf,
    pub value_sats: u64,
}

/// A transaction as reported by the chain-data provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTransaction {
    pub txid: Txid,
    pub inputs: Vec<ChainTxInput>,
    pub outputs: Vec<ChainTxOutput>,
    pub fee_sats: Option<u64>,
    pub weight: Option<u64>,
    pub confirmed: Option<ChainBlockTime>,
}

impl ChainTransaction {
    pub fn vsize(&self) -> Option<u64> {
        self.weight.map(|w| w.div_ceil(4))
    }
}

#[derive(Debug, Error)]
pub enum ChainError {
    /// Connectivity problem or timeout. Worth retrying.
    #[error("chain data provider unreachable: {0}")]
    Networking(String),

    /// The provider understood the request and refused it (e.g. an invalid transaction).
    #[error("chain data provider rejected request: {0}")]
    Rejected(String),

    #[error("unexpected response from chain data provider: {0}")]
    Decode(String),

    #[error("no chain data endpoints configured")]
    NoEndpoints,
}

impl ChainError {
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Networking(_) | Self::Decode(_))
    }
}

impl ErrorCode for ChainError {
    fn code(&self) -> &'static str {
        match self {
            Self::Networking(_) => "chain_networking",
            Self::Rejected(_) => "chain_rejected",
            Self::Decode(_) => "chain_decode",
            Self::NoEndpoints => "chain_no_endpoints",
        }
    }
}

impl From<crate::retry::RetryError<Self>> for ChainError {
    fn from(e: crate::retry::RetryError<Self>) -> Self {
        match e {
            crate::retry::RetryError::NoEndpoints => Self::NoEndpoints,
            crate::retry::RetryError::Exhausted(inner) => inner,
        }
    }
}

#[async_trait]
pub trait ChainDataProvider: Send + Sync + std::fmt::Debug {
    /// Every transaction touching `script_pubkey`, confirmed and unconfirmed.
    async fn script_history(&self, script_pubkey: &ScriptBuf)
        -> Result<Vec<ChainTransaction>, ChainError>;

    async fn tip_height(&self) -> Result<u32, ChainError>;

    async fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError>;

    /// Fee rate expected to confirm within `target_blocks`.
    async fn fee_rate_sats_per_vb(&self, target_blocks: u16) -> Result<u64, ChainError>;
}
