//! Moves what is left in retired keysets into the active one after a recovery.
//!
//! One pass: generate a drain PSBT per funded inactive keyset, let the user confirm the fee,
//! collect hardware signatures for the whole set, then co-sign and broadcast. A failure
//! anywhere ends the pass; retrying starts over from generation, which re-reads balances and so
//! never double-spends what already went out.

use crate::{
    chain::{ChainDataProvider, ChainError},
    errors::ErrorCode,
    f8e::{F8eError, KeysetService, NoClientErrorCode},
    hardware::{HardwareError, HardwareFactor},
    keybox::{ActiveKeyboxRepository, Keybox, SpendingKeyset},
    spending::{
        descriptor::REQUIRED_SIGNATURES, FeePolicy, Psbt, PsbtError, SendAmount,
        SpendingWalletProvider, WalletError,
    },
};
use bitcoin::{Address, Txid};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("there is no active keybox to sweep into")]
    NoActiveKeybox,

    #[error("sweep targets keyset {prepared}, but the active keyset is now {active}")]
    StaleDestination { prepared: String, active: String },

    #[error("psbt {0} still lacks a factor signature after hardware signing")]
    Unsigned(Txid),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Server(#[from] F8eError<NoClientErrorCode>),

    #[error(transparent)]
    Psbt(#[from] PsbtError),

    #[error(transparent)]
    Broadcast(#[from] ChainError),
}

impl ErrorCode for SweepError {
    fn code(&self) -> &'static str {
        match self {
            Self::NoActiveKeybox => "sweep_no_active_keybox",
            Self::StaleDestination { .. } => "sweep_stale_destination",
            Self::Unsigned(_) => "sweep_unsigned_psbt",
            Self::Wallet(e) => e.code(),
            Self::Hardware(e) => e.code(),
            Self::Server(e) => e.code(),
            Self::Psbt(e) => e.code(),
            Self::Broadcast(e) => e.code(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPsbt {
    pub source_keyset: SpendingKeyset,
    pub psbt: Psbt,
}

/// Generated sweeps awaiting the user's confirmation of the total fee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSweep {
    pub destination_keyset_id: String,
    pub destination: Address,
    pub sweeps: Vec<SweepPsbt>,
}

impl PreparedSweep {
    pub fn total_fee_sats(&self) -> u64 {
        self.sweeps.iter().map(|s| s.psbt.fee_sats).sum()
    }

    pub fn total_transfer_sats(&self) -> u64 {
        self.sweeps.iter().map(|s| s.psbt.amount_sats).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepState {
    Idle,
    GeneratingPsbts,
    /// Nothing to move. Terminal.
    NoFundsFound,
    GeneratePsbtsFailed { code: &'static str },
    PsbtsGenerated(PreparedSweep),
    AwaitingHardwareSignedSweeps(PreparedSweep),
    SigningAndBroadcastingSweeps,
    SweepFailed { code: &'static str },
    SweepComplete { txids: Vec<Txid> },
}

impl SweepState {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::GeneratingPsbts => "generating_psbts",
            Self::NoFundsFound => "no_funds_found",
            Self::GeneratePsbtsFailed { .. } => "generate_psbts_failed",
            Self::PsbtsGenerated(_) => "psbts_generated",
            Self::AwaitingHardwareSignedSweeps(_) => "awaiting_hardware_signed_sweeps",
            Self::SigningAndBroadcastingSweeps => "signing_and_broadcasting_sweeps",
            Self::SweepFailed { .. } => "sweep_failed",
            Self::SweepComplete { .. } => "sweep_complete",
        }
    }
}

/// Sweeps always target the keybox that is active when each step runs, never a caller's copy.
#[derive(Debug)]
pub struct SweepService {
    keyboxes: Arc<ActiveKeyboxRepository>,
    wallets: Arc<dyn SpendingWalletProvider>,
    keysets: Arc<dyn KeysetService>,
    chain: Arc<dyn ChainDataProvider>,
    fee_policy: FeePolicy,
    state: watch::Sender<SweepState>,
    run_lock: Mutex<()>,
}

impl SweepService {
    pub fn new(
        keyboxes: Arc<ActiveKeyboxRepository>,
        wallets: Arc<dyn SpendingWalletProvider>,
        keysets: Arc<dyn KeysetService>,
        chain: Arc<dyn ChainDataProvider>,
        fee_policy: FeePolicy,
    ) -> Self {
        let (state, _rx) = watch::channel(SweepState::Idle);
        Self {
            keyboxes,
            wallets,
            keysets,
            chain,
            fee_policy,
            state,
            run_lock: Mutex::new(()),
        }
    }

    pub fn state(&self) -> SweepState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SweepState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SweepState) {
        tracing::info!(from = self.state.borrow().name(), to = next.name(), "sweep stage");
        self.state.send_replace(next);
    }

    fn active_keybox(&self) -> Result<Keybox, SweepError> {
        self.keyboxes.active().ok_or(SweepError::NoActiveKeybox)
    }

    /// Start (or restart) a sweep of the active keybox. `None` when no inactive keyset holds
    /// spendable funds.
    pub async fn prepare(&self) -> Result<Option<PreparedSweep>, SweepError> {
        let _run = self.run_lock.lock().await;
        self.transition(SweepState::GeneratingPsbts);
        let generated = match self.active_keybox() {
            Ok(keybox) => self.generate(&keybox).await,
            Err(e) => Err(e),
        };
        match generated {
            Ok(None) => {
                self.transition(SweepState::NoFundsFound);
                Ok(None)
            }
            Ok(Some(prepared)) => {
                tracing::info!(
                    sweeps = prepared.sweeps.len(),
                    total_fee_sats = prepared.total_fee_sats(),
                    total_transfer_sats = prepared.total_transfer_sats(),
                    "sweep psbts generated"
                );
                self.transition(SweepState::PsbtsGenerated(prepared.clone()));
                Ok(Some(prepared))
            }
            Err(e) => {
                tracing::warn!(code = e.code(), error = %e, "sweep generation failed");
                self.transition(SweepState::GeneratePsbtsFailed { code: e.code() });
                Err(e)
            }
        }
    }

    async fn generate(&self, keybox: &Keybox) -> Result<Option<PreparedSweep>, SweepError> {
        let active = &keybox.active_spending_keyset;
        let destination = self
            .wallets
            .wallet_for(active)
            .await?
            .get_last_unused_address()
            .await?;

        let mut sweeps = Vec::new();
        for keyset in &keybox.inactive_keysets {
            if keyset.keyset_id() == active.keyset_id() {
                continue;
            }
            let wallet = self.wallets.wallet_for(keyset).await?;
            wallet.initialize().await?;
            wallet.sync().await?;
            let spendable = wallet.balance().spendable;
            if spendable <= 0 {
                tracing::debug!(keyset_id = keyset.keyset_id(), "inactive keyset is empty");
                continue;
            }
            let psbt = match wallet
                .create_psbt(&destination, SendAmount::All, self.fee_policy)
                .await
            {
                Ok(psbt) => psbt,
                Err(WalletError::DustAmount(_) | WalletError::InsufficientFunds { .. }) => {
                    tracing::warn!(
                        keyset_id = keyset.keyset_id(),
                        spendable,
                        "balance does not cover the sweep fee, leaving it"
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let psbt = if wallet.can_sign() {
                wallet.sign_psbt(&psbt).await?
            } else {
                psbt
            };
            sweeps.push(SweepPsbt {
                source_keyset: keyset.clone(),
                psbt,
            });
        }

        Ok((!sweeps.is_empty()).then(|| PreparedSweep {
            destination_keyset_id: active.keyset_id().to_owned(),
            destination,
            sweeps,
        }))
    }

    /// Sign and broadcast a sweep the user confirmed. Every PSBT gets its hardware signature
    /// before anything is broadcast.
    pub async fn execute(
        &self,
        prepared: &PreparedSweep,
        hardware: &dyn HardwareFactor,
    ) -> Result<Vec<Txid>, SweepError> {
        let _run = self.run_lock.lock().await;
        let keybox = self.active_keybox()?;
        let active = keybox.active_spending_keyset.keyset_id();
        if prepared.destination_keyset_id != active {
            return Err(SweepError::StaleDestination {
                prepared: prepared.destination_keyset_id.clone(),
                active: active.to_owned(),
            });
        }

        self.transition(SweepState::AwaitingHardwareSignedSweeps(prepared.clone()));
        match self.sign_and_broadcast(&keybox, prepared, hardware).await {
            Ok(txids) => {
                self.transition(SweepState::SweepComplete {
                    txids: txids.clone(),
                });
                Ok(txids)
            }
            Err(e) => {
                tracing::warn!(code = e.code(), error = %e, "sweep failed");
                self.transition(SweepState::SweepFailed { code: e.code() });
                Err(e)
            }
        }
    }

    async fn sign_and_broadcast(
        &self,
        keybox: &Keybox,
        prepared: &PreparedSweep,
        hardware: &dyn HardwareFactor,
    ) -> Result<Vec<Txid>, SweepError> {
        let mut hw_signed = Vec::with_capacity(prepared.sweeps.len());
        for sweep in &prepared.sweeps {
            let psbt = if sweep.psbt.has_signature_from(&sweep.source_keyset.app_key)? {
                sweep.psbt.clone()
            } else {
                hardware.sign_psbt(&sweep.psbt).await?
            };
            if psbt.min_signatures()? == 0 {
                return Err(SweepError::Unsigned(psbt.id));
            }
            hw_signed.push((&sweep.source_keyset, psbt));
        }

        self.transition(SweepState::SigningAndBroadcastingSweeps);
        let mut txids = Vec::with_capacity(hw_signed.len());
        for (keyset, psbt) in hw_signed {
            let psbt = if psbt.min_signatures()? < REQUIRED_SIGNATURES {
                self.keysets
                    .sign_psbt(&keybox.full_account_id, keyset.keyset_id(), &psbt)
                    .await?
            } else {
                psbt
            };
            let tx = psbt.finalize()?;
            let txid = self.chain.broadcast(&tx).await?;
            tracing::info!(
                keyset_id = keyset.keyset_id(),
                txid = %txid,
                amount_sats = psbt.amount_sats,
                fee_sats = psbt.fee_sats,
                "broadcast sweep"
            );
            txids.push(txid);
        }
        Ok(txids)
    }

    /// Prepare and execute in one go, for callers that do not ask for confirmation.
    pub async fn run(&self, hardware: &dyn HardwareFactor) -> Result<Vec<Txid>, SweepError> {
        match self.prepare().await? {
            Some(prepared) => self.execute(&prepared, hardware).await,
            None => Ok(vec![]),
        }
    }
}
