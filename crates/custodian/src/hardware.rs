//! The hardware signing factor.
//!
//! Every call is one tap on the device: a request/response exchange that the user may cancel.
//! [`HardwareFake`] holds its keys in memory and answers immediately.

use crate::{
    cloud_backup::csek::{Csek, SealedCsek},
    crypto::{self, CryptoBox},
    errors::{ErrorCode, KeyDerivationError},
    keybox::HwKeyBundle,
    keys::{
        generator::{generate_master_key, spending_keypair_at},
        next_spending_account_index, AuthPrivateKey, AuthPublicKey, BitcoinNetworkType,
        DescriptorPublicKey, ExtendedPrivateKey,
    },
    spending::Psbt,
};
use async_trait::async_trait;
use bitcoin::{
    bip32::{ChildNumber, DerivationPath},
    secp256k1::Secp256k1,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use zeroize::Zeroizing;

/// Hardware auth key path, `m/87497287'/0'`.
const AUTH_KEY_PURPOSE: u32 = 87_497_287;
const CSEK_SEAL_AAD: &[u8] = b"custodian:csek";

/// An access token signed by the hardware auth key. Required by the server for any call that
/// changes who can move funds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwFactorProofOfPossession {
    pub hw_signed_token: String,
}

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("hardware session canceled by the user")]
    Canceled,

    #[error("hardware session failed: {0}")]
    Session(String),

    #[error(transparent)]
    KeyDerivation(#[from] KeyDerivationError),

    #[error("hardware signing failed: {0}")]
    Signing(String),

    #[error("hardware could not unseal key: {0}")]
    Unseal(String),
}

impl ErrorCode for HardwareError {
    fn code(&self) -> &'static str {
        match self {
            Self::Canceled => "hardware_canceled",
            Self::Session(_) => "hardware_session_failed",
            Self::KeyDerivation(e) => e.code(),
            Self::Signing(_) => "hardware_signing_failed",
            Self::Unseal(_) => "hardware_unseal_failed",
        }
    }
}

#[async_trait]
pub trait HardwareFactor: Send + Sync + std::fmt::Debug {
    async fn auth_public_key(&self) -> Result<AuthPublicKey, HardwareError>;

    /// Next unused spending key given every descriptor key the account already used.
    async fn derive_spending_key(
        &self,
        network: BitcoinNetworkType,
        existing_descriptor_keys: &[DescriptorPublicKey],
    ) -> Result<DescriptorPublicKey, HardwareError>;

    /// Hex DER signature over SHA-256(`challenge`) with the hardware auth key.
    async fn sign_challenge(&self, challenge: &[u8]) -> Result<String, HardwareError>;

    async fn proof_of_possession(
        &self,
        access_token: &str,
    ) -> Result<HwFactorProofOfPossession, HardwareError>;

    /// Add the hardware signature to every input it holds a key for.
    async fn sign_psbt(&self, psbt: &Psbt) -> Result<Psbt, HardwareError>;

    async fn seal_csek(&self, csek: &Csek) -> Result<SealedCsek, HardwareError>;

    async fn unseal_csek(&self, sealed: &SealedCsek) -> Result<Csek, HardwareError>;
}

/// Pair a device: read its auth key and derive its next spending key.
pub async fn pair_hardware(
    hardware: &dyn HardwareFactor,
    network: BitcoinNetworkType,
    existing_descriptor_keys: &[DescriptorPublicKey],
) -> Result<HwKeyBundle, HardwareError> {
    let auth_key = hardware.auth_public_key().await?;
    let spending_key = hardware
        .derive_spending_key(network, existing_descriptor_keys)
        .await?;
    tracing::info!(
        hw_auth_key = %auth_key,
        account_index = ?spending_key.account_index(),
        "paired hardware"
    );
    Ok(HwKeyBundle {
        local_id: uuid::Uuid::new_v4().to_string(),
        spending_key,
        auth_key,
        network_type: network,
    })
}

/// Software stand-in for the device.
#[derive(Debug)]
pub struct HardwareFake {
    master: ExtendedPrivateKey,
    auth_key: AuthPrivateKey,
    seal_key: Zeroizing<[u8; 32]>,
    /// Countdown to a canceled tap; 0 means none is scheduled.
    cancel_at: AtomicU32,
    /// Countdown to a tap the user never answers.
    stall_at: AtomicU32,
}

/// Tick a countdown, reporting whether this call is the scheduled one.
fn countdown_hits(slot: &AtomicU32) -> bool {
    slot.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .unwrap_or(0)
        == 1
}

impl HardwareFake {
    pub fn new(network: BitcoinNetworkType) -> Result<Self, HardwareError> {
        let secp = Secp256k1::new();
        let master = generate_master_key(network)?;
        let auth_path = DerivationPath::from(vec![
            ChildNumber::from_hardened_idx(AUTH_KEY_PURPOSE).map_err(KeyDerivationError::from)?,
            ChildNumber::from_hardened_idx(0).map_err(KeyDerivationError::from)?,
        ]);
        let auth_xprv = master
            .xprv
            .derive_priv(&secp, &auth_path)
            .map_err(KeyDerivationError::from)?;
        let seal_key = crypto::derive_subkey(
            &master.xprv.private_key.secret_bytes(),
            "hardware",
            "csek-seal",
        )
        .map_err(|e| HardwareError::Session(e.to_string()))?;
        Ok(Self {
            master,
            auth_key: AuthPrivateKey(auth_xprv.private_key),
            seal_key: Zeroizing::new(seal_key),
            cancel_at: AtomicU32::new(0),
            stall_at: AtomicU32::new(0),
        })
    }

    /// The user cancels the next tap.
    pub fn cancel_next(&self) {
        self.cancel_after(0);
    }

    /// Let `taps` taps through, then the user cancels the one after.
    pub fn cancel_after(&self, taps: u32) {
        self.cancel_at.store(taps.saturating_add(1), Ordering::SeqCst);
    }

    /// Let `taps` taps through, then leave the next one pending until its caller gives up.
    pub fn stall_after(&self, taps: u32) {
        self.stall_at.store(taps.saturating_add(1), Ordering::SeqCst);
    }

    async fn tap(&self) -> Result<(), HardwareError> {
        if countdown_hits(&self.stall_at) {
            std::future::pending::<()>().await;
        }
        if countdown_hits(&self.cancel_at) {
            return Err(HardwareError::Canceled);
        }
        Ok(())
    }
}

#[async_trait]
impl HardwareFactor for HardwareFake {
    async fn auth_public_key(&self) -> Result<AuthPublicKey, HardwareError> {
        self.tap().await?;
        Ok(self.auth_key.public_key())
    }

    async fn derive_spending_key(
        &self,
        network: BitcoinNetworkType,
        existing_descriptor_keys: &[DescriptorPublicKey],
    ) -> Result<DescriptorPublicKey, HardwareError> {
        self.tap().await?;
        let index = next_spending_account_index(
            self.master.fingerprint(),
            network,
            existing_descriptor_keys,
        );
        Ok(spending_keypair_at(&self.master, network, index)?.public_key)
    }

    async fn sign_challenge(&self, challenge: &[u8]) -> Result<String, HardwareError> {
        self.tap().await?;
        Ok(self.auth_key.sign(challenge))
    }

    async fn proof_of_possession(
        &self,
        access_token: &str,
    ) -> Result<HwFactorProofOfPossession, HardwareError> {
        self.tap().await?;
        Ok(HwFactorProofOfPossession {
            hw_signed_token: self.auth_key.sign(access_token.as_bytes()),
        })
    }

    async fn sign_psbt(&self, psbt: &Psbt) -> Result<Psbt, HardwareError> {
        self.tap().await?;
        let mut inner = psbt
            .to_inner()
            .map_err(|e| HardwareError::Signing(e.to_string()))?;
        inner
            .sign(&self.master.xprv, &Secp256k1::new())
            .map_err(|(_, errors)| {
                HardwareError::Signing(format!("{} inputs failed to sign", errors.len()))
            })?;
        psbt.with_payload(&inner)
            .map_err(|e| HardwareError::Signing(e.to_string()))
    }

    async fn seal_csek(&self, csek: &Csek) -> Result<SealedCsek, HardwareError> {
        self.tap().await?;
        let boxed = crypto::seal(&self.seal_key, csek.as_bytes(), CSEK_SEAL_AAD)
            .map_err(|e| HardwareError::Session(e.to_string()))?;
        let json = serde_json::to_vec(&boxed).map_err(|e| HardwareError::Session(e.to_string()))?;
        Ok(SealedCsek(hex::encode(json)))
    }

    async fn unseal_csek(&self, sealed: &SealedCsek) -> Result<Csek, HardwareError> {
        self.tap().await?;
        let json = hex::decode(&sealed.0).map_err(|e| HardwareError::Unseal(e.to_string()))?;
        let boxed: CryptoBox =
            serde_json::from_slice(&json).map_err(|e| HardwareError::Unseal(e.to_string()))?;
        let plain = Zeroizing::new(
            crypto::open(&self.seal_key, &boxed, CSEK_SEAL_AAD)
                .map_err(|e| HardwareError::Unseal(e.to_string()))?,
        );
        let bytes: [u8; 32] = plain
            .as_slice()
            .try_into()
            .map_err(|_e| HardwareError::Unseal("sealed key has the wrong length".to_owned()))?;
        Ok(Csek::from_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NET: BitcoinNetworkType = BitcoinNetworkType::Regtest;

    #[tokio::test]
    async fn seals_and_unseals_only_its_own_keys() -> eyre::Result<()> {
        let hw = HardwareFake::new(NET)?;
        let other = HardwareFake::new(NET)?;
        let csek = Csek::generate();
        let sealed = hw.seal_csek(&csek).await?;
        assert_eq!(hw.unseal_csek(&sealed).await?, csek);
        assert!(matches!(
            other.unseal_csek(&sealed).await,
            Err(HardwareError::Unseal(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn spending_keys_advance_past_existing_ones() -> eyre::Result<()> {
        let hw = HardwareFake::new(NET)?;
        let first = hw.derive_spending_key(NET, &[]).await?;
        assert_eq!(first.account_index(), Some(0));
        let second = hw.derive_spending_key(NET, &[first.clone()]).await?;
        assert_eq!(second.account_index(), Some(1));
        assert_eq!(second.origin_fingerprint, first.origin_fingerprint);
        Ok(())
    }

    #[tokio::test]
    async fn canceled_tap_fails_once() -> eyre::Result<()> {
        let hw = HardwareFake::new(NET)?;
        hw.cancel_next();
        assert!(matches!(
            hw.auth_public_key().await,
            Err(HardwareError::Canceled)
        ));
        let key = hw.auth_public_key().await?;
        let sig = hw.sign_challenge(b"nonce").await?;
        assert!(key.verify(b"nonce", &sig));

        hw.cancel_after(1);
        hw.auth_public_key().await?;
        assert!(matches!(
            hw.sign_challenge(b"nonce").await,
            Err(HardwareError::Canceled)
        ));
        hw.auth_public_key().await?;
        Ok(())
    }

    #[tokio::test]
    async fn stalled_tap_waits_until_abandoned() -> eyre::Result<()> {
        let hw = HardwareFake::new(NET)?;
        hw.stall_after(1);
        hw.auth_public_key().await?;
        let stalled =
            tokio::time::timeout(std::time::Duration::from_millis(20), hw.sign_challenge(b"n")).await;
        assert!(stalled.is_err(), "stalled tap answered");
        hw.sign_challenge(b"n").await?;
        Ok(())
    }

    #[tokio::test]
    async fn pairing_builds_a_bundle() -> eyre::Result<()> {
        let hw = HardwareFake::new(NET)?;
        let bundle = pair_hardware(&hw, NET, &[]).await?;
        assert_eq!(bundle.auth_key, hw.auth_public_key().await?);
        assert_eq!(bundle.spending_key.account_index(), Some(0));
        Ok(())
    }
}
