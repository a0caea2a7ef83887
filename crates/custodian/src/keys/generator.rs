use super::{
    spending_origin_path, AppPrivateKeyDao, AuthKeypair, AuthPrivateKey, BitcoinNetworkType,
    DescriptorPublicKey, ExtendedPrivateKey, SpendingKeypair,
};
use crate::{
    errors::{ErrorCode, KeyDerivationError, StorageError},
    keybox::AppKeyBundle,
};
use bitcoin::{
    bip32::{Fingerprint, Xpriv, Xpub},
    secp256k1::{PublicKey, Secp256k1, SecretKey},
};
use secrecy::SecretString;
use thiserror::Error;
use zeroize::Zeroizing;

/// Fresh BIP39 mnemonic (24 words) and the master key derived from it.
pub fn generate_master_key(
    network: BitcoinNetworkType,
) -> Result<ExtendedPrivateKey, KeyDerivationError> {
    let mut entropy = Zeroizing::new([0_u8; 32]);
    crate::crypto::fill_random(entropy.as_mut_slice());
    let mnemonic = bip39::Mnemonic::from_entropy_in(bip39::Language::English, entropy.as_slice())
        .map_err(|e| KeyDerivationError::Mnemonic(e.to_string()))?;
    master_key_from_mnemonic(network, &mnemonic)
}

pub fn master_key_from_mnemonic(
    network: BitcoinNetworkType,
    mnemonic: &bip39::Mnemonic,
) -> Result<ExtendedPrivateKey, KeyDerivationError> {
    let seed = Zeroizing::new(mnemonic.to_seed_normalized(""));
    let xprv = Xpriv::new_master(network.network(), seed.as_slice())?;
    Ok(ExtendedPrivateKey {
        xprv,
        mnemonic: SecretString::new(mnemonic.to_string().into()),
    })
}

/// The account-level spending keypair at `m/84'/coin'/account'`.
pub fn spending_keypair_at(
    master: &ExtendedPrivateKey,
    network: BitcoinNetworkType,
    account: u32,
) -> Result<SpendingKeypair, KeyDerivationError> {
    let secp = Secp256k1::new();
    let origin_path = spending_origin_path(network, account)?;
    let account_xprv = master.xprv.derive_priv(&secp, &origin_path)?;
    Ok(SpendingKeypair {
        public_key: DescriptorPublicKey {
            origin_fingerprint: master.xprv.fingerprint(&secp),
            origin_path,
            xpub: Xpub::from_priv(&secp, &account_xprv),
        },
        private_key: master.clone(),
    })
}

pub fn generate_spending_keypair(
    network: BitcoinNetworkType,
) -> Result<SpendingKeypair, KeyDerivationError> {
    let master = generate_master_key(network)?;
    spending_keypair_at(&master, network, 0)
}

/// Next unused account index among `existing` keys derived from the master with
/// fingerprint `fingerprint` for `network`'s coin type: `0` when none match, else `max + 1`.
pub fn next_spending_account_index(
    fingerprint: Fingerprint,
    network: BitcoinNetworkType,
    existing: &[DescriptorPublicKey],
) -> u32 {
    existing
        .iter()
        .filter(|k| k.origin_fingerprint == fingerprint)
        .filter(|k| k.coin_type() == Some(network.coin_type()))
        .filter_map(DescriptorPublicKey::account_index)
        .max()
        .map_or(0, |max| max.saturating_add(1))
}

/// Derive the spending keypair for the next unused account of `master`.
///
/// Every entry of `existing_descriptor_keys` must parse; a malformed key is an error rather
/// than something to skip, since skipping it could hand out an index that is already in use.
pub fn derive_next_spending_key(
    master: &ExtendedPrivateKey,
    existing_descriptor_keys: &[String],
    network: BitcoinNetworkType,
) -> Result<SpendingKeypair, KeyDerivationError> {
    let existing = existing_descriptor_keys
        .iter()
        .map(|s| s.parse::<DescriptorPublicKey>())
        .collect::<Result<Vec<_>, _>>()?;
    let index = next_spending_account_index(master.fingerprint(), network, &existing);
    tracing::debug!(account_index = index, "deriving next spending key");
    spending_keypair_at(master, network, index)
}

pub fn generate_auth_keypair() -> Result<AuthKeypair, KeyDerivationError> {
    let mut raw = Zeroizing::new([0_u8; 32]);
    crate::crypto::fill_random(raw.as_mut_slice());
    let sk = SecretKey::from_slice(raw.as_slice())?;
    let public = PublicKey::from_secret_key(&Secp256k1::signing_only(), &sk);
    Ok(AuthKeypair {
        public_key: super::AuthPublicKey(public),
        private_key: AuthPrivateKey(sk),
    })
}

#[derive(Debug, Error)]
pub enum KeyBundleError {
    #[error(transparent)]
    Derivation(#[from] KeyDerivationError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ErrorCode for KeyBundleError {
    fn code(&self) -> &'static str {
        match self {
            Self::Derivation(e) => e.code(),
            Self::Storage(e) => e.code(),
        }
    }
}

/// Generates app-factor key bundles and files their private halves away.
#[derive(Debug, Clone)]
pub struct AppKeysGenerator {
    dao: AppPrivateKeyDao,
}

impl AppKeysGenerator {
    pub const fn new(dao: AppPrivateKeyDao) -> Self {
        Self { dao }
    }

    pub fn dao(&self) -> &AppPrivateKeyDao {
        &self.dao
    }

    /// Spending, global-auth and recovery-auth keys for a new app factor.
    pub async fn generate_key_bundle(
        &self,
        network: BitcoinNetworkType,
    ) -> Result<AppKeyBundle, KeyBundleError> {
        let spending = generate_spending_keypair(network)?;
        let auth = generate_auth_keypair()?;
        let recovery_auth = generate_auth_keypair()?;

        self.dao.store_spending_keypair(&spending).await?;
        self.dao.store_auth_keypair(&auth).await?;
        self.dao.store_auth_keypair(&recovery_auth).await?;

        let bundle = AppKeyBundle {
            local_id: uuid::Uuid::new_v4().to_string(),
            spending_key: spending.public_key,
            auth_key: auth.public_key,
            recovery_auth_key: Some(recovery_auth.public_key),
            network_type: network,
        };
        tracing::info!(local_id = %bundle.local_id, network = %network, "generated app key bundle");
        Ok(bundle)
    }

    /// Only the recovery-auth key, for accounts created before it existed.
    pub async fn generate_recovery_auth_key(&self) -> Result<AuthKeypair, KeyBundleError> {
        let kp = generate_auth_keypair()?;
        self.dao.store_auth_keypair(&kp).await?;
        Ok(kp)
    }
}
