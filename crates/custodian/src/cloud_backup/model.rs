use super::csek::SealedCsek;
use crate::{
    config::F8eEnvironment,
    crypto::CryptoBox,
    keybox::{AppKeyBundle, FullAccountId, HwKeyBundle, SpendingKeyset},
    keys::{AuthKeypair, BitcoinNetworkType, SpendingKeypair},
    socrec::TrustedContact,
};
use serde::{Deserialize, Serialize};

/// Associated data binding the encrypted account keys to their purpose.
pub const FULL_ACCOUNT_KEYS_AAD: &[u8] = b"custodian:full-account-keys";

/// Everything needed to rebuild a full account's keybox, in plaintext. Only ever stored
/// encrypted under the CSEK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullAccountKeys {
    pub active_spending_keyset: SpendingKeyset,
    #[serde(default)]
    pub inactive_spending_keysets: Vec<SpendingKeyset>,
    pub active_app_key_bundle: AppKeyBundle,
    pub active_hw_key_bundle: HwKeyBundle,
    pub app_global_auth_keypair: AuthKeypair,
    /// App spending keys still held locally: the active one plus any retired ones that
    /// survived recovery.
    pub app_spending_keypairs: Vec<SpendingKeypair>,
}

/// The encrypted half of a full account backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullAccountFields {
    pub sealed_hw_encryption_key: SealedCsek,
    pub hw_full_account_keys_ciphertext: CryptoBox,
    /// Trusted contacts at backup time. Public data only.
    #[serde(default)]
    pub trusted_contacts: Vec<TrustedContact>,
    pub is_fake_hardware: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudBackupV2 {
    pub account_id: FullAccountId,
    pub f8e_environment: F8eEnvironment,
    pub is_test_account: bool,
    pub trusted_contact_identity_keypair: AuthKeypair,
    pub full_account_fields: FullAccountFields,
    pub app_recovery_auth_keypair: AuthKeypair,
    pub is_using_socrec_fakes: bool,
    pub bitcoin_network_type: BitcoinNetworkType,
}

/// A backup in any version this build understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudBackup {
    V2(CloudBackupV2),
}

impl CloudBackup {
    pub const fn version(&self) -> u32 {
        match self {
            Self::V2(_) => 2,
        }
    }

    pub const fn account_id(&self) -> &FullAccountId {
        match self {
            Self::V2(b) => &b.account_id,
        }
    }

    pub const fn sealed_csek(&self) -> &SealedCsek {
        match self {
            Self::V2(b) => &b.full_account_fields.sealed_hw_encryption_key,
        }
    }
}
