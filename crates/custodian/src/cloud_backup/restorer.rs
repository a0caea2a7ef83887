use super::{
    csek::CsekDao,
    model::{CloudBackup, CloudBackupV2, FullAccountKeys, FULL_ACCOUNT_KEYS_AAD},
};
use crate::{
    crypto,
    errors::{ErrorCode, StorageError},
    keybox::{Keybox, KeyboxConfig},
    keys::{AppPrivateKeyDao, AuthPublicKey},
    socrec::{SocRecKeysRepository, TrustedContact},
};
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum RestoreFromBackupError {
    /// The device has not unsealed this backup's CSEK yet.
    #[error("the backup encryption key is not available; unseal it with the hardware first")]
    CsekMissing,

    #[error("error decoding cloud backup: {0}")]
    AccountBackupDecoding(String),

    #[error("error storing {what}: {source}")]
    AccountBackupRestoration {
        what: &'static str,
        #[source]
        source: StorageError,
    },
}

impl ErrorCode for RestoreFromBackupError {
    fn code(&self) -> &'static str {
        match self {
            Self::CsekMissing => "csek_missing",
            Self::AccountBackupDecoding(_) => "account_backup_decoding_error",
            Self::AccountBackupRestoration { .. } => "account_backup_restoration_error",
        }
    }
}

/// Everything a restore produced. Committing it means activating `keybox`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRestoration {
    pub keybox: Keybox,
    pub app_global_auth_key: AuthPublicKey,
    pub app_recovery_auth_key: AuthPublicKey,
    pub trusted_contacts: Vec<TrustedContact>,
    pub cloud_backup: CloudBackup,
}

fn decoding(reason: impl Into<String>) -> RestoreFromBackupError {
    RestoreFromBackupError::AccountBackupDecoding(reason.into())
}

fn restoration(what: &'static str) -> impl FnOnce(StorageError) -> RestoreFromBackupError {
    move |source| RestoreFromBackupError::AccountBackupRestoration { what, source }
}

#[derive(Debug, Clone)]
pub struct FullAccountCloudBackupRestorer {
    private_keys: AppPrivateKeyDao,
    csek_dao: CsekDao,
    socrec_keys: Arc<SocRecKeysRepository>,
}

impl FullAccountCloudBackupRestorer {
    pub const fn new(
        private_keys: AppPrivateKeyDao,
        csek_dao: CsekDao,
        socrec_keys: Arc<SocRecKeysRepository>,
    ) -> Self {
        Self {
            private_keys,
            csek_dao,
            socrec_keys,
        }
    }

    pub async fn restore(
        &self,
        backup: &CloudBackup,
    ) -> Result<AccountRestoration, RestoreFromBackupError> {
        let keys = match backup {
            CloudBackup::V2(v2) => {
                tracing::info!(account_id = %v2.account_id, "restoring keybox from v2 backup");
                self.decrypt_v2(v2).await?
            }
        };
        self.restore_with_decrypted_keys(backup, keys).await
    }

    async fn decrypt_v2(&self, backup: &CloudBackupV2) -> Result<FullAccountKeys, RestoreFromBackupError> {
        let fields = &backup.full_account_fields;
        let csek = self
            .csek_dao
            .get(&fields.sealed_hw_encryption_key)
            .await
            .map_err(restoration("csek lookup"))?
            .ok_or(RestoreFromBackupError::CsekMissing)?;
        let plaintext = Zeroizing::new(
            crypto::open(
                csek.as_bytes(),
                &fields.hw_full_account_keys_ciphertext,
                FULL_ACCOUNT_KEYS_AAD,
            )
            .map_err(|e| decoding(e.to_string()))?,
        );
        serde_json::from_slice(&plaintext).map_err(|e| decoding(e.to_string()))
    }

    /// Restore when the caller already holds the plaintext keys, e.g. from an emergency
    /// access kit. Skips the CSEK entirely.
    pub async fn restore_with_decrypted_keys(
        &self,
        backup: &CloudBackup,
        keys: FullAccountKeys,
    ) -> Result<AccountRestoration, RestoreFromBackupError> {
        let CloudBackup::V2(v2) = backup;
        let app = &keys.active_app_key_bundle;

        // Validate everything before the first write.
        if keys.app_global_auth_keypair.public_key != app.auth_key
            || keys.app_global_auth_keypair.private_key.public_key() != app.auth_key
        {
            return Err(decoding("app global auth keypair does not match the key bundle"));
        }
        let recovery = &v2.app_recovery_auth_keypair;
        if recovery.private_key.public_key() != recovery.public_key
            || app.recovery_auth_key.is_some_and(|k| k != recovery.public_key)
        {
            return Err(decoding("app recovery auth keypair does not match the key bundle"));
        }
        if !keys
            .app_spending_keypairs
            .iter()
            .any(|kp| kp.public_key == app.spending_key)
        {
            return Err(decoding("active app spending private key is missing"));
        }
        if keys.active_spending_keyset.app_key != app.spending_key
            || keys.active_spending_keyset.hardware_key != keys.active_hw_key_bundle.spending_key
        {
            return Err(decoding("active keyset does not match the key bundles"));
        }
        let tc = &v2.trusted_contact_identity_keypair;
        if tc.private_key.public_key() != tc.public_key {
            return Err(decoding("trusted contact identity keypair is inconsistent"));
        }

        for kp in &keys.app_spending_keypairs {
            self.private_keys
                .store_spending_keypair(kp)
                .await
                .map_err(restoration("app spending keypair"))?;
        }
        self.private_keys
            .store_auth_keypair(&keys.app_global_auth_keypair)
            .await
            .map_err(restoration("app global auth keypair"))?;
        self.private_keys
            .store_auth_keypair(recovery)
            .await
            .map_err(restoration("app recovery auth keypair"))?;
        self.socrec_keys
            .restore_identity_keypair(tc)
            .await
            .map_err(restoration("trusted contact identity keypair"))?;

        let mut active_app_key_bundle = keys.active_app_key_bundle;
        active_app_key_bundle.recovery_auth_key = Some(recovery.public_key);
        let keybox = Keybox {
            local_id: uuid::Uuid::new_v4().to_string(),
            full_account_id: v2.account_id.clone(),
            active_spending_keyset: keys.active_spending_keyset,
            active_app_key_bundle,
            active_hw_key_bundle: keys.active_hw_key_bundle,
            inactive_keysets: keys.inactive_spending_keysets,
            config: KeyboxConfig {
                network_type: v2.bitcoin_network_type,
                f8e_environment: v2.f8e_environment,
                is_test_account: v2.is_test_account,
                is_hardware_fake: v2.full_account_fields.is_fake_hardware,
                is_using_socrec_fakes: v2.is_using_socrec_fakes,
                delay_notify_duration_seconds: None,
            },
        };
        tracing::info!(
            account_id = %keybox.full_account_id,
            keyset_id = keybox.active_spending_keyset.keyset_id(),
            "restored keybox from backup"
        );
        Ok(AccountRestoration {
            app_global_auth_key: keybox.active_app_key_bundle.auth_key,
            app_recovery_auth_key: recovery.public_key,
            trusted_contacts: v2.full_account_fields.trusted_contacts.clone(),
            keybox,
            cloud_backup: backup.clone(),
        })
    }
}
