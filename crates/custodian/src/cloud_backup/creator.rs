use super::{
    csek::{CsekDao, SealedCsek},
    model::{CloudBackup, CloudBackupV2, FullAccountFields, FullAccountKeys, FULL_ACCOUNT_KEYS_AAD},
};
use crate::{
    crypto::{self, CryptoError},
    errors::{ErrorCode, StorageError},
    keybox::Keybox,
    keys::{AppPrivateKeyDao, AuthKeypair, SpendingKeypair},
    socrec::{SocRecKeysRepository, TrustedContact},
};
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum FullAccountFieldsError {
    #[error("no plaintext csek is held for this sealed csek")]
    CsekMissing,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("could not encrypt account keys: {0}")]
    Encrypt(#[from] CryptoError),

    #[error("could not encode account keys: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CloudBackupCreateError {
    #[error("full account fields: {0}")]
    FullAccountFieldsCreation(#[source] FullAccountFieldsError),

    #[error("trusted contact identity key: {0}")]
    SocRecKeysRetrieval(#[source] StorageError),

    #[error("app recovery auth keypair: {0}")]
    AppRecoveryAuthKeypairRetrieval(String),
}

impl ErrorCode for CloudBackupCreateError {
    fn code(&self) -> &'static str {
        match self {
            Self::FullAccountFieldsCreation(_) => "full_account_fields_creation_error",
            Self::SocRecKeysRetrieval(_) => "socrec_keys_retrieval_error",
            Self::AppRecoveryAuthKeypairRetrieval(_) => "app_recovery_auth_keypair_retrieval_error",
        }
    }
}

/// Builds a [`CloudBackup`] from the keybox and the app's private keys.
#[derive(Debug, Clone)]
pub struct FullAccountCloudBackupCreator {
    private_keys: AppPrivateKeyDao,
    csek_dao: CsekDao,
    socrec_keys: Arc<SocRecKeysRepository>,
}

impl FullAccountCloudBackupCreator {
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

    pub async fn create(
        &self,
        keybox: &Keybox,
        sealed_csek: &SealedCsek,
        trusted_contacts: &[TrustedContact],
    ) -> Result<CloudBackup, CloudBackupCreateError> {
        let full_account_fields = self
            .full_account_fields(keybox, sealed_csek, trusted_contacts)
            .await
            .map_err(CloudBackupCreateError::FullAccountFieldsCreation)?;

        let trusted_contact_identity_keypair = self
            .socrec_keys
            .get_or_create_identity_keypair()
            .await
            .map_err(CloudBackupCreateError::SocRecKeysRetrieval)?;

        let app_recovery_auth_keypair = self.app_recovery_auth_keypair(keybox).await?;

        tracing::info!(
            account_id = %keybox.full_account_id,
            inactive_keysets = keybox.inactive_keysets.len(),
            trusted_contacts = trusted_contacts.len(),
            "created cloud backup"
        );
        Ok(CloudBackup::V2(CloudBackupV2 {
            account_id: keybox.full_account_id.clone(),
            f8e_environment: keybox.config.f8e_environment,
            is_test_account: keybox.config.is_test_account,
            trusted_contact_identity_keypair,
            full_account_fields,
            app_recovery_auth_keypair,
            is_using_socrec_fakes: keybox.config.is_using_socrec_fakes,
            bitcoin_network_type: keybox.config.network_type,
        }))
    }

    async fn app_recovery_auth_keypair(
        &self,
        keybox: &Keybox,
    ) -> Result<AuthKeypair, CloudBackupCreateError> {
        let public_key = keybox
            .active_app_key_bundle
            .recovery_auth_key
            .ok_or_else(|| {
                CloudBackupCreateError::AppRecoveryAuthKeypairRetrieval(
                    "keybox has no recovery auth key".to_owned(),
                )
            })?;
        let private_key = self
            .private_keys
            .require_auth_private_key(&public_key)
            .await
            .map_err(|e| CloudBackupCreateError::AppRecoveryAuthKeypairRetrieval(e.to_string()))?;
        Ok(AuthKeypair {
            public_key,
            private_key,
        })
    }

    async fn full_account_fields(
        &self,
        keybox: &Keybox,
        sealed_csek: &SealedCsek,
        trusted_contacts: &[TrustedContact],
    ) -> Result<FullAccountFields, FullAccountFieldsError> {
        let csek = self
            .csek_dao
            .get(sealed_csek)
            .await?
            .ok_or(FullAccountFieldsError::CsekMissing)?;

        let app = &keybox.active_app_key_bundle;
        let app_global_auth_keypair = AuthKeypair {
            public_key: app.auth_key,
            private_key: self.private_keys.require_auth_private_key(&app.auth_key).await?,
        };

        let mut app_spending_keypairs = vec![SpendingKeypair {
            public_key: app.spending_key.clone(),
            private_key: self
                .private_keys
                .require_spending_private_key(&app.spending_key)
                .await?,
        }];
        // Retired app keys are lost along with a lost app; keep whichever survived.
        for keyset in &keybox.inactive_keysets {
            if let Some(private_key) = self.private_keys.spending_private_key(&keyset.app_key).await? {
                app_spending_keypairs.push(SpendingKeypair {
                    public_key: keyset.app_key.clone(),
                    private_key,
                });
            }
        }

        let keys = FullAccountKeys {
            active_spending_keyset: keybox.active_spending_keyset.clone(),
            inactive_spending_keysets: keybox.inactive_keysets.clone(),
            active_app_key_bundle: app.clone(),
            active_hw_key_bundle: keybox.active_hw_key_bundle.clone(),
            app_global_auth_keypair,
            app_spending_keypairs,
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&keys)?);
        let ciphertext = crypto::seal(csek.as_bytes(), &plaintext, FULL_ACCOUNT_KEYS_AAD)?;

        Ok(FullAccountFields {
            sealed_hw_encryption_key: sealed_csek.clone(),
            hw_full_account_keys_ciphertext: ciphertext,
            trusted_contacts: trusted_contacts.to_vec(),
            is_fake_hardware: keybox.config.is_hardware_fake,
        })
    }
}
