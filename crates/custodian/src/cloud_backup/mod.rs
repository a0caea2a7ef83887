//! Encrypted, versioned account backups and restore.

pub mod codec;
pub mod creator;
pub mod csek;
pub mod model;
pub mod restorer;

pub use codec::{decode, encode, BackupDecodeError};
pub use creator::{CloudBackupCreateError, FullAccountCloudBackupCreator};
pub use csek::{generate_sealed_csek, unseal_and_cache_csek, Csek, CsekDao, SealedCsek};
pub use model::{CloudBackup, CloudBackupV2, FullAccountFields, FullAccountKeys};
pub use restorer::{AccountRestoration, FullAccountCloudBackupRestorer, RestoreFromBackupError};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ClockFake,
        config::F8eEnvironment,
        f8e::{AuthTokenProviderFake, F8eFake},
        hardware::HardwareFake,
        keybox::{create_full_account, Keybox, KeyboxConfig},
        keys::{AppKeysGenerator, AppPrivateKeyDao, BitcoinNetworkType},
        secure_store::SecureStore,
        socrec::SocRecKeysRepository,
    };
    use std::sync::Arc;

    const NET: BitcoinNetworkType = BitcoinNetworkType::Regtest;

    /// One device's worth of local storage.
    struct Device {
        private_keys: AppPrivateKeyDao,
        csek_dao: CsekDao,
        socrec_keys: Arc<SocRecKeysRepository>,
    }

    impl Device {
        fn new() -> Self {
            let store = SecureStore::in_memory();
            Self {
                private_keys: AppPrivateKeyDao::new(store.clone()),
                csek_dao: CsekDao::new(store.clone()),
                socrec_keys: Arc::new(SocRecKeysRepository::new(store)),
            }
        }

        fn creator(&self) -> FullAccountCloudBackupCreator {
            FullAccountCloudBackupCreator::new(
                self.private_keys.clone(),
                self.csek_dao.clone(),
                Arc::clone(&self.socrec_keys),
            )
        }

        fn restorer(&self) -> FullAccountCloudBackupRestorer {
            FullAccountCloudBackupRestorer::new(
                self.private_keys.clone(),
                self.csek_dao.clone(),
                Arc::clone(&self.socrec_keys),
            )
        }
    }

    async fn onboarded(device: &Device, hw: &HardwareFake) -> eyre::Result<Keybox> {
        let f8e = F8eFake::new(Arc::new(ClockFake::default()));
        let generator = AppKeysGenerator::new(device.private_keys.clone());
        let config = KeyboxConfig {
            network_type: NET,
            f8e_environment: F8eEnvironment::Staging,
            is_test_account: true,
            is_hardware_fake: true,
            is_using_socrec_fakes: false,
            delay_notify_duration_seconds: None,
        };
        Ok(create_full_account(&generator, hw, &f8e, &AuthTokenProviderFake::default(), config).await?)
    }

    #[tokio::test]
    async fn restore_on_new_device_round_trips_keybox() -> eyre::Result<()> {
        let hw = HardwareFake::new(NET)?;
        let old = Device::new();
        let keybox = onboarded(&old, &hw).await?;
        let sealed = generate_sealed_csek(&hw, &old.csek_dao).await?;
        let backup = old.creator().create(&keybox, &sealed, &[]).await?;
        let blob = encode(&backup)?;

        let new = Device::new();
        let decoded = decode(&blob)?;
        assert!(matches!(
            new.restorer().restore(&decoded).await,
            Err(RestoreFromBackupError::CsekMissing)
        ));

        unseal_and_cache_csek(&hw, &new.csek_dao, decoded.sealed_csek()).await?;
        let restored = new.restorer().restore(&decoded).await?;
        assert_eq!(restored.keybox.active_spending_keyset, keybox.active_spending_keyset);
        assert_eq!(restored.keybox.active_app_key_bundle, keybox.active_app_key_bundle);
        assert_eq!(restored.keybox.full_account_id, keybox.full_account_id);
        assert_eq!(restored.keybox.config.f8e_environment, F8eEnvironment::Staging);

        // Private keys and the identity key arrived on the new device.
        let app = &keybox.active_app_key_bundle;
        assert!(new.private_keys.spending_private_key(&app.spending_key).await?.is_some());
        assert!(new.private_keys.auth_private_key(&app.auth_key).await?.is_some());
        assert_eq!(
            new.socrec_keys.identity_keypair().await?,
            old.socrec_keys.identity_keypair().await?
        );
        Ok(())
    }

    #[tokio::test]
    async fn tampered_ciphertext_is_a_decode_error_and_writes_nothing() -> eyre::Result<()> {
        let hw = HardwareFake::new(NET)?;
        let old = Device::new();
        let keybox = onboarded(&old, &hw).await?;
        let sealed = generate_sealed_csek(&hw, &old.csek_dao).await?;
        let CloudBackup::V2(mut v2) = old.creator().create(&keybox, &sealed, &[]).await?;
        v2.full_account_fields.hw_full_account_keys_ciphertext.ct_b64 = "AAAA".to_owned();
        let backup = CloudBackup::V2(v2);

        let new = Device::new();
        unseal_and_cache_csek(&hw, &new.csek_dao, &sealed).await?;
        assert!(matches!(
            new.restorer().restore(&backup).await,
            Err(RestoreFromBackupError::AccountBackupDecoding(_))
        ));
        assert!(new
            .private_keys
            .auth_private_key(&keybox.active_app_key_bundle.auth_key)
            .await?
            .is_none());
        Ok(())
    }

    #[tokio::test]
    async fn creation_needs_the_csek_and_recovery_key() -> eyre::Result<()> {
        let hw = HardwareFake::new(NET)?;
        let device = Device::new();
        let keybox = onboarded(&device, &hw).await?;

        let unknown = SealedCsek("deadbeef".to_owned());
        assert!(matches!(
            device.creator().create(&keybox, &unknown, &[]).await,
            Err(CloudBackupCreateError::FullAccountFieldsCreation(_))
        ));

        let sealed = generate_sealed_csek(&hw, &device.csek_dao).await?;
        let mut without_recovery = keybox.clone();
        without_recovery.active_app_key_bundle.recovery_auth_key = None;
        assert!(matches!(
            device.creator().create(&without_recovery, &sealed, &[]).await,
            Err(CloudBackupCreateError::AppRecoveryAuthKeypairRetrieval(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn decrypted_keys_restore_without_csek() -> eyre::Result<()> {
        let hw = HardwareFake::new(NET)?;
        let old = Device::new();
        let keybox = onboarded(&old, &hw).await?;
        let sealed = generate_sealed_csek(&hw, &old.csek_dao).await?;
        let backup = old.creator().create(&keybox, &sealed, &[]).await?;

        let csek = old.csek_dao.get(&sealed).await?.ok_or_else(|| eyre::eyre!("no csek"))?;
        let CloudBackup::V2(v2) = &backup;
        let plain = crate::crypto::open(
            csek.as_bytes(),
            &v2.full_account_fields.hw_full_account_keys_ciphertext,
            model::FULL_ACCOUNT_KEYS_AAD,
        )?;
        let keys: FullAccountKeys = serde_json::from_slice(&plain)?;

        let new = Device::new();
        let restored = new.restorer().restore_with_decrypted_keys(&backup, keys).await?;
        assert_eq!(restored.keybox.active_spending_keyset, keybox.active_spending_keyset);
        Ok(())
    }
}
