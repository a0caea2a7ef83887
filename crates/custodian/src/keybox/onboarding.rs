use super::{Keybox, KeyboxConfig, SpendingKeyset};
use crate::{
    errors::ErrorCode,
    f8e::{AccountService, AuthTokenProvider, AuthTokenScope, CreateAccountClientErrorCode, F8eError},
    hardware::{pair_hardware, HardwareError, HardwareFactor},
    keys::{AppKeysGenerator, KeyBundleError},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OnboardingError {
    #[error(transparent)]
    KeyBundle(#[from] KeyBundleError),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Server(#[from] F8eError<CreateAccountClientErrorCode>),
}

impl ErrorCode for OnboardingError {
    fn code(&self) -> &'static str {
        match self {
            Self::KeyBundle(e) => e.code(),
            Self::Hardware(e) => e.code(),
            Self::Server(e) => e.code(),
        }
    }
}

/// Create a full account: fresh app keys, a paired device, and the server's first keyset.
///
/// The returned keybox is not activated. Callers write the cloud backup first and only then
/// hand the keybox to [`super::ActiveKeyboxRepository::activate`].
pub async fn create_full_account(
    generator: &AppKeysGenerator,
    hardware: &dyn HardwareFactor,
    accounts: &dyn AccountService,
    tokens: &dyn AuthTokenProvider,
    config: KeyboxConfig,
) -> Result<Keybox, OnboardingError> {
    let network = config.network_type;
    let app = generator.generate_key_bundle(network).await?;
    let hw = pair_hardware(hardware, network, &[]).await?;
    let created = accounts
        .create_account(&app, &hw, network, config.is_test_account)
        .await?;

    tokens
        .register_key(&created.account_id, AuthTokenScope::Global, app.auth_key)
        .await;
    if let Some(recovery) = app.recovery_auth_key {
        tokens
            .register_key(&created.account_id, AuthTokenScope::Recovery, recovery)
            .await;
    }

    let keyset = SpendingKeyset {
        local_id: uuid::Uuid::new_v4().to_string(),
        network_type: network,
        app_key: app.spending_key.clone(),
        hardware_key: hw.spending_key.clone(),
        f8e_spending_keyset: created.keyset,
    };
    tracing::info!(
        account_id = %created.account_id,
        keyset_id = keyset.keyset_id(),
        network = %network,
        "created full account"
    );
    Ok(Keybox {
        local_id: uuid::Uuid::new_v4().to_string(),
        full_account_id: created.account_id,
        active_spending_keyset: keyset,
        active_app_key_bundle: app,
        active_hw_key_bundle: hw,
        inactive_keysets: vec![],
        config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ClockFake,
        config::F8eEnvironment,
        f8e::{AuthTokenProviderFake, F8eFake},
        hardware::HardwareFake,
        keys::{AppPrivateKeyDao, BitcoinNetworkType},
        secure_store::SecureStore,
    };
    use std::sync::Arc;

    fn config() -> KeyboxConfig {
        KeyboxConfig {
            network_type: BitcoinNetworkType::Regtest,
            f8e_environment: F8eEnvironment::Local,
            is_test_account: true,
            is_hardware_fake: true,
            is_using_socrec_fakes: true,
            delay_notify_duration_seconds: None,
        }
    }

    #[tokio::test]
    async fn account_keys_are_registered_and_keyset_is_assembled() -> eyre::Result<()> {
        let f8e = F8eFake::new(Arc::new(ClockFake::default()));
        let tokens = AuthTokenProviderFake::default();
        let generator = AppKeysGenerator::new(AppPrivateKeyDao::new(SecureStore::in_memory()));
        let hw = HardwareFake::new(BitcoinNetworkType::Regtest)?;

        let kb = create_full_account(&generator, &hw, &f8e, &tokens, config()).await?;
        assert_eq!(
            f8e.active_keyset_id(&kb.full_account_id).await.as_deref(),
            Some(kb.active_spending_keyset.keyset_id())
        );
        assert_eq!(
            tokens
                .registered_key(&kb.full_account_id, AuthTokenScope::Global)
                .await,
            Some(kb.active_app_key_bundle.auth_key)
        );
        assert_eq!(
            kb.active_spending_keyset.hardware_key,
            kb.active_hw_key_bundle.spending_key
        );
        assert!(kb.inactive_keysets.is_empty());

        // The same device cannot back a second account.
        let again = create_full_account(&generator, &hw, &f8e, &tokens, config()).await;
        assert!(matches!(
            again,
            Err(OnboardingError::Server(e))
                if e.client_code() == Some(CreateAccountClientErrorCode::HwAuthPubkeyInUse)
        ));
        Ok(())
    }
}
