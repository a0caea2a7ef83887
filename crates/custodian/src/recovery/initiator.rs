use super::{
    error::RecoveryError,
    model::{CompletionProgress, LocalRecovery, RecoveryConflictData},
    service::InFlight,
    state::RecoveryEvent,
    DelayNotifyRecovery,
};
use crate::{
    f8e::{
        AuthTokenScope, DelayNotifyAuthKeys, InitiateAccountDelayNotifyErrorCode as InitiateCode,
        PhysicalFactor,
    },
    hardware::{pair_hardware, HardwareFactor, HwFactorProofOfPossession},
    keybox::{AppKeyBundle, FullAccountId, HwKeyBundle, KeyboxConfig},
    keys::DescriptorPublicKey,
};
use std::time::Duration;

impl DelayNotifyRecovery {
    /// Start recovering from a lost phone. New app keys are generated on this device and the
    /// account's existing hardware vouches for the request.
    pub async fn initiate_lost_app(
        &self,
        account_id: &FullAccountId,
        hardware: &dyn HardwareFactor,
        config: KeyboxConfig,
    ) -> Result<LocalRecovery, RecoveryError> {
        let _op = self.op_lock.lock().await;
        let in_flight = self.begin_initiation(PhysicalFactor::App).await?;
        let result = self.lost_app_request(account_id, hardware, config).await;
        in_flight.finish();
        self.finish_initiation(result)
    }

    /// Start recovering from a lost hardware device, using this device's active keybox and a
    /// replacement device.
    pub async fn initiate_lost_hardware(
        &self,
        new_hardware: &dyn HardwareFactor,
    ) -> Result<LocalRecovery, RecoveryError> {
        let _op = self.op_lock.lock().await;
        let in_flight = self.begin_initiation(PhysicalFactor::Hardware).await?;
        let result = self.lost_hardware_request(new_hardware).await;
        in_flight.finish();
        self.finish_initiation(result)
    }

    async fn begin_initiation(
        &self,
        lost_factor: PhysicalFactor,
    ) -> Result<InFlight<'_>, RecoveryError> {
        if let Some(local) = self.dao.get().await? {
            return Err(RecoveryError::AlreadyRecovering(local.lost_factor));
        }
        Ok(self.enter(RecoveryEvent::InitiateRequested(lost_factor))?)
    }

    fn finish_initiation(
        &self,
        result: Result<LocalRecovery, RecoveryError>,
    ) -> Result<LocalRecovery, RecoveryError> {
        let event = match &result {
            Ok(local) => RecoveryEvent::Initiated(local.clone()),
            Err(RecoveryError::Conflict(data)) => RecoveryEvent::ConflictFound(data.clone()),
            Err(_) => RecoveryEvent::InitiateFailed,
        };
        self.apply(event)?;
        result
    }

    async fn lost_app_request(
        &self,
        account_id: &FullAccountId,
        hardware: &dyn HardwareFactor,
        config: KeyboxConfig,
    ) -> Result<LocalRecovery, RecoveryError> {
        let network = config.network_type;
        let app = self.generator.generate_key_bundle(network).await?;

        let existing: Vec<DescriptorPublicKey> = self
            .keysets
            .list_keysets(account_id)
            .await?
            .iter()
            .flat_map(|ks| ks.keys().map(Clone::clone))
            .collect();
        let hw = pair_hardware(hardware, network, &existing).await?;

        // The old app keys are gone. The new recovery key signs for this request, and is only
        // registered once the server has accepted it.
        let recovery_key = app.recovery_auth_key;
        let token = match recovery_key {
            Some(key) => self.tokens.token_for_key(account_id, key).await?,
            None => {
                self.tokens
                    .access_token(account_id, AuthTokenScope::Recovery)
                    .await?
            }
        };
        let pop = hardware.proof_of_possession(&token).await?;

        let local = self
            .request(account_id, PhysicalFactor::App, app, hw, config, Some(&pop))
            .await?;
        if let Some(key) = recovery_key {
            self.tokens
                .register_key(account_id, AuthTokenScope::Recovery, key)
                .await;
        }
        Ok(local)
    }

    async fn lost_hardware_request(
        &self,
        new_hardware: &dyn HardwareFactor,
    ) -> Result<LocalRecovery, RecoveryError> {
        let keybox = self.keyboxes.active().ok_or(RecoveryError::MissingKeybox)?;
        let network = keybox.config.network_type;
        let hw = pair_hardware(new_hardware, network, &keybox.descriptor_public_keys()).await?;
        let app = self.generator.generate_key_bundle(network).await?;
        self.request(
            &keybox.full_account_id,
            PhysicalFactor::Hardware,
            app,
            hw,
            keybox.config,
            None,
        )
        .await
    }

    async fn request(
        &self,
        account_id: &FullAccountId,
        lost_factor: PhysicalFactor,
        app: AppKeyBundle,
        hw: HwKeyBundle,
        config: KeyboxConfig,
        hw_pop: Option<&HwFactorProofOfPossession>,
    ) -> Result<LocalRecovery, RecoveryError> {
        let auth_keys = DelayNotifyAuthKeys {
            app: app.auth_key,
            hardware: hw.auth_key,
            recovery: app.recovery_auth_key,
        };
        let delay = config
            .is_test_account
            .then_some(config.delay_notify_duration_seconds)
            .flatten()
            .map(Duration::from_secs);

        let server_recovery = match self
            .recovery
            .initiate(account_id, lost_factor, &auth_keys, delay, hw_pop)
            .await
        {
            Ok(server) => server,
            Err(e) if e.client_code() == Some(InitiateCode::RecoveryAlreadyExists) => {
                let existing = self.recovery.status(account_id).await?;
                return Err(existing.map_or(RecoveryError::Initiate(e), |server_recovery| {
                    tracing::warn!(
                        account_id = %account_id,
                        lost_factor = %server_recovery.lost_factor,
                        "another recovery is already in progress"
                    );
                    RecoveryError::Conflict(RecoveryConflictData {
                        server_recovery,
                        local_lost_factor: None,
                    })
                }));
            }
            Err(e) => return Err(e.into()),
        };

        let local = LocalRecovery {
            account_id: account_id.clone(),
            lost_factor,
            destination_app_key_bundle: app,
            destination_hw_key_bundle: hw,
            server_recovery,
            config,
            progress: CompletionProgress::AwaitingDelay,
        };
        self.dao.set(&local).await?;
        tracing::info!(
            account_id = %account_id,
            lost_factor = %lost_factor,
            delay_end_time = %local.server_recovery.delay_end_time,
            "initiated delay-notify recovery"
        );
        Ok(local)
    }
}
