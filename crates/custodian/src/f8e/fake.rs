use super::{
    accounts::{AccountService, CreatedAccount},
    auth::{AuthTokenProvider, AuthTokenScope},
    error::{
        CancelDelayNotifyRecoveryErrorCode, ClientErrorCode, CompleteDelayNotifyErrorCode,
        CreateAccountClientErrorCode, F8eError, InitiateAccountDelayNotifyErrorCode,
        NoClientErrorCode,
    },
    keysets::KeysetService,
    recovery::{completion_challenge, DelayNotifyAuthKeys, PhysicalFactor, RecoveryService, ServerRecovery},
};
use crate::{
    clock::Clock,
    config::DEFAULT_DELAY_PERIOD_SECONDS,
    hardware::HwFactorProofOfPossession,
    keybox::{AppKeyBundle, F8eSpendingKeyset, FullAccountId, HwKeyBundle, SpendingKeyset},
    keys::{
        generator::{generate_master_key, spending_keypair_at},
        AuthPublicKey, BitcoinNetworkType, DescriptorPublicKey, ExtendedPrivateKey,
    },
    spending::Psbt,
};
use async_trait::async_trait;
use bitcoin::secp256k1::Secp256k1;
use chrono::{DateTime, TimeDelta, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;

#[derive(Debug)]
struct FakeAccount {
    network: BitcoinNetworkType,
    is_test_account: bool,
    auth_keys: DelayNotifyAuthKeys,
    keysets: Vec<SpendingKeyset>,
    active_keyset_id: String,
    server_keys: HashMap<String, ExtendedPrivateKey>,
    recovery: Option<ServerRecovery>,
}

#[derive(Debug, Default)]
struct FakeState {
    accounts: HashMap<FullAccountId, FakeAccount>,
    next_id: u64,
    failing_requests: u32,
}

/// In-process server: accounts, keysets, delay-notify recovery and transaction co-signing.
#[derive(Debug)]
pub struct F8eFake {
    clock: Arc<dyn Clock>,
    default_delay: Duration,
    state: Mutex<FakeState>,
}

fn not_found<C: ClientErrorCode>(account_id: &FullAccountId) -> F8eError<C> {
    F8eError::GeneralClient {
        status: 404,
        message: format!("account {account_id} not found"),
    }
}

fn after(t: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(d)
        .ok()
        .and_then(|delta| t.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn take_failure<C: ClientErrorCode>(&mut self) -> Result<(), F8eError<C>> {
        if self.failing_requests > 0 {
            self.failing_requests -= 1;
            return Err(F8eError::Networking("fake f8e is unreachable".to_owned()));
        }
        Ok(())
    }

    fn account<C: ClientErrorCode>(
        &mut self,
        account_id: &FullAccountId,
    ) -> Result<&mut FakeAccount, F8eError<C>> {
        self.take_failure()?;
        self.accounts
            .get_mut(account_id)
            .ok_or_else(|| not_found(account_id))
    }

    fn new_server_key<C: ClientErrorCode>(
        &mut self,
        network: BitcoinNetworkType,
    ) -> Result<(String, ExtendedPrivateKey, DescriptorPublicKey), F8eError<C>> {
        let master = generate_master_key(network).map_err(|e| F8eError::Server {
            status: 500,
            message: e.to_string(),
        })?;
        let public = spending_keypair_at(&master, network, 0)
            .map_err(|e| F8eError::Server {
                status: 500,
                message: e.to_string(),
            })?
            .public_key;
        Ok((self.next_id("keyset"), master, public))
    }
}

impl F8eFake {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            default_delay: Duration::from_secs(DEFAULT_DELAY_PERIOD_SECONDS),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// The next `n` requests fail with a networking error.
    pub async fn fail_next_requests(&self, n: u32) {
        self.state.lock().await.failing_requests = n;
    }

    pub async fn server_recovery(&self, account_id: &FullAccountId) -> Option<ServerRecovery> {
        self.state
            .lock()
            .await
            .accounts
            .get(account_id)
            .and_then(|a| a.recovery.clone())
    }

    pub async fn active_keyset_id(&self, account_id: &FullAccountId) -> Option<String> {
        self.state
            .lock()
            .await
            .accounts
            .get(account_id)
            .map(|a| a.active_keyset_id.clone())
    }

    pub async fn auth_keys(&self, account_id: &FullAccountId) -> Option<DelayNotifyAuthKeys> {
        self.state
            .lock()
            .await
            .accounts
            .get(account_id)
            .map(|a| a.auth_keys)
    }
}

#[async_trait]
impl AccountService for F8eFake {
    async fn create_account(
        &self,
        app: &AppKeyBundle,
        hardware: &HwKeyBundle,
        network: BitcoinNetworkType,
        is_test_account: bool,
    ) -> Result<CreatedAccount, F8eError<CreateAccountClientErrorCode>> {
        let mut st = self.state.lock().await;
        st.take_failure::<CreateAccountClientErrorCode>()?;
        for acct in st.accounts.values() {
            if acct.auth_keys.hardware == hardware.auth_key {
                return Err(F8eError::specific(CreateAccountClientErrorCode::HwAuthPubkeyInUse));
            }
            if acct.auth_keys.app == app.auth_key {
                return Err(F8eError::specific(CreateAccountClientErrorCode::AppAuthPubkeyInUse));
            }
        }
        let (keyset_id, master, server_key) =
            st.new_server_key::<CreateAccountClientErrorCode>(network)?;
        let account_id = FullAccountId(st.next_id("account"));
        let keyset = SpendingKeyset {
            local_id: uuid::Uuid::new_v4().to_string(),
            network_type: network,
            app_key: app.spending_key.clone(),
            hardware_key: hardware.spending_key.clone(),
            f8e_spending_keyset: F8eSpendingKeyset {
                keyset_id: keyset_id.clone(),
                spending_public_key: server_key.clone(),
            },
        };
        st.accounts.insert(
            account_id.clone(),
            FakeAccount {
                network,
                is_test_account,
                auth_keys: DelayNotifyAuthKeys {
                    app: app.auth_key,
                    hardware: hardware.auth_key,
                    recovery: app.recovery_auth_key,
                },
                keysets: vec![keyset],
                active_keyset_id: keyset_id.clone(),
                server_keys: HashMap::from([(keyset_id.clone(), master)]),
                recovery: None,
            },
        );
        Ok(CreatedAccount {
            account_id,
            keyset: F8eSpendingKeyset {
                keyset_id,
                spending_public_key: server_key,
            },
        })
    }
}

#[async_trait]
impl KeysetService for F8eFake {
    async fn create_keyset(
        &self,
        account_id: &FullAccountId,
        app_spending_key: &DescriptorPublicKey,
        hw_spending_key: &DescriptorPublicKey,
        network: BitcoinNetworkType,
        _hw_pop: &HwFactorProofOfPossession,
    ) -> Result<F8eSpendingKeyset, F8eError<NoClientErrorCode>> {
        let mut st = self.state.lock().await;
        let account_network = st.account::<NoClientErrorCode>(account_id)?.network;
        if account_network != network {
            return Err(F8eError::GeneralClient {
                status: 400,
                message: format!("account is on {account_network}, not {network}"),
            });
        }
        let (keyset_id, master, server_key) = st.new_server_key::<NoClientErrorCode>(network)?;
        let acct = st
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| not_found::<NoClientErrorCode>(account_id))?;
        let f8e = F8eSpendingKeyset {
            keyset_id: keyset_id.clone(),
            spending_public_key: server_key,
        };
        acct.keysets.push(SpendingKeyset {
            local_id: uuid::Uuid::new_v4().to_string(),
            network_type: network,
            app_key: app_spending_key.clone(),
            hardware_key: hw_spending_key.clone(),
            f8e_spending_keyset: f8e.clone(),
        });
        acct.server_keys.insert(keyset_id, master);
        Ok(f8e)
    }

    async fn set_active_keyset(
        &self,
        account_id: &FullAccountId,
        keyset_id: &str,
        _hw_pop: &HwFactorProofOfPossession,
    ) -> Result<(), F8eError<NoClientErrorCode>> {
        let mut st = self.state.lock().await;
        let acct = st.account::<NoClientErrorCode>(account_id)?;
        if !acct.keysets.iter().any(|k| k.keyset_id() == keyset_id) {
            return Err(F8eError::GeneralClient {
                status: 404,
                message: format!("keyset {keyset_id} not found"),
            });
        }
        keyset_id.clone_into(&mut acct.active_keyset_id);
        Ok(())
    }

    async fn list_keysets(
        &self,
        account_id: &FullAccountId,
    ) -> Result<Vec<SpendingKeyset>, F8eError<NoClientErrorCode>> {
        let mut st = self.state.lock().await;
        Ok(st.account::<NoClientErrorCode>(account_id)?.keysets.clone())
    }

    async fn sign_psbt(
        &self,
        account_id: &FullAccountId,
        keyset_id: &str,
        psbt: &Psbt,
    ) -> Result<Psbt, F8eError<NoClientErrorCode>> {
        let mut st = self.state.lock().await;
        let acct = st.account::<NoClientErrorCode>(account_id)?;
        let master = acct.server_keys.get(keyset_id).ok_or_else(|| F8eError::GeneralClient {
            status: 404,
            message: format!("keyset {keyset_id} not found"),
        })?;
        let mut inner = psbt
            .to_inner()
            .map_err(|e| F8eError::GeneralClient {
                status: 400,
                message: e.to_string(),
            })?;
        inner
            .sign(&master.xprv, &Secp256k1::new())
            .map_err(|(_, errors)| F8eError::GeneralClient {
                status: 400,
                message: format!("{} inputs failed to sign", errors.len()),
            })?;
        psbt.with_payload(&inner).map_err(|e| F8eError::GeneralClient {
            status: 400,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl RecoveryService for F8eFake {
    async fn initiate(
        &self,
        account_id: &FullAccountId,
        lost_factor: PhysicalFactor,
        auth_keys: &DelayNotifyAuthKeys,
        delay_period: Option<Duration>,
        _hw_pop: Option<&HwFactorProofOfPossession>,
    ) -> Result<ServerRecovery, F8eError<InitiateAccountDelayNotifyErrorCode>> {
        let now = self.clock.now();
        let default_delay = self.default_delay;
        let mut st = self.state.lock().await;
        let acct = st.account::<InitiateAccountDelayNotifyErrorCode>(account_id)?;
        if acct.recovery.is_some() {
            return Err(F8eError::specific(
                InitiateAccountDelayNotifyErrorCode::RecoveryAlreadyExists,
            ));
        }
        let delay = match delay_period {
            Some(d) if acct.is_test_account => d,
            _ => default_delay,
        };
        let recovery = ServerRecovery {
            lost_factor,
            delay_start_time: now,
            delay_end_time: after(now, delay),
            auth_keys: *auth_keys,
        };
        acct.recovery = Some(recovery.clone());
        Ok(recovery)
    }

    async fn cancel(
        &self,
        account_id: &FullAccountId,
        _hw_pop: Option<&HwFactorProofOfPossession>,
    ) -> Result<(), F8eError<CancelDelayNotifyRecoveryErrorCode>> {
        let mut st = self.state.lock().await;
        let acct = st.account::<CancelDelayNotifyRecoveryErrorCode>(account_id)?;
        acct.recovery
            .take()
            .map(|_| ())
            .ok_or_else(|| F8eError::specific(CancelDelayNotifyRecoveryErrorCode::NoRecoveryExists))
    }

    async fn status(
        &self,
        account_id: &FullAccountId,
    ) -> Result<Option<ServerRecovery>, F8eError<NoClientErrorCode>> {
        let mut st = self.state.lock().await;
        Ok(st.account::<NoClientErrorCode>(account_id)?.recovery.clone())
    }

    async fn complete(
        &self,
        account_id: &FullAccountId,
        challenge: &str,
        app_signature: &str,
        hardware_signature: &str,
    ) -> Result<(), F8eError<CompleteDelayNotifyErrorCode>> {
        let now = self.clock.now();
        let mut st = self.state.lock().await;
        let acct = st.account::<CompleteDelayNotifyErrorCode>(account_id)?;
        let recovery = acct
            .recovery
            .clone()
            .ok_or_else(|| F8eError::specific(CompleteDelayNotifyErrorCode::NoRecoveryExists))?;
        if !recovery.delay_elapsed_at(now) {
            return Err(F8eError::specific(
                CompleteDelayNotifyErrorCode::DelayPeriodNotElapsed,
            ));
        }
        let keys = recovery.auth_keys;
        let valid = challenge == completion_challenge(&keys)
            && keys.app.verify(challenge.as_bytes(), app_signature)
            && keys.hardware.verify(challenge.as_bytes(), hardware_signature);
        if !valid {
            return Err(F8eError::specific(CompleteDelayNotifyErrorCode::InvalidSignature));
        }
        acct.auth_keys = DelayNotifyAuthKeys {
            recovery: keys.recovery.or(acct.auth_keys.recovery),
            ..keys
        };
        acct.recovery = None;
        Ok(())
    }

    async fn update_delay_for_test_account(
        &self,
        account_id: &FullAccountId,
        delay_period: Duration,
    ) -> Result<ServerRecovery, F8eError<NoClientErrorCode>> {
        let mut st = self.state.lock().await;
        let acct = st.account::<NoClientErrorCode>(account_id)?;
        if !acct.is_test_account {
            return Err(F8eError::GeneralClient {
                status: 400,
                message: "delay can only be changed for test accounts".to_owned(),
            });
        }
        let recovery = acct.recovery.as_mut().ok_or_else(|| F8eError::GeneralClient {
            status: 400,
            message: "no recovery in progress".to_owned(),
        })?;
        recovery.delay_end_time = after(recovery.delay_start_time, delay_period);
        Ok(recovery.clone())
    }
}

/// Hands out opaque tokens without a server round trip and remembers which keys were
/// registered, so tests can check key rotation.
#[derive(Debug, Default)]
pub struct AuthTokenProviderFake {
    keys: Mutex<HashMap<(FullAccountId, AuthTokenScope), AuthPublicKey>>,
}

impl AuthTokenProviderFake {
    pub async fn registered_key(
        &self,
        account_id: &FullAccountId,
        scope: AuthTokenScope,
    ) -> Option<AuthPublicKey> {
        self.keys
            .lock()
            .await
            .get(&(account_id.clone(), scope))
            .copied()
    }
}

#[async_trait]
impl AuthTokenProvider for AuthTokenProviderFake {
    async fn access_token(
        &self,
        account_id: &FullAccountId,
        scope: AuthTokenScope,
    ) -> Result<String, F8eError<NoClientErrorCode>> {
        let key = self.registered_key(account_id, scope).await.ok_or_else(|| {
            F8eError::Unhandled(format!("no {scope:?} auth key registered for {account_id}"))
        })?;
        Ok(format!("token-{account_id}-{key}"))
    }

    async fn invalidate(&self, _account_id: &FullAccountId, _scope: AuthTokenScope) {}

    async fn register_key(&self, account_id: &FullAccountId, scope: AuthTokenScope, key: AuthPublicKey) {
        self.keys.lock().await.insert((account_id.clone(), scope), key);
    }

    async fn token_for_key(
        &self,
        account_id: &FullAccountId,
        key: AuthPublicKey,
    ) -> Result<String, F8eError<NoClientErrorCode>> {
        Ok(format!("token-{account_id}-{key}"))
    }
}
