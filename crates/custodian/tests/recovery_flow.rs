use chrono::TimeDelta;
use custodian::{
    chain::{BlockchainFake, ChainDataProvider},
    clock::{Clock, ClockFake},
    config::F8eEnvironment,
    f8e::{AuthTokenProvider, AuthTokenProviderFake, F8eFake, KeysetService, RecoveryService},
    hardware::HardwareFake,
    keybox::{create_full_account, ActiveKeyboxRepository, KeyboxConfig},
    keys::{AppKeysGenerator, AppPrivateKeyDao, BitcoinNetworkType},
    recovery::{DelayNotifyRecovery, RecoveryDao, RecoveryDeps, RecoveryError, RecoveryStatus},
    secure_store::SecureStore,
    spending::{DescriptorWalletProvider, FeePolicy, SpendingWallet as _, SpendingWalletProvider},
    sweep::{SweepService, SweepState},
};
use std::sync::Arc;

const NET: BitcoinNetworkType = BitcoinNetworkType::Regtest;

fn config() -> KeyboxConfig {
    KeyboxConfig {
        network_type: NET,
        f8e_environment: F8eEnvironment::Staging,
        is_test_account: true,
        is_hardware_fake: true,
        is_using_socrec_fakes: false,
        delay_notify_duration_seconds: None,
    }
}

/// Everything one phone owns. Server, chain and clock are shared.
struct Phone {
    generator: AppKeysGenerator,
    keyboxes: Arc<ActiveKeyboxRepository>,
    tokens: Arc<AuthTokenProviderFake>,
    wallets: Arc<DescriptorWalletProvider>,
    recovery: Arc<DelayNotifyRecovery>,
}

impl Phone {
    async fn new(
        f8e: &Arc<F8eFake>,
        chain: &Arc<BlockchainFake>,
        clock: &Arc<ClockFake>,
    ) -> eyre::Result<Self> {
        let store = SecureStore::in_memory();
        let generator = AppKeysGenerator::new(AppPrivateKeyDao::new(store.clone()));
        let keyboxes = Arc::new(ActiveKeyboxRepository::load(store.clone()).await?);
        let tokens = Arc::new(AuthTokenProviderFake::default());
        let wallets = Arc::new(DescriptorWalletProvider::new(
            Arc::clone(chain) as Arc<dyn ChainDataProvider>,
            AppPrivateKeyDao::new(store.clone()),
            store.clone(),
            Arc::clone(clock) as Arc<dyn Clock>,
            5,
        ));
        let recovery = Arc::new(DelayNotifyRecovery::new(RecoveryDeps {
            recovery: Arc::clone(f8e) as Arc<dyn RecoveryService>,
            keysets: Arc::clone(f8e) as Arc<dyn KeysetService>,
            tokens: Arc::clone(&tokens) as Arc<dyn AuthTokenProvider>,
            generator: generator.clone(),
            keyboxes: Arc::clone(&keyboxes),
            dao: RecoveryDao::new(store),
            clock: Arc::clone(clock) as Arc<dyn Clock>,
        }));
        Ok(Self {
            generator,
            keyboxes,
            tokens,
            wallets,
            recovery,
        })
    }
}

#[tokio::test]
async fn lost_phone_recovers_and_sweeps_old_funds() -> eyre::Result<()> {
    let clock = Arc::new(ClockFake::default());
    let f8e = Arc::new(F8eFake::new(Arc::clone(&clock) as Arc<dyn Clock>));
    let chain = Arc::new(BlockchainFake::new());
    let hw = HardwareFake::new(NET)?;

    // Onboard and receive funds on the original phone.
    let old = Phone::new(&f8e, &chain, &clock).await?;
    let original =
        create_full_account(&old.generator, &hw, f8e.as_ref(), old.tokens.as_ref(), config())
            .await?;
    old.keyboxes.activate(original.clone()).await?;
    let old_wallet = old
        .wallets
        .descriptor_wallet(&original.active_spending_keyset)
        .await?;
    let deposit = old_wallet.get_new_address().await?;
    chain.fund(&deposit.script_pubkey(), 250_000);
    chain.mine_block();

    // The phone is lost. A new one starts a recovery with the same hardware.
    let phone = Phone::new(&f8e, &chain, &clock).await?;
    let account = original.full_account_id.clone();
    let local = phone
        .recovery
        .initiate_lost_app(&account, &hw, config())
        .await?;
    assert!(matches!(
        phone.recovery.sync(&account).await?,
        RecoveryStatus::StillRecovering(_)
    ));

    clock.advance_by(TimeDelta::days(6));
    assert!(matches!(
        phone.recovery.complete(&account, &hw).await,
        Err(RecoveryError::NotReady { .. })
    ));

    clock.advance_by(TimeDelta::days(1));
    let completion = phone.recovery.complete(&account, &hw).await?;
    assert!(completion.needs_sweep, "old keyset still holds funds");
    let keybox = completion.keybox;
    assert_eq!(keybox.active_app_key_bundle, local.destination_app_key_bundle);
    assert_eq!(phone.keyboxes.active(), Some(keybox.clone()));

    // Move everything from the old keyset into the new one.
    let sweep = SweepService::new(
        Arc::clone(&phone.keyboxes),
        Arc::clone(&phone.wallets) as Arc<dyn SpendingWalletProvider>,
        Arc::clone(&f8e) as Arc<dyn KeysetService>,
        Arc::clone(&chain) as Arc<dyn ChainDataProvider>,
        FeePolicy::Rate(2),
    );
    let txids = sweep.run(&hw).await?;
    assert_eq!(txids.len(), 1);
    assert!(matches!(sweep.state(), SweepState::SweepComplete { .. }));

    chain.mine_block();
    let new_wallet = phone
        .wallets
        .wallet_for(&keybox.active_spending_keyset)
        .await?;
    new_wallet.initialize().await?;
    new_wallet.sync().await?;
    let balance = new_wallet.balance();
    assert!(
        balance.confirmed > 240_000 && balance.confirmed < 250_000,
        "swept balance {balance:?}"
    );
    assert_eq!(sweep.prepare().await?, None);
    Ok(())
}
