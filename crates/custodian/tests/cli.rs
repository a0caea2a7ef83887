use assert_cmd::Command;
use custodian::{
    clock::ClockFake,
    cloud_backup::{encode, generate_sealed_csek, CsekDao, FullAccountCloudBackupCreator},
    config::F8eEnvironment,
    f8e::{AuthTokenProviderFake, F8eFake},
    hardware::HardwareFake,
    keybox::{create_full_account, KeyboxConfig},
    keys::{AppKeysGenerator, AppPrivateKeyDao, BitcoinNetworkType},
    secure_store::SecureStore,
    socrec::SocRecKeysRepository,
};
use predicates::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

struct Env {
    cfg: TempDir,
    data: TempDir,
}

impl Env {
    fn new() -> eyre::Result<Self> {
        Ok(Self {
            cfg: tempfile::tempdir()?,
            data: tempfile::tempdir()?,
        })
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("custodian"));
        cmd.env("CUSTODIAN_CONFIG_DIR", self.cfg.path())
            .env("CUSTODIAN_DATA_DIR", self.data.path())
            .env_remove("CUSTODIAN_NETWORK")
            .env_remove("RUST_LOG");
        cmd
    }
}

#[test]
fn paths_reports_the_overridden_dirs() -> eyre::Result<()> {
    let env = Env::new()?;
    let out = env.cmd().arg("paths").assert().success().get_output().clone();
    let v: serde_json::Value = serde_json::from_slice(&out.stdout)?;
    assert_eq!(
        v.get("data_dir").and_then(|x| x.as_str()),
        env.data.path().to_str()
    );
    assert_eq!(
        v.get("secure_store_dir").and_then(|x| x.as_str()),
        env.data.path().join("secure").to_str()
    );
    Ok(())
}

#[test]
fn keygen_prints_only_the_public_bundle() -> eyre::Result<()> {
    let env = Env::new()?;
    let out = env
        .cmd()
        .args(["keygen", "--network", "regtest"])
        .assert()
        .success()
        .get_output()
        .clone();
    let v: serde_json::Value = serde_json::from_slice(&out.stdout)?;
    assert_eq!(v.get("network_type").and_then(|x| x.as_str()), Some("regtest"));
    let spending = v
        .get("spending_key")
        .and_then(|x| x.as_str())
        .ok_or_else(|| eyre::eyre!("missing spending_key"))?;
    assert!(spending.contains("tpub"), "expected an extended public key: {spending}");
    assert!(v.get("recovery_auth_key").is_some_and(|x| !x.is_null()), "no recovery key");

    let text = String::from_utf8(out.stdout)?;
    assert!(!text.contains("tprv"), "private key material printed");

    // A second run reuses the machine secret and adds another bundle.
    env.cmd().args(["keygen", "--network", "regtest"]).assert().success();
    assert!(env.data.path().join("machine_secret.bin").is_file(), "machine secret missing");
    Ok(())
}

#[test]
fn keygen_rejects_unknown_networks() -> eyre::Result<()> {
    let env = Env::new()?;
    env.cmd()
        .args(["keygen", "--network", "dogecoin"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown bitcoin network"));
    Ok(())
}

#[tokio::test]
async fn backup_inspect_shows_metadata_without_secrets() -> eyre::Result<()> {
    let net = BitcoinNetworkType::Regtest;
    let store = SecureStore::in_memory();
    let private_keys = AppPrivateKeyDao::new(store.clone());
    let csek_dao = CsekDao::new(store.clone());
    let hw = HardwareFake::new(net)?;
    let f8e = F8eFake::new(Arc::new(ClockFake::default()));
    let config = KeyboxConfig {
        network_type: net,
        f8e_environment: F8eEnvironment::Staging,
        is_test_account: true,
        is_hardware_fake: true,
        is_using_socrec_fakes: false,
        delay_notify_duration_seconds: None,
    };
    let keybox = create_full_account(
        &AppKeysGenerator::new(private_keys.clone()),
        &hw,
        &f8e,
        &AuthTokenProviderFake::default(),
        config,
    )
    .await?;
    let sealed = generate_sealed_csek(&hw, &csek_dao).await?;
    let backup = FullAccountCloudBackupCreator::new(
        private_keys,
        csek_dao,
        Arc::new(SocRecKeysRepository::new(store)),
    )
    .create(&keybox, &sealed, &[])
    .await?;

    let env = Env::new()?;
    let file = env.data.path().join("backup.json");
    std::fs::write(&file, encode(&backup)?)?;

    let out = env
        .cmd()
        .args(["backup", "inspect"])
        .arg(&file)
        .assert()
        .success()
        .get_output()
        .clone();
    let v: serde_json::Value = serde_json::from_slice(&out.stdout)?;
    assert_eq!(v.get("version").and_then(serde_json::Value::as_u64), Some(2));
    assert_eq!(
        v.get("account_id").and_then(|x| x.as_str()),
        Some(keybox.full_account_id.0.as_str())
    );
    assert_eq!(v.get("bitcoin_network_type").and_then(|x| x.as_str()), Some("regtest"));
    assert!(v.get("full_account_fields").is_none(), "sealed fields printed");
    Ok(())
}

#[test]
fn backup_inspect_fails_closed_on_unknown_versions() -> eyre::Result<()> {
    let env = Env::new()?;
    let file = env.data.path().join("future.json");
    std::fs::write(&file, r#"{"version": 9, "account_id": "urn:acct:1"}"#)?;
    env.cmd()
        .args(["backup", "inspect"])
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported backup version 9"));

    let missing = env.data.path().join("unversioned.json");
    std::fs::write(&missing, r#"{"account_id": "urn:acct:1"}"#)?;
    env.cmd()
        .args(["backup", "inspect"])
        .arg(&missing)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no version tag"));
    Ok(())
}
