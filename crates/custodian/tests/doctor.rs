use std::process::Command;

use eyre::Context as _;

#[test]
fn doctor_json_runs_and_returns_valid_json() -> eyre::Result<()> {
    let exe = assert_cmd::cargo::cargo_bin!("custodian");

    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;

    let out = Command::new(exe)
        .env("CUSTODIAN_CONFIG_DIR", cfg_dir.path())
        .env("CUSTODIAN_DATA_DIR", data_dir.path())
        .args(["doctor", "--json"])
        .output()
        .context("run custodian doctor --json")?;

    assert!(
        out.status.success(),
        "doctor exited non-zero: status={:?}, stderr={}",
        out.status.code(),
        String::from_utf8_lossy(&out.stderr)
    );

    let v: serde_json::Value = serde_json::from_slice(&out.stdout).context("parse doctor json")?;
    assert_eq!(v.get("ok").and_then(serde_json::Value::as_bool), Some(true));
    assert!(v.get("version").and_then(|x| x.as_str()).is_some(), "version missing");
    assert!(v.get("paths").and_then(|x| x.as_object()).is_some(), "paths missing");
    assert_eq!(
        v.pointer("/secure_store/machine_secret_present")
            .and_then(serde_json::Value::as_bool),
        Some(false)
    );
    Ok(())
}

#[test]
fn doctor_never_prints_sealed_material() -> eyre::Result<()> {
    let exe = assert_cmd::cargo::cargo_bin!("custodian");
    let cfg_dir = tempfile::tempdir()?;
    let data_dir = tempfile::tempdir()?;

    let keygen = Command::new(exe)
        .env("CUSTODIAN_CONFIG_DIR", cfg_dir.path())
        .env("CUSTODIAN_DATA_DIR", data_dir.path())
        .args(["keygen", "--network", "regtest"])
        .output()
        .context("run custodian keygen")?;
    assert!(keygen.status.success(), "keygen failed: {}", String::from_utf8_lossy(&keygen.stderr));
    let secret = std::fs::read(data_dir.path().join("machine_secret.bin"))?;

    let out = Command::new(exe)
        .env("CUSTODIAN_CONFIG_DIR", cfg_dir.path())
        .env("CUSTODIAN_DATA_DIR", data_dir.path())
        .args(["doctor", "--json"])
        .output()
        .context("run custodian doctor --json")?;
    assert!(out.status.success(), "doctor failed");

    let v: serde_json::Value = serde_json::from_slice(&out.stdout)?;
    assert_eq!(
        v.pointer("/secure_store/machine_secret_present")
            .and_then(serde_json::Value::as_bool),
        Some(true)
    );
    assert!(
        v.pointer("/secure_store/sealed_entries")
            .and_then(serde_json::Value::as_u64)
            .is_some_and(|n| n >= 3),
        "keygen should have sealed spending, auth and recovery keys"
    );
    let text = String::from_utf8(out.stdout)?;
    assert!(!text.contains(&hex::encode(&secret)), "machine secret leaked");
    Ok(())
}
