use crate::{config::CustodianConfig, paths::CustodianPaths};
use eyre::Context as _;
use serde_json::json;
use std::{fs, path::Path, path::PathBuf};

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

fn try_parse_config(path: &Path) -> eyre::Result<CustodianConfig> {
    let s = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CustodianConfig = toml::from_str(&s).context("parse config.toml")?;
    cfg.validate().context("validate config.toml")?;
    Ok(cfg)
}

struct PathsReport {
    config_dir: PathBuf,
    data_dir: PathBuf,
    log_file: PathBuf,
}

struct ConfigReport {
    path: PathBuf,
    exists: bool,
    parse_ok: bool,
    error: Option<String>,
    network: Option<String>,
    f8e_environment: Option<String>,
    f8e_url: Option<String>,
    esplora_count: usize,
    is_test_account: Option<bool>,
}

struct SecureStoreReport {
    dir: PathBuf,
    dir_exists: bool,
    sealed_entries: usize,
    machine_secret_present: bool,
}

struct DoctorReport {
    version: &'static str,
    paths: PathsReport,
    config: ConfigReport,
    secure_store: SecureStoreReport,
    env: serde_json::Value,
}

fn collect(paths: &CustodianPaths) -> DoctorReport {
    let config_path = paths.config_path();
    let config_exists = config_path.exists();
    let (config_ok, config_err, cfg) = if config_exists {
        match try_parse_config(&config_path) {
            Ok(cfg) => (true, None, Some(cfg)),
            Err(e) => (false, Some(format!("{e:#}")), None),
        }
    } else {
        (false, None, None)
    };

    // Entries are counted, never opened: the doctor must not need the machine secret.
    let store_dir = paths.secure_store_dir();
    let sealed_entries = fs::read_dir(&store_dir)
        .map(|rd| rd.filter_map(Result::ok).count())
        .unwrap_or(0);

    let env = json!({
      "CUSTODIAN_CONFIG_DIR": env_opt("CUSTODIAN_CONFIG_DIR"),
      "CUSTODIAN_DATA_DIR": env_opt("CUSTODIAN_DATA_DIR"),
      "CUSTODIAN_NETWORK": env_opt("CUSTODIAN_NETWORK"),
      "CUSTODIAN_F8E_BASE_URL": env_opt("CUSTODIAN_F8E_BASE_URL"),
      "CUSTODIAN_ESPLORA_BASE_URLS_set": env_opt("CUSTODIAN_ESPLORA_BASE_URLS").is_some(),
      "RUST_LOG": env_opt("RUST_LOG"),
    });

    DoctorReport {
        version: env!("CARGO_PKG_VERSION"),
        paths: PathsReport {
            config_dir: paths.config_dir.clone(),
            data_dir: paths.data_dir.clone(),
            log_file: paths.log_file.clone(),
        },
        config: ConfigReport {
            path: config_path,
            exists: config_exists,
            parse_ok: config_ok,
            error: config_err,
            network: cfg.as_ref().map(|c| c.network.to_string()),
            f8e_environment: cfg.as_ref().map(|c| c.f8e_environment.as_str().to_owned()),
            f8e_url: cfg.as_ref().map(|c| c.f8e_url().to_owned()),
            esplora_count: cfg.as_ref().map_or(0, |c| c.esplora_base_urls.len()),
            is_test_account: cfg.as_ref().map(|c| c.is_test_account),
        },
        secure_store: SecureStoreReport {
            dir_exists: store_dir.is_dir(),
            dir: store_dir,
            sealed_entries,
            machine_secret_present: paths.machine_secret_path().is_file(),
        },
        env,
    }
}

fn print_json(out: &mut impl std::io::Write, r: &DoctorReport) -> eyre::Result<()> {
    let s = serde_json::to_string_pretty(&json!({
      "ok": true,
      "version": r.version,
      "paths": {
        "config_dir": r.paths.config_dir,
        "data_dir": r.paths.data_dir,
        "log_file": r.paths.log_file,
      },
      "config": {
        "path": r.config.path,
        "exists": r.config.exists,
        "parse_ok": r.config.parse_ok,
        "error": r.config.error,
        "network": r.config.network,
        "is_test_account": r.config.is_test_account,
        "f8e": {
          "environment": r.config.f8e_environment,
          "url": r.config.f8e_url,
        },
        "esplora_count": r.config.esplora_count,
      },
      "secure_store": {
        "dir": r.secure_store.dir,
        "dir_exists": r.secure_store.dir_exists,
        "sealed_entries": r.secure_store.sealed_entries,
        "machine_secret_present": r.secure_store.machine_secret_present,
      },
      "env": r.env,
      "hints": [
        "If config.exists is false, any command that loads config writes the defaults on first run.",
        "If machine_secret_present is false, run `custodian keygen` to create it along with a first key bundle.",
        "Deleting the machine secret makes every sealed entry unreadable.",
      ]
    }))
    .context("serialize doctor json")?;
    writeln!(out, "{s}").context("write doctor json")?;
    Ok(())
}

fn print_human(out: &mut impl std::io::Write, r: &DoctorReport) -> eyre::Result<()> {
    writeln!(out, "Custodian doctor (v{})", r.version).context("write header")?;
    writeln!(out).context("write newline")?;

    writeln!(out, "Paths:").context("write paths header")?;
    writeln!(out, "  config_dir: {}", r.paths.config_dir.display()).context("write paths")?;
    writeln!(out, "  data_dir:   {}", r.paths.data_dir.display()).context("write paths")?;
    writeln!(out, "  log_file:   {}", r.paths.log_file.display()).context("write paths")?;
    writeln!(out).context("write newline")?;

    writeln!(out, "Config:").context("write config header")?;
    writeln!(out, "  config.toml: {}", r.config.path.display()).context("write config")?;
    if !r.config.exists {
        writeln!(out, "  status: missing (defaults are written on first run)")
            .context("write config")?;
    } else if r.config.parse_ok {
        writeln!(
            out,
            "  status: ok (network={}, f8e={}, esplora endpoints={})",
            r.config.network.as_deref().unwrap_or("?"),
            r.config.f8e_environment.as_deref().unwrap_or("?"),
            r.config.esplora_count
        )
        .context("write config")?;
        if let Some(url) = &r.config.f8e_url {
            writeln!(out, "  f8e_url: {url}").context("write config")?;
        }
    } else {
        writeln!(out, "  status: invalid").context("write config")?;
        if let Some(e) = &r.config.error {
            let first = e.lines().next().unwrap_or("parse error");
            writeln!(out, "  error: {first}").context("write config")?;
        }
    }
    writeln!(out).context("write newline")?;

    writeln!(out, "Secure store:").context("write store header")?;
    writeln!(out, "  dir: {}", r.secure_store.dir.display()).context("write store")?;
    writeln!(out, "  dir_exists: {}", r.secure_store.dir_exists).context("write store")?;
    writeln!(out, "  sealed_entries: {}", r.secure_store.sealed_entries).context("write store")?;
    writeln!(
        out,
        "  machine_secret_present: {}",
        r.secure_store.machine_secret_present
    )
    .context("write store")?;
    writeln!(out).context("write newline")?;

    writeln!(out, "Env (redacted):").context("write env header")?;
    for key in [
        "CUSTODIAN_CONFIG_DIR",
        "CUSTODIAN_DATA_DIR",
        "CUSTODIAN_NETWORK",
        "CUSTODIAN_F8E_BASE_URL",
    ] {
        writeln!(
            out,
            "  {key}: {:?}",
            r.env.get(key).and_then(|v| v.as_str())
        )
        .context("write env")?;
    }
    writeln!(
        out,
        "  CUSTODIAN_ESPLORA_BASE_URLS_set: {}",
        r.env
            .get("CUSTODIAN_ESPLORA_BASE_URLS_set")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    )
    .context("write env")?;
    Ok(())
}

pub fn run(paths: &CustodianPaths, as_json: bool) -> eyre::Result<()> {
    let report = collect(paths);
    let mut out = std::io::stdout().lock();
    if as_json {
        print_json(&mut out, &report)
    } else {
        print_human(&mut out, &report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_flags_an_invalid_config_without_failing() -> eyre::Result<()> {
        let cfg = tempfile::tempdir()?;
        let data = tempfile::tempdir()?;
        let paths = CustodianPaths::at(cfg.path().to_path_buf(), data.path().to_path_buf());
        fs::write(paths.config_path(), "network = 42\n")?;

        let report = collect(&paths);
        assert!(report.config.exists);
        assert!(!report.config.parse_ok);
        assert!(report.config.error.is_some());
        assert!(!report.secure_store.machine_secret_present);

        let mut buf = Vec::new();
        print_json(&mut buf, &report)?;
        let v: serde_json::Value = serde_json::from_slice(&buf)?;
        assert_eq!(v["config"]["parse_ok"], serde_json::Value::Bool(false));
        Ok(())
    }

    #[test]
    fn human_report_names_every_section() -> eyre::Result<()> {
        let cfg = tempfile::tempdir()?;
        let data = tempfile::tempdir()?;
        let paths = CustodianPaths::at(cfg.path().to_path_buf(), data.path().to_path_buf());

        let mut buf = Vec::new();
        print_human(&mut buf, &collect(&paths))?;
        let text = String::from_utf8(buf)?;
        for section in ["Paths:", "Config:", "Secure store:", "Env (redacted):"] {
            assert!(text.contains(section), "missing {section}");
        }
        Ok(())
    }
}
