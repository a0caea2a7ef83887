use crate::{
    config::{default_esplora_urls, CustodianConfig},
    keys::BitcoinNetworkType,
    paths::CustodianPaths,
};
use eyre::Context as _;
use std::{fs, path::PathBuf};

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

/// Apply `CUSTODIAN_*` environment overrides on top of the loaded file.
fn apply_env_overrides(cfg: &mut CustodianConfig) -> eyre::Result<()> {
    fn env_nonempty(var: &str) -> Option<String> {
        std::env::var(var)
            .ok()
            .map(|v| v.trim().to_owned())
            .filter(|v| !v.is_empty())
    }

    if let Some(v) = env_nonempty("CUSTODIAN_NETWORK") {
        let network: BitcoinNetworkType = v
            .parse()
            .map_err(|e: String| eyre::eyre!(e))
            .context("CUSTODIAN_NETWORK")?;
        if network != cfg.network {
            cfg.network = network;
            cfg.esplora_base_urls = default_esplora_urls(network);
        }
    }
    if let Some(v) = env_nonempty("CUSTODIAN_F8E_BASE_URL") {
        cfg.f8e_base_url = Some(v);
    }
    if let Some(v) = env_nonempty("CUSTODIAN_ESPLORA_BASE_URLS") {
        cfg.esplora_base_urls = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned)
            .collect();
    }
    if let Some(v) = env_nonempty("CUSTODIAN_SYNC_INTERVAL_SECONDS") {
        if let Ok(n) = v.parse::<u64>() {
            if n > 0 {
                cfg.sync_interval_seconds = n;
            }
        }
    }
    Ok(())
}

impl ConfigStore {
    pub fn new(paths: &CustodianPaths) -> Self {
        Self {
            path: paths.config_path(),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn load_or_init_default(&self) -> eyre::Result<CustodianConfig> {
        let mut cfg = if self.path.exists() {
            let s = fs::read_to_string(&self.path).context("read config.toml")?;
            toml::from_str(&s).context("parse config.toml")?
        } else {
            let cfg = CustodianConfig::default();
            self.save(&cfg)?;
            cfg
        };
        apply_env_overrides(&mut cfg)?;
        cfg.validate().context("validate config")?;
        Ok(cfg)
    }

    pub fn save(&self, cfg: &CustodianConfig) -> eyre::Result<()> {
        let s = toml::to_string_pretty(cfg).context("serialize config.toml")?;
        crate::fsutil::write_private_atomic(&self.path, s.as_bytes())
            .context("write config.toml")?;
        Ok(())
    }
}
