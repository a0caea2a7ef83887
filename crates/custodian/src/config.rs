use crate::keys::BitcoinNetworkType;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_DELAY_PERIOD_SECONDS: u64 = 7 * 24 * 60 * 60;
pub const DEFAULT_INVITATION_EXPIRY_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Which server deployment the account lives on. Recorded in cloud backups so a restore
/// never talks to the wrong environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum F8eEnvironment {
    #[default]
    Production,
    Staging,
    Development,
    Local,
}

impl F8eEnvironment {
    pub const fn default_base_url(self) -> &'static str {
        match self {
            Self::Production => "https://api.bitkey.world",
            Self::Staging => "https://api.bitkeystaging.com",
            Self::Development => "https://api.dev.wallet.build",
            Self::Local => "http://localhost:8080",
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Development => "development",
            Self::Local => "local",
        }
    }
}

impl std::str::FromStr for F8eEnvironment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "staging" => Ok(Self::Staging),
            "development" | "dev" => Ok(Self::Development),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown f8e environment: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustodianConfig {
    pub network: BitcoinNetworkType,
    pub f8e_environment: F8eEnvironment,
    /// Overrides the environment's built-in URL when set.
    pub f8e_base_url: Option<String>,
    /// Esplora-compatible endpoints. Tried in order; later ones are fallbacks.
    pub esplora_base_urls: Vec<String>,
    pub http_timeout_seconds: u64,
    pub sync_interval_seconds: u64,
    /// Consecutive unused addresses scanned past the last used one on each chain.
    pub address_gap_limit: u32,
    pub recovery_poll_interval_seconds: u64,
    pub default_delay_period_seconds: u64,
    pub invitation_expiry_seconds: u64,

    pub is_test_account: bool,
    pub is_hardware_fake: bool,
    pub is_using_socrec_fakes: bool,
}

impl Default for CustodianConfig {
    fn default() -> Self {
        let network = BitcoinNetworkType::default();
        Self {
            network,
            f8e_environment: F8eEnvironment::default(),
            f8e_base_url: None,
            esplora_base_urls: default_esplora_urls(network),
            http_timeout_seconds: 10,
            sync_interval_seconds: 30,
            address_gap_limit: 20,
            recovery_poll_interval_seconds: 60,
            default_delay_period_seconds: DEFAULT_DELAY_PERIOD_SECONDS,
            invitation_expiry_seconds: DEFAULT_INVITATION_EXPIRY_SECONDS,
            is_test_account: false,
            is_hardware_fake: false,
            is_using_socrec_fakes: false,
        }
    }
}

pub fn default_esplora_urls(network: BitcoinNetworkType) -> Vec<String> {
    match network {
        BitcoinNetworkType::Bitcoin => vec![
            "https://blockstream.info/api".into(),
            "https://mempool.space/api".into(),
        ],
        BitcoinNetworkType::Testnet => vec![
            "https://blockstream.info/testnet/api".into(),
            "https://mempool.space/testnet/api".into(),
        ],
        BitcoinNetworkType::Signet => vec!["https://mempool.space/signet/api".into()],
        BitcoinNetworkType::Regtest => vec!["http://127.0.0.1:3002".into()],
    }
}

impl CustodianConfig {
    pub fn f8e_url(&self) -> &str {
        self.f8e_base_url
            .as_deref()
            .unwrap_or_else(|| self.f8e_environment.default_base_url())
    }

    pub const fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub const fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds)
    }

    pub const fn recovery_poll_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_poll_interval_seconds)
    }

    /// Reject endpoints that would send account material over plaintext to a remote host.
    pub fn validate(&self) -> eyre::Result<()> {
        ensure_https_or_loopback(self.f8e_url(), "f8e_base_url")?;
        if self.esplora_base_urls.is_empty() {
            eyre::bail!("esplora_base_urls must not be empty");
        }
        for u in &self.esplora_base_urls {
            ensure_https_or_loopback(u, "esplora_base_urls")?;
        }
        if self.sync_interval_seconds == 0 || self.recovery_poll_interval_seconds == 0 {
            eyre::bail!("poll intervals must be > 0");
        }
        if self.address_gap_limit == 0 {
            eyre::bail!("address_gap_limit must be > 0");
        }
        Ok(())
    }
}

fn is_loopback_http(url: &str) -> bool {
    fn host_prefix_ok(s: &str, prefix: &str) -> bool {
        if !s.starts_with(prefix) {
            return false;
        }
        matches!(s.as_bytes().get(prefix.len()), None | Some(b':' | b'/'))
    }
    let u = url.trim();
    host_prefix_ok(u, "http://127.0.0.1")
        || host_prefix_ok(u, "http://localhost")
        || host_prefix_ok(u, "http://[::1]")
}

pub fn ensure_https_or_loopback(url: &str, name: &str) -> eyre::Result<()> {
    let u = url.trim();
    if u.starts_with("https://") || is_loopback_http(u) {
        return Ok(());
    }
    eyre::bail!("{name} must use https (or http://localhost for local testing): {u}");
}
