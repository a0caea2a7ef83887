//! The account's keysets and key bundles, and the process-wide active record.

pub mod onboarding;
pub mod repository;

pub use onboarding::{create_full_account, OnboardingError};
pub use repository::ActiveKeyboxRepository;

use crate::{
    config::F8eEnvironment,
    keys::{AuthPublicKey, BitcoinNetworkType, DescriptorPublicKey},
};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FullAccountId(pub String);

impl fmt::Display for FullAccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The server's half of a keyset, as returned when the keyset is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct F8eSpendingKeyset {
    pub keyset_id: String,
    pub spending_public_key: DescriptorPublicKey,
}

/// A 2-of-3 spending policy over the app, hardware and server keys. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendingKeyset {
    pub local_id: String,
    pub network_type: BitcoinNetworkType,
    pub app_key: DescriptorPublicKey,
    pub hardware_key: DescriptorPublicKey,
    pub f8e_spending_keyset: F8eSpendingKeyset,
}

impl SpendingKeyset {
    pub fn keyset_id(&self) -> &str {
        &self.f8e_spending_keyset.keyset_id
    }

    pub fn keys(&self) -> [&DescriptorPublicKey; 3] {
        [
            &self.app_key,
            &self.hardware_key,
            &self.f8e_spending_keyset.spending_public_key,
        ]
    }

    /// Output descriptor for `chain` (0 receive, 1 change) in the usual miniscript notation.
    pub fn descriptor(&self, chain: u32) -> String {
        let [a, h, s] = self.keys().map(|k| {
            let rendered = k.to_string();
            let base = rendered.strip_suffix("/*").unwrap_or(&rendered).to_owned();
            format!("{base}/{chain}/*")
        });
        format!("wsh(sortedmulti(2,{a},{h},{s}))")
    }
}

/// The app factor's public keys. Private halves live in the app's secure store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppKeyBundle {
    pub local_id: String,
    pub spending_key: DescriptorPublicKey,
    pub auth_key: AuthPublicKey,
    pub recovery_auth_key: Option<AuthPublicKey>,
    pub network_type: BitcoinNetworkType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwKeyBundle {
    pub local_id: String,
    pub spending_key: DescriptorPublicKey,
    pub auth_key: AuthPublicKey,
    pub network_type: BitcoinNetworkType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboxConfig {
    pub network_type: BitcoinNetworkType,
    pub f8e_environment: F8eEnvironment,
    pub is_test_account: bool,
    pub is_hardware_fake: bool,
    pub is_using_socrec_fakes: bool,
    /// Shorter delay-notify window, honored by the server for test accounts only.
    #[serde(default)]
    pub delay_notify_duration_seconds: Option<u64>,
}

impl KeyboxConfig {
    pub fn from_config(cfg: &crate::config::CustodianConfig) -> Self {
        Self {
            network_type: cfg.network,
            f8e_environment: cfg.f8e_environment,
            is_test_account: cfg.is_test_account,
            is_hardware_fake: cfg.is_hardware_fake,
            is_using_socrec_fakes: cfg.is_using_socrec_fakes,
            delay_notify_duration_seconds: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keybox {
    pub local_id: String,
    pub full_account_id: FullAccountId,
    pub active_spending_keyset: SpendingKeyset,
    pub active_app_key_bundle: AppKeyBundle,
    pub active_hw_key_bundle: HwKeyBundle,
    /// Keysets retired by recovery, oldest first. Kept for history and sweep targeting.
    #[serde(default)]
    pub inactive_keysets: Vec<SpendingKeyset>,
    pub config: KeyboxConfig,
}

impl Keybox {
    /// Make `keyset` active, retiring the current one. The only way a keybox changes keysets.
    #[must_use]
    pub fn promote_keyset(
        mut self,
        keyset: SpendingKeyset,
        app_key_bundle: AppKeyBundle,
        hw_key_bundle: HwKeyBundle,
    ) -> Self {
        let retired = std::mem::replace(&mut self.active_spending_keyset, keyset);
        if retired.keyset_id() != self.active_spending_keyset.keyset_id()
            && !self
                .inactive_keysets
                .iter()
                .any(|k| k.keyset_id() == retired.keyset_id())
        {
            self.inactive_keysets.push(retired);
        }
        self.active_app_key_bundle = app_key_bundle;
        self.active_hw_key_bundle = hw_key_bundle;
        self
    }

    /// Every descriptor key this account has ever used, for deriving the next unused index.
    pub fn all_descriptor_keys(&self) -> Vec<String> {
        self.descriptor_public_keys()
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    pub fn descriptor_public_keys(&self) -> Vec<DescriptorPublicKey> {
        std::iter::once(&self.active_spending_keyset)
            .chain(self.inactive_keysets.iter())
            .flat_map(|ks| ks.keys().map(Clone::clone))
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::keys::{
        generate_auth_keypair,
        generator::{generate_master_key, spending_keypair_at},
    };

    /// A keybox with throwaway keys, for tests that only care about its shape.
    pub(crate) fn sample_keybox(network: BitcoinNetworkType) -> eyre::Result<Keybox> {
        let keyset = sample_keyset(network, "keyset-1")?;
        Ok(Keybox {
            local_id: "keybox-1".into(),
            full_account_id: FullAccountId("account-1".into()),
            active_app_key_bundle: AppKeyBundle {
                local_id: "app-bundle-1".into(),
                spending_key: keyset.app_key.clone(),
                auth_key: generate_auth_keypair()?.public_key,
                recovery_auth_key: Some(generate_auth_keypair()?.public_key),
                network_type: network,
            },
            active_hw_key_bundle: HwKeyBundle {
                local_id: "hw-bundle-1".into(),
                spending_key: keyset.hardware_key.clone(),
                auth_key: generate_auth_keypair()?.public_key,
                network_type: network,
            },
            active_spending_keyset: keyset,
            inactive_keysets: vec![],
            config: KeyboxConfig {
                network_type: network,
                f8e_environment: F8eEnvironment::Local,
                is_test_account: true,
                is_hardware_fake: true,
                is_using_socrec_fakes: true,
                delay_notify_duration_seconds: None,
            },
        })
    }

    pub(crate) fn sample_keyset(
        network: BitcoinNetworkType,
        keyset_id: &str,
    ) -> eyre::Result<SpendingKeyset> {
        let key = || -> eyre::Result<DescriptorPublicKey> {
            Ok(spending_keypair_at(&generate_master_key(network)?, network, 0)?.public_key)
        };
        Ok(SpendingKeyset {
            local_id: format!("local-{keyset_id}"),
            network_type: network,
            app_key: key()?,
            hardware_key: key()?,
            f8e_spending_keyset: F8eSpendingKeyset {
                keyset_id: keyset_id.to_owned(),
                spending_public_key: key()?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{test_support::*, *};

    #[test]
    fn promote_retires_the_old_keyset_once() -> eyre::Result<()> {
        let net = BitcoinNetworkType::Regtest;
        let kb = sample_keybox(net)?;
        let old = kb.active_spending_keyset.clone();
        let next = sample_keyset(net, "keyset-2")?;
        let app = kb.active_app_key_bundle.clone();
        let hw = kb.active_hw_key_bundle.clone();

        let kb = kb.promote_keyset(next.clone(), app.clone(), hw.clone());
        assert_eq!(kb.active_spending_keyset, next);
        assert_eq!(kb.inactive_keysets, vec![old.clone()]);

        // Re-promoting the same keyset must not retire it into its own history.
        let kb = kb.promote_keyset(next.clone(), app, hw);
        assert_eq!(kb.inactive_keysets, vec![old]);
        Ok(())
    }

    #[test]
    fn descriptor_names_all_three_keys() -> eyre::Result<()> {
        let ks = sample_keyset(BitcoinNetworkType::Regtest, "k")?;
        let d = ks.descriptor(0);
        assert!(d.starts_with("wsh(sortedmulti(2,["), "{d}");
        assert_eq!(d.matches("/0/*").count(), 3, "{d}");
        Ok(())
    }
}
