//! Versioned JSON envelope: `{"version": N, ...fields}`.
//!
//! Decoding reads the version first and only then parses the body with that version's
//! schema. Unknown versions are rejected outright.

use super::model::{CloudBackup, CloudBackupV2};
use crate::errors::ErrorCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SUPPORTED_VERSIONS: &[u64] = &[2];

#[derive(Debug, Error)]
pub enum BackupDecodeError {
    #[error("backup has no version tag")]
    MissingVersion,

    #[error("unsupported backup version {0}")]
    UnsupportedVersion(u64),

    #[error("malformed v{version} backup: {source}")]
    Malformed {
        version: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("backup is not JSON: {0}")]
    NotJson(#[source] serde_json::Error),
}

impl ErrorCode for BackupDecodeError {
    fn code(&self) -> &'static str {
        match self {
            Self::MissingVersion | Self::NotJson(_) => "backup_malformed",
            Self::UnsupportedVersion(_) => "backup_unsupported_version",
            Self::Malformed { .. } => "backup_decode_failed",
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a, T> {
    version: u32,
    #[serde(flatten)]
    body: &'a T,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: Option<u64>,
}

pub fn encode(backup: &CloudBackup) -> Result<String, serde_json::Error> {
    match backup {
        CloudBackup::V2(body) => serde_json::to_string(&Envelope {
            version: backup.version(),
            body,
        }),
    }
}

pub fn decode(raw: &str) -> Result<CloudBackup, BackupDecodeError> {
    let header: VersionHeader = serde_json::from_str(raw).map_err(BackupDecodeError::NotJson)?;
    match header.version {
        None => Err(BackupDecodeError::MissingVersion),
        Some(2) => serde_json::from_str::<CloudBackupV2>(raw)
            .map(CloudBackup::V2)
            .map_err(|source| BackupDecodeError::Malformed { version: 2, source }),
        Some(other) => Err(BackupDecodeError::UnsupportedVersion(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cloud_backup::{csek::SealedCsek, model::FullAccountFields},
        config::F8eEnvironment,
        crypto::{self, CryptoBox},
        keybox::FullAccountId,
        keys::{generate_auth_keypair, BitcoinNetworkType},
    };

    fn sample() -> eyre::Result<CloudBackup> {
        let ct: CryptoBox = crypto::seal(&[7_u8; 32], b"{}", b"test")?;
        Ok(CloudBackup::V2(CloudBackupV2 {
            account_id: FullAccountId("account-7".to_owned()),
            f8e_environment: F8eEnvironment::Staging,
            is_test_account: true,
            trusted_contact_identity_keypair: generate_auth_keypair()?,
            full_account_fields: FullAccountFields {
                sealed_hw_encryption_key: SealedCsek("00ff".to_owned()),
                hw_full_account_keys_ciphertext: ct,
                trusted_contacts: vec![],
                is_fake_hardware: true,
            },
            app_recovery_auth_keypair: generate_auth_keypair()?,
            is_using_socrec_fakes: false,
            bitcoin_network_type: BitcoinNetworkType::Signet,
        }))
    }

    #[test]
    fn envelope_carries_version_tag() -> eyre::Result<()> {
        let backup = sample()?;
        let json = encode(&backup)?;
        let v: serde_json::Value = serde_json::from_str(&json)?;
        assert_eq!(v["version"], 2);
        assert_eq!(v["account_id"], "account-7");
        assert_eq!(decode(&json)?, backup);
        Ok(())
    }

    #[test]
    fn unknown_versions_fail_closed() -> eyre::Result<()> {
        let json = encode(&sample()?)?;
        let mut v: serde_json::Value = serde_json::from_str(&json)?;
        v["version"] = serde_json::json!(3);
        assert!(matches!(
            decode(&v.to_string()),
            Err(BackupDecodeError::UnsupportedVersion(3))
        ));
        v["version"] = serde_json::json!(1);
        assert!(matches!(
            decode(&v.to_string()),
            Err(BackupDecodeError::UnsupportedVersion(1))
        ));
        Ok(())
    }

    #[test]
    fn missing_fields_and_tags_are_decode_errors() {
        assert!(matches!(
            decode(r#"{"account_id":"a"}"#),
            Err(BackupDecodeError::MissingVersion)
        ));
        assert!(matches!(
            decode(r#"{"version":2,"account_id":"a"}"#),
            Err(BackupDecodeError::Malformed { version: 2, .. })
        ));
        assert!(matches!(decode("not json"), Err(BackupDecodeError::NotJson(_))));
    }
}
