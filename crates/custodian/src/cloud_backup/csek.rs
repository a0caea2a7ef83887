//! Cloud storage encryption key (CSEK): the symmetric key protecting backup contents.
//!
//! The plaintext key is only ever held locally. What travels with the backup is the
//! [`SealedCsek`], which only the hardware device can turn back into a [`Csek`].

use crate::{
    errors::{ErrorCode, StorageError},
    hardware::{HardwareError, HardwareFactor},
    secure_store::SecureStore,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Clone)]
pub struct Csek(Zeroizing<[u8; 32]>);

impl Csek {
    pub fn generate() -> Self {
        Self(Zeroizing::new(crate::crypto::random_key32()))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl PartialEq for Csek {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_slice() == other.0.as_slice()
    }
}

impl Eq for Csek {}

impl fmt::Debug for Csek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Csek(<redacted>)")
    }
}

/// A CSEK sealed by the hardware device. Hex on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedCsek(pub String);

/// Plaintext CSEKs the app currently holds, keyed by their sealed form.
///
/// Filled when the app generates a CSEK, or after the hardware unseals one during restore.
#[derive(Debug, Clone)]
pub struct CsekDao {
    store: SecureStore,
}

fn csek_key_name(sealed: &SealedCsek) -> String {
    format!("csek:{}", hex::encode(crate::crypto::sha256(sealed.0.as_bytes())))
}

impl CsekDao {
    pub const fn new(store: SecureStore) -> Self {
        Self { store }
    }

    pub async fn set(&self, sealed: &SealedCsek, csek: &Csek) -> Result<(), StorageError> {
        self.store
            .put_bytes(&csek_key_name(sealed), csek.as_bytes())
            .await
    }

    pub async fn get(&self, sealed: &SealedCsek) -> Result<Option<Csek>, StorageError> {
        let name = csek_key_name(sealed);
        let Some(raw) = self.store.get_bytes(&name).await?.map(Zeroizing::new) else {
            return Ok(None);
        };
        let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_e| StorageError::Decode {
            key: name,
            reason: format!("expected 32 bytes, got {}", raw.len()),
        })?;
        Ok(Some(Csek::from_bytes(bytes)))
    }

    pub async fn clear(&self, sealed: &SealedCsek) -> Result<(), StorageError> {
        self.store.remove(&csek_key_name(sealed)).await
    }
}

#[derive(Debug, Error)]
pub enum CsekError {
    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ErrorCode for CsekError {
    fn code(&self) -> &'static str {
        match self {
            Self::Hardware(e) => e.code(),
            Self::Storage(e) => e.code(),
        }
    }
}

/// New CSEK for a backup: the device seals it, the plaintext is kept for this session.
pub async fn generate_sealed_csek(
    hardware: &dyn HardwareFactor,
    dao: &CsekDao,
) -> Result<SealedCsek, CsekError> {
    let csek = Csek::generate();
    let sealed = hardware.seal_csek(&csek).await?;
    dao.set(&sealed, &csek).await?;
    Ok(sealed)
}

/// Ask the device to unseal `sealed` and cache the result, so a restore can proceed.
pub async fn unseal_and_cache_csek(
    hardware: &dyn HardwareFactor,
    dao: &CsekDao,
    sealed: &SealedCsek,
) -> Result<(), CsekError> {
    let csek = hardware.unseal_csek(sealed).await?;
    dao.set(sealed, &csek).await?;
    tracing::debug!("cached unsealed csek");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dao_is_keyed_by_sealed_form() -> eyre::Result<()> {
        let dao = CsekDao::new(SecureStore::in_memory());
        let csek = Csek::generate();
        let sealed = SealedCsek("aa".into());
        assert!(dao.get(&sealed).await?.is_none());

        dao.set(&sealed, &csek).await?;
        assert_eq!(dao.get(&sealed).await?, Some(csek));
        assert!(dao.get(&SealedCsek("bb".into())).await?.is_none());

        dao.clear(&sealed).await?;
        assert!(dao.get(&sealed).await?.is_none());
        Ok(())
    }

    #[test]
    fn debug_hides_key_bytes() {
        let csek = Csek::from_bytes([0xab; 32]);
        assert!(!format!("{csek:?}").contains("ab"));
    }
}
