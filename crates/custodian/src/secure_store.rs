//! Opaque encrypted key-value storage.
//!
//! Stands in for platform secure storage. The file backend keeps one sealed file per key so a
//! write to one key can never tear another; the memory backend backs fakes and tests.

use crate::{
    crypto::{self, CryptoBox},
    errors::StorageError,
    fsutil,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::Mutex;
use zeroize::Zeroizing;

#[derive(Debug)]
enum Backend {
    Memory(Mutex<HashMap<String, Vec<u8>>>),
    File {
        dir: PathBuf,
        key: Zeroizing<[u8; 32]>,
        // Serializes writers so a put racing a remove on the same key settles deterministically.
        lock: Mutex<()>,
    },
}

#[derive(Debug, Clone)]
pub struct SecureStore {
    backend: Arc<Backend>,
}

impl SecureStore {
    pub fn in_memory() -> Self {
        Self {
            backend: Arc::new(Backend::Memory(Mutex::new(HashMap::new()))),
        }
    }

    pub fn open_file(dir: &Path, machine_secret: &[u8; 32]) -> Result<Self, StorageError> {
        fsutil::ensure_private_dir(dir).map_err(|e| StorageError::Write {
            key: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        let key = crypto::derive_subkey(machine_secret, "secure-store", "values").map_err(|e| {
            StorageError::Read {
                key: "machine_secret".to_owned(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self {
            backend: Arc::new(Backend::File {
                dir: dir.to_path_buf(),
                key: Zeroizing::new(key),
                lock: Mutex::new(()),
            }),
        })
    }

    fn file_for(dir: &Path, key: &str) -> PathBuf {
        dir.join(hex::encode(crypto::sha256(key.as_bytes())))
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match &*self.backend {
            Backend::Memory(m) => Ok(m.lock().await.get(key).cloned()),
            Backend::File { dir, key: k, .. } => {
                let path = Self::file_for(dir, key);
                let Some(raw) = fsutil::read_private(&path).map_err(|e| StorageError::Read {
                    key: key.to_owned(),
                    reason: e.to_string(),
                })?
                else {
                    return Ok(None);
                };
                let boxed: CryptoBox =
                    serde_json::from_slice(&raw).map_err(|e| StorageError::Decode {
                        key: key.to_owned(),
                        reason: e.to_string(),
                    })?;
                let plain =
                    crypto::open(k, &boxed, key.as_bytes()).map_err(|e| StorageError::Decode {
                        key: key.to_owned(),
                        reason: e.to_string(),
                    })?;
                Ok(Some(plain))
            }
        }
    }

    pub async fn put_bytes(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        match &*self.backend {
            Backend::Memory(m) => {
                m.lock().await.insert(key.to_owned(), value.to_vec());
                Ok(())
            }
            Backend::File { dir, key: k, lock } => {
                let write_err = |reason: String| StorageError::Write {
                    key: key.to_owned(),
                    reason,
                };
                let boxed = crypto::seal(k, value, key.as_bytes()).map_err(|e| write_err(e.to_string()))?;
                let raw = serde_json::to_vec(&boxed).map_err(|e| write_err(e.to_string()))?;
                let _guard = lock.lock().await;
                fsutil::write_private_atomic(&Self::file_for(dir, key), &raw)
                    .map_err(|e| write_err(e.to_string()))
            }
        }
    }

    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match &*self.backend {
            Backend::Memory(m) => {
                m.lock().await.remove(key);
                Ok(())
            }
            Backend::File { dir, lock, .. } => {
                let _guard = lock.lock().await;
                fsutil::remove_if_exists(&Self::file_for(dir, key)).map_err(|e| {
                    StorageError::Write {
                        key: key.to_owned(),
                        reason: e.to_string(),
                    }
                })
            }
        }
    }

    pub async fn get_string(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.get_bytes(key)
            .await?
            .map(|b| {
                String::from_utf8(b).map_err(|e| StorageError::Decode {
                    key: key.to_owned(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    pub async fn put_string(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.put_bytes(key, value.as_bytes()).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        self.get_bytes(key)
            .await?
            .map(|b| {
                serde_json::from_slice(&b).map_err(|e| StorageError::Decode {
                    key: key.to_owned(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    pub async fn put_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let raw = Zeroizing::new(serde_json::to_vec(value).map_err(|e| StorageError::Write {
            key: key.to_owned(),
            reason: e.to_string(),
        })?);
        self.put_bytes(key, &raw).await
    }
}

/// Load the 32-byte machine secret, creating it on first use.
///
/// Creation holds an exclusive lock on a sibling `.lock` file: two processes racing here must
/// agree on one secret, or whatever the loser sealed becomes unreadable.
pub fn load_or_create_machine_secret(path: &Path) -> eyre::Result<Zeroizing<[u8; 32]>> {
    use eyre::Context as _;
    use fs2::FileExt as _;

    let lock_path = path.with_extension("lock");
    if let Some(parent) = lock_path.parent() {
        fsutil::ensure_private_dir(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let lock = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("open {}", lock_path.display()))?;
    lock.lock_exclusive().context("lock machine secret")?;

    let result = read_or_create_secret(path);
    fs2::FileExt::unlock(&lock).context("unlock machine secret")?;
    result
}

fn read_or_create_secret(path: &Path) -> eyre::Result<Zeroizing<[u8; 32]>> {
    use eyre::Context as _;

    let existing =
        fsutil::read_private(path).with_context(|| format!("read {}", path.display()))?;
    if let Some(raw) = existing.map(Zeroizing::new) {
        let arr: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_e| eyre::eyre!("machine secret at {} is not 32 bytes", path.display()))?;
        return Ok(Zeroizing::new(arr));
    }

    let secret = Zeroizing::new(crypto::random_key32());
    fsutil::write_private_atomic(path, secret.as_slice())
        .with_context(|| format!("write {}", path.display()))?;
    tracing::info!(path = %path.display(), "created machine secret");
    Ok(secret)
}
