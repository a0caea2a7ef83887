use aes_gcm::{
    aead::{Aead as _, KeyInit as _, Payload},
    Aes256Gcm, Nonce,
};
use base64::Engine as _;
use hkdf::Hkdf;
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

const CRYPTO_BOX_VERSION: u8 = 1;

/// AES-256-GCM ciphertext with its nonce, base64-encoded for JSON envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoBox {
    pub v: u8,
    pub nonce_b64: String,
    pub ct_b64: String,
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("unsupported CryptoBox version: {0}")]
    UnsupportedVersion(u8),

    #[error("malformed CryptoBox: {0}")]
    Malformed(String),

    #[error("aes-gcm encrypt failed")]
    Encrypt,

    #[error("aes-gcm decrypt failed (wrong key or tampered ciphertext)")]
    Decrypt,

    #[error("hkdf expand failed")]
    Hkdf,
}

pub fn fill_random(buf: &mut [u8]) {
    let mut rng = rand::rng();
    rng.fill_bytes(buf);
}

pub fn random_key32() -> [u8; 32] {
    let mut k = [0_u8; 32];
    fill_random(&mut k);
    k
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Derive a purpose-bound subkey from a 32-byte master secret.
pub fn derive_subkey(master: &[u8; 32], scope: &str, purpose: &str) -> Result<[u8; 32], CryptoError> {
    let hk = Hkdf::<Sha256>::new(None, master);
    let info = format!("custodian:{scope}:{purpose}");
    let mut out = [0_u8; 32];
    hk.expand(info.as_bytes(), &mut out)
        .map_err(|_e| CryptoError::Hkdf)?;
    Ok(out)
}

/// Encrypt `plaintext`, binding the ciphertext to `aad` (authenticated, not encrypted).
pub fn seal(key32: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<CryptoBox, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key32).map_err(|_e| CryptoError::Encrypt)?;
    let mut nonce = [0_u8; 12];
    fill_random(&mut nonce);
    let ct = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_e| CryptoError::Encrypt)?;

    Ok(CryptoBox {
        v: CRYPTO_BOX_VERSION,
        nonce_b64: base64::engine::general_purpose::STANDARD.encode(nonce),
        ct_b64: base64::engine::general_purpose::STANDARD.encode(ct),
    })
}

pub fn open(key32: &[u8; 32], b: &CryptoBox, aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if b.v != CRYPTO_BOX_VERSION {
        return Err(CryptoError::UnsupportedVersion(b.v));
    }
    let nonce = base64::engine::general_purpose::STANDARD
        .decode(&b.nonce_b64)
        .map_err(|e| CryptoError::Malformed(format!("nonce: {e}")))?;
    if nonce.len() != 12 {
        return Err(CryptoError::Malformed("nonce must be 12 bytes".to_owned()));
    }
    let ct = base64::engine::general_purpose::STANDARD
        .decode(&b.ct_b64)
        .map_err(|e| CryptoError::Malformed(format!("ciphertext: {e}")))?;

    let cipher = Aes256Gcm::new_from_slice(key32).map_err(|_e| CryptoError::Decrypt)?;
    cipher
        .decrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: ct.as_ref(),
                aad,
            },
        )
        .map_err(|_e| CryptoError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() -> eyre::Result<()> {
        let key = [7_u8; 32];
        let boxed = seal(&key, b"account keys", b"acct-1")?;
        assert_eq!(open(&key, &boxed, b"acct-1")?, b"account keys".to_vec());
        Ok(())
    }

    #[test]
    fn open_rejects_wrong_key_and_wrong_aad() -> eyre::Result<()> {
        let key = [7_u8; 32];
        let boxed = seal(&key, b"account keys", b"acct-1")?;
        assert!(matches!(
            open(&[8_u8; 32], &boxed, b"acct-1"),
            Err(CryptoError::Decrypt)
        ));
        assert!(matches!(
            open(&key, &boxed, b"acct-2"),
            Err(CryptoError::Decrypt)
        ));
        Ok(())
    }

    #[test]
    fn open_rejects_unknown_box_version() -> eyre::Result<()> {
        let key = [7_u8; 32];
        let mut boxed = seal(&key, b"x", b"")?;
        boxed.v = 9;
        assert!(matches!(
            open(&key, &boxed, b""),
            Err(CryptoError::UnsupportedVersion(9))
        ));
        Ok(())
    }

    #[test]
    fn subkeys_are_purpose_bound() -> eyre::Result<()> {
        let master = [1_u8; 32];
        let a = derive_subkey(&master, "store", "values")?;
        let b = derive_subkey(&master, "store", "other")?;
        assert_ne!(a, b);
        assert_eq!(a, derive_subkey(&master, "store", "values")?);
        Ok(())
    }
}
