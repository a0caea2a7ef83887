use serde::Serialize;
use thiserror::Error;

/// A structured error suitable for printing from the CLI as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorReport {
    pub code: &'static str,
    pub message: String,
}

impl ErrorReport {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Stable, machine-readable identifier for an error kind.
pub trait ErrorCode {
    fn code(&self) -> &'static str;

    fn report(&self) -> ErrorReport
    where
        Self: std::fmt::Display,
    {
        ErrorReport::new(self.code(), self.to_string())
    }
}

/// Failure to derive or parse key material. Always fatal to the operation.
#[derive(Debug, Error)]
pub enum KeyDerivationError {
    #[error("bip32 derivation: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),

    #[error("secp256k1: {0}")]
    Secp256k1(#[from] bitcoin::secp256k1::Error),

    #[error("mnemonic: {0}")]
    Mnemonic(String),

    #[error("invalid descriptor public key `{key}`: {reason}")]
    InvalidDescriptorKey { key: String, reason: String },
}

impl ErrorCode for KeyDerivationError {
    fn code(&self) -> &'static str {
        match self {
            Self::Bip32(_) | Self::Secp256k1(_) | Self::Mnemonic(_) => "key_derivation_failed",
            Self::InvalidDescriptorKey { .. } => "invalid_descriptor_key",
        }
    }
}

/// Local persistence failure. `Read`/`Write` mean the store could not be reached;
/// `Decode` means a value was read but is not what we expected.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("secure store read failed for `{key}`: {reason}")]
    Read { key: String, reason: String },

    #[error("secure store write failed for `{key}`: {reason}")]
    Write { key: String, reason: String },

    #[error("stored value for `{key}` could not be decoded: {reason}")]
    Decode { key: String, reason: String },
}

impl ErrorCode for StorageError {
    fn code(&self) -> &'static str {
        match self {
            Self::Read { .. } => "storage_read_failed",
            Self::Write { .. } => "storage_write_failed",
            Self::Decode { .. } => "storage_decode_failed",
        }
    }
}
