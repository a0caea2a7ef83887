//! Key material for the three signing factors and the descriptor keys that combine them.

pub mod generator;
pub mod private_keys;

pub use generator::{
    derive_next_spending_key, generate_auth_keypair, next_spending_account_index, AppKeysGenerator,
    KeyBundleError,
};
pub use private_keys::AppPrivateKeyDao;

use crate::errors::KeyDerivationError;
use bitcoin::{
    bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub},
    secp256k1::{self, ecdsa, Message, PublicKey, Secp256k1, SecretKey},
    Network,
};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BitcoinNetworkType {
    #[default]
    Bitcoin,
    Testnet,
    Signet,
    Regtest,
}

impl BitcoinNetworkType {
    pub const fn network(self) -> Network {
        match self {
            Self::Bitcoin => Network::Bitcoin,
            Self::Testnet => Network::Testnet,
            Self::Signet => Network::Signet,
            Self::Regtest => Network::Regtest,
        }
    }

    /// BIP44 coin type: 0 on mainnet, 1 everywhere else.
    pub const fn coin_type(self) -> u32 {
        match self {
            Self::Bitcoin => 0,
            Self::Testnet | Self::Signet | Self::Regtest => 1,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bitcoin => "bitcoin",
            Self::Testnet => "testnet",
            Self::Signet => "signet",
            Self::Regtest => "regtest",
        }
    }
}

impl fmt::Display for BitcoinNetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BitcoinNetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bitcoin" | "mainnet" | "main" => Ok(Self::Bitcoin),
            "testnet" | "test" => Ok(Self::Testnet),
            "signet" => Ok(Self::Signet),
            "regtest" => Ok(Self::Regtest),
            other => Err(format!("unknown bitcoin network: {other}")),
        }
    }
}

/// `m/84'/coin'/account'` for a spending key.
pub fn spending_origin_path(
    network: BitcoinNetworkType,
    account: u32,
) -> Result<DerivationPath, KeyDerivationError> {
    Ok(DerivationPath::from(vec![
        ChildNumber::from_hardened_idx(84)?,
        ChildNumber::from_hardened_idx(network.coin_type())?,
        ChildNumber::from_hardened_idx(account)?,
    ]))
}

/// An account-level extended public key together with where it came from, rendered as
/// `[fingerprint/84'/coin'/account']xpub.../*`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescriptorPublicKey {
    pub origin_fingerprint: Fingerprint,
    pub origin_path: DerivationPath,
    pub xpub: Xpub,
}

impl DescriptorPublicKey {
    /// `(coin_type, account)` when the origin path has the `84'/coin'/account'` shape.
    fn bip84_parts(&self) -> Option<(u32, u32)> {
        match self.origin_path.as_ref() {
            [ChildNumber::Hardened { index: 84 }, ChildNumber::Hardened { index: coin }, ChildNumber::Hardened { index: account }] => {
                Some((*coin, *account))
            }
            _ => None,
        }
    }

    pub fn account_index(&self) -> Option<u32> {
        self.bip84_parts().map(|(_, account)| account)
    }

    pub fn coin_type(&self) -> Option<u32> {
        self.bip84_parts().map(|(coin, _)| coin)
    }

    /// Full path from the master key to the child at `chain/index`.
    pub fn full_path(&self, chain: u32, index: u32) -> Result<DerivationPath, KeyDerivationError> {
        Ok(self.origin_path.extend([
            ChildNumber::from_normal_idx(chain)?,
            ChildNumber::from_normal_idx(index)?,
        ]))
    }

    pub fn derive_child(
        &self,
        secp: &Secp256k1<secp256k1::All>,
        chain: u32,
        index: u32,
    ) -> Result<PublicKey, KeyDerivationError> {
        let path = [
            ChildNumber::from_normal_idx(chain)?,
            ChildNumber::from_normal_idx(index)?,
        ];
        Ok(self.xpub.derive_pub(secp, &path)?.public_key)
    }
}

impl fmt::Display for DescriptorPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}", self.origin_fingerprint)?;
        for cn in self.origin_path.as_ref() {
            write!(f, "/{cn}")?;
        }
        write!(f, "]{}/*", self.xpub)
    }
}

impl FromStr for DescriptorPublicKey {
    type Err = KeyDerivationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| KeyDerivationError::InvalidDescriptorKey {
            key: s.to_owned(),
            reason: reason.to_owned(),
        };
        let rest = s.trim().strip_prefix('[').ok_or_else(|| invalid("missing origin"))?;
        let (origin, key) = rest.split_once(']').ok_or_else(|| invalid("unterminated origin"))?;
        let mut parts = origin.split('/');
        let fp = parts
            .next()
            .ok_or_else(|| invalid("missing fingerprint"))?;
        let origin_fingerprint =
            Fingerprint::from_str(fp).map_err(|_e| invalid("bad fingerprint"))?;
        let path = parts
            .map(ChildNumber::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        let xpub_str = key.strip_suffix("/*").unwrap_or(key);
        let xpub = Xpub::from_str(xpub_str)?;
        Ok(Self {
            origin_fingerprint,
            origin_path: DerivationPath::from(path),
            xpub,
        })
    }
}

impl Serialize for DescriptorPublicKey {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DescriptorPublicKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A secp256k1 public key used to authenticate to the server. Hex on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AuthPublicKey(pub PublicKey);

impl AuthPublicKey {
    pub fn verify(&self, message: &[u8], signature_hex: &str) -> bool {
        let Ok(raw) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(sig) = ecdsa::Signature::from_der(&raw) else {
            return false;
        };
        let msg = Message::from_digest(crate::crypto::sha256(message));
        Secp256k1::verification_only()
            .verify_ecdsa(&msg, &sig, &self.0)
            .is_ok()
    }
}

impl fmt::Display for AuthPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0.serialize()))
    }
}

impl FromStr for AuthPublicKey {
    type Err = KeyDerivationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim()).map_err(|e| KeyDerivationError::InvalidDescriptorKey {
            key: s.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(Self(PublicKey::from_slice(&raw)?))
    }
}

impl Serialize for AuthPublicKey {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AuthPublicKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct AuthPrivateKey(pub SecretKey);

impl AuthPrivateKey {
    pub fn public_key(&self) -> AuthPublicKey {
        AuthPublicKey(PublicKey::from_secret_key(&Secp256k1::signing_only(), &self.0))
    }

    /// DER-encoded ECDSA signature over SHA-256(`message`), hex encoded.
    pub fn sign(&self, message: &[u8]) -> String {
        let msg = Message::from_digest(crate::crypto::sha256(message));
        let sig = Secp256k1::signing_only().sign_ecdsa(&msg, &self.0);
        hex::encode(sig.serialize_der())
    }
}

impl fmt::Debug for AuthPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthPrivateKey(<redacted>)")
    }
}

impl Serialize for AuthPrivateKey {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(self.0.secret_bytes()))
    }
}

impl<'de> Deserialize<'de> for AuthPrivateKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = zeroize::Zeroizing::new(String::deserialize(d)?);
        let raw = zeroize::Zeroizing::new(hex::decode(s.as_str()).map_err(serde::de::Error::custom)?);
        SecretKey::from_slice(&raw)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthKeypair {
    pub public_key: AuthPublicKey,
    pub private_key: AuthPrivateKey,
}

/// Master extended private key plus the mnemonic it was generated from.
pub struct ExtendedPrivateKey {
    pub xprv: Xpriv,
    pub mnemonic: SecretString,
}

impl ExtendedPrivateKey {
    pub fn fingerprint(&self) -> Fingerprint {
        self.xprv.fingerprint(&Secp256k1::signing_only())
    }
}

impl Clone for ExtendedPrivateKey {
    fn clone(&self) -> Self {
        Self {
            xprv: self.xprv,
            mnemonic: SecretString::new(self.mnemonic.expose_secret().into()),
        }
    }
}

impl PartialEq for ExtendedPrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.xprv == other.xprv
    }
}

impl fmt::Debug for ExtendedPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedPrivateKey")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct ExtendedPrivateKeyRepr {
    xprv: String,
    mnemonic: String,
}

impl Serialize for ExtendedPrivateKey {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        ExtendedPrivateKeyRepr {
            xprv: self.xprv.to_string(),
            mnemonic: self.mnemonic.expose_secret().to_owned(),
        }
        .serialize(s)
    }
}

impl<'de> Deserialize<'de> for ExtendedPrivateKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let repr = ExtendedPrivateKeyRepr::deserialize(d)?;
        let xprv = Xpriv::from_str(&repr.xprv).map_err(serde::de::Error::custom)?;
        Ok(Self {
            xprv,
            mnemonic: SecretString::new(repr.mnemonic.into()),
        })
    }
}

/// Public and private halves of a spending key. The private half is the master key; the
/// public half is the account-level descriptor key derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendingKeypair {
    pub public_key: DescriptorPublicKey,
    pub private_key: ExtendedPrivateKey,
}
