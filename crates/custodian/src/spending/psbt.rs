use super::descriptor::REQUIRED_SIGNATURES;
use crate::keys::DescriptorPublicKey;
use base64::Engine as _;
use bitcoin::{Transaction, Txid, Witness};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Witness bytes of one fully signed 2-of-3 P2WSH input: item count, the empty
/// CHECKMULTISIG dummy, two DER signatures with length prefixes, the 105-byte script.
const MULTISIG_INPUT_WITNESS_WEIGHT: u64 = 1 + 1 + 2 * 73 + 1 + 105;
/// Segwit marker and flag.
const SEGWIT_MARKER_WEIGHT: u64 = 2;

#[derive(Debug, Error)]
pub enum PsbtError {
    #[error("invalid psbt: {0}")]
    Decode(String),

    #[error("psbt input {0} has no witness utxo")]
    MissingUtxo(usize),

    #[error("psbt input {input} has {have} of {REQUIRED_SIGNATURES} signatures")]
    NotEnoughSignatures { input: usize, have: usize },

    #[error("could not extract transaction: {0}")]
    Extract(String),
}

impl crate::errors::ErrorCode for PsbtError {
    fn code(&self) -> &'static str {
        match self {
            Self::Decode(_) => "psbt_decode",
            Self::MissingUtxo(_) => "psbt_missing_utxo",
            Self::NotEnoughSignatures { .. } => "psbt_not_enough_signatures",
            Self::Extract(_) => "psbt_extract",
        }
    }
}

/// Final vsize of `tx` once every input carries a 2-of-3 multisig witness.
pub fn estimated_vsize(tx: &Transaction) -> u64 {
    let inputs = u64::try_from(tx.input.len()).unwrap_or(u64::MAX);
    let witness = if inputs == 0 {
        0
    } else {
        SEGWIT_MARKER_WEIGHT + inputs.saturating_mul(MULTISIG_INPUT_WITNESS_WEIGHT)
    };
    // Unsigned inputs carry no witness, so this is the base weight only.
    tx.weight().to_wu().saturating_add(witness).div_ceil(4)
}

/// A partially signed transaction as it moves between factors.
///
/// The payload is the only record of who has signed; [`Psbt::has_signature_from`] reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Psbt {
    /// Txid of the unsigned transaction. Stable across signing.
    pub id: Txid,
    pub base64: String,
    pub fee_sats: u64,
    pub vsize: u64,
    pub num_inputs: usize,
    /// Value paid to the recipient.
    pub amount_sats: u64,
}

impl Psbt {
    pub fn from_inner(inner: &bitcoin::Psbt, amount_sats: u64) -> Result<Self, PsbtError> {
        let in_sum = inner
            .inputs
            .iter()
            .enumerate()
            .map(|(i, input)| {
                input
                    .witness_utxo
                    .as_ref()
                    .map(|u| u.value.to_sat())
                    .ok_or(PsbtError::MissingUtxo(i))
            })
            .sum::<Result<u64, _>>()?;
        let out_sum: u64 = inner.unsigned_tx.output.iter().map(|o| o.value.to_sat()).sum();
        let fee_sats = in_sum
            .checked_sub(out_sum)
            .ok_or_else(|| PsbtError::Decode("outputs exceed inputs".to_owned()))?;
        Ok(Self {
            id: inner.unsigned_tx.compute_txid(),
            base64: base64::engine::general_purpose::STANDARD.encode(inner.serialize()),
            fee_sats,
            vsize: estimated_vsize(&inner.unsigned_tx),
            num_inputs: inner.inputs.len(),
            amount_sats,
        })
    }

    pub fn to_inner(&self) -> Result<bitcoin::Psbt, PsbtError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(self.base64.trim())
            .map_err(|e| PsbtError::Decode(e.to_string()))?;
        bitcoin::Psbt::deserialize(&raw).map_err(|e| PsbtError::Decode(e.to_string()))
    }

    /// Same transaction with a new payload, e.g. after another factor signed.
    pub fn with_payload(&self, inner: &bitcoin::Psbt) -> Result<Self, PsbtError> {
        let next = Self::from_inner(inner, self.amount_sats)?;
        if next.id != self.id {
            return Err(PsbtError::Decode(format!(
                "signed psbt {} does not match {}",
                next.id, self.id
            )));
        }
        Ok(next)
    }

    /// Whether every input carries a signature from a child of `key`.
    pub fn has_signature_from(&self, key: &DescriptorPublicKey) -> Result<bool, PsbtError> {
        let inner = self.to_inner()?;
        if inner.inputs.is_empty() {
            return Ok(false);
        }
        Ok(inner.inputs.iter().all(|input| {
            input
                .bip32_derivation
                .iter()
                .filter(|(_, (fp, _))| *fp == key.origin_fingerprint)
                .any(|(pk, _)| {
                    input
                        .partial_sigs
                        .contains_key(&bitcoin::PublicKey::new(*pk))
                })
        }))
    }

    /// Fewest signatures on any input.
    pub fn min_signatures(&self) -> Result<usize, PsbtError> {
        let inner = self.to_inner()?;
        Ok(inner
            .inputs
            .iter()
            .map(|i| i.partial_sigs.len())
            .min()
            .unwrap_or_default())
    }

    /// Build final witnesses from the partial signatures and return the broadcastable
    /// transaction. Every input needs two signatures.
    pub fn finalize(&self) -> Result<Transaction, PsbtError> {
        let mut inner = self.to_inner()?;
        for (i, input) in inner.inputs.iter_mut().enumerate() {
            let witness_script = input
                .witness_script
                .clone()
                .ok_or_else(|| PsbtError::Decode(format!("input {i} has no witness script")))?;

            // CHECKMULTISIG wants signatures in the same order as the keys in the script.
            let mut keys: Vec<_> = input.bip32_derivation.keys().copied().collect();
            keys.sort_by_key(bitcoin::secp256k1::PublicKey::serialize);
            let sigs: Vec<Vec<u8>> = keys
                .iter()
                .filter_map(|pk| input.partial_sigs.get(&bitcoin::PublicKey::new(*pk)))
                .take(REQUIRED_SIGNATURES)
                .map(|s| s.to_vec())
                .collect();
            if sigs.len() < REQUIRED_SIGNATURES {
                return Err(PsbtError::NotEnoughSignatures {
                    input: i,
                    have: sigs.len(),
                });
            }

            let mut items: Vec<Vec<u8>> = Vec::with_capacity(REQUIRED_SIGNATURES + 2);
            items.push(vec![]);
            items.extend(sigs);
            items.push(witness_script.to_bytes());
            input.final_script_witness = Some(Witness::from_slice(&items));
            input.partial_sigs.clear();
            input.bip32_derivation.clear();
            input.witness_script = None;
            input.sighash_type = None;
        }
        inner
            .extract_tx()
            .map_err(|e| PsbtError::Extract(e.to_string()))
    }
}
