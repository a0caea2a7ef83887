//! `wsh(sortedmulti(2, app, hw, server))` script derivation for a keyset.

use crate::{errors::KeyDerivationError, keybox::SpendingKeyset, keys::BitcoinNetworkType};
use bitcoin::{
    bip32::KeySource,
    opcodes::all::OP_CHECKMULTISIG,
    script::Builder,
    secp256k1::{All, PublicKey, Secp256k1},
    Address, ScriptBuf,
};

pub const RECEIVE_CHAIN: u32 = 0;
pub const CHANGE_CHAIN: u32 = 1;

/// Signatures needed to spend a keyset output.
pub const REQUIRED_SIGNATURES: usize = 2;
const THRESHOLD: i64 = 2;

/// One derived output script and everything a signer needs to find its keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedScript {
    pub chain: u32,
    pub index: u32,
    pub witness_script: ScriptBuf,
    pub script_pubkey: ScriptBuf,
    pub address: Address,
    /// Child keys in script order with their origin, for PSBT `bip32_derivation`.
    pub key_sources: Vec<(PublicKey, KeySource)>,
}

/// `2 <k1> <k2> <k3> 3 OP_CHECKMULTISIG` with keys sorted by their compressed encoding.
pub fn sortedmulti_witness_script(keys: &mut [PublicKey]) -> ScriptBuf {
    keys.sort_by_key(PublicKey::serialize);
    let builder = keys.iter().fold(
        Builder::new().push_int(THRESHOLD),
        |b, k| b.push_key(&bitcoin::PublicKey::new(*k)),
    );
    builder
        .push_int(i64::try_from(keys.len()).unwrap_or(i64::MAX))
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

pub fn derive_script(
    keyset: &SpendingKeyset,
    secp: &Secp256k1<All>,
    network: BitcoinNetworkType,
    chain: u32,
    index: u32,
) -> Result<DerivedScript, KeyDerivationError> {
    let mut key_sources = keyset
        .keys()
        .into_iter()
        .map(|k| {
            let child = k.derive_child(secp, chain, index)?;
            Ok((child, (k.origin_fingerprint, k.full_path(chain, index)?)))
        })
        .collect::<Result<Vec<_>, KeyDerivationError>>()?;
    key_sources.sort_by_key(|(pk, _)| pk.serialize());

    let mut keys: Vec<PublicKey> = key_sources.iter().map(|(pk, _)| *pk).collect();
    let witness_script = sortedmulti_witness_script(&mut keys);
    let address = Address::p2wsh(&witness_script, network.network());
    Ok(DerivedScript {
        chain,
        index,
        script_pubkey: address.script_pubkey(),
        witness_script,
        address,
        key_sources,
    })
}
