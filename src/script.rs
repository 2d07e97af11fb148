//! Script compiler: `scriptPubKey` bytes for an output, `scriptSig` bytes
//! for a signed input.
//!
//! Legacy (pre-segwit) P2PKH and bare-P2SH-multisig only, matching the
//! wire shapes in `protocol.rs`. Built with `bitcoin::blockdata::script`
//! directly rather than through a `miniscript::Descriptor`, the way
//! `thor::transaction` reaches for `miniscript` when it wants policy
//! compilation (witness descriptors) but falls back to hand-built
//! `Transaction`/`TxOut` values for everything else; a legacy multisig
//! redeem script is exactly that "everything else" case here.

use bitcoin::blockdata::opcodes::all::{OP_CHECKMULTISIG, OP_CHECKSIG};
use bitcoin::blockdata::script::Builder;
use bitcoin::{Address, Network, PublicKey, Script, SigHashType};

use crate::error::SigningError;
use crate::protocol::MultisigInfo;

/// `scriptPubKey` for a plain pay-to-pubkey-hash output/input.
pub fn p2pkh_script_pubkey(network: Network, pubkey: &PublicKey) -> Script {
    Address::p2pkh(pubkey, network).script_pubkey()
}

/// `scriptSig` that spends a P2PKH output: `<sig><pubkey>`.
pub fn p2pkh_script_sig(signature_der: &[u8], pubkey: &PublicKey) -> Script {
    let mut sig = signature_der.to_vec();
    sig.push(SigHashType::All as u8);

    Builder::new()
        .push_slice(&sig)
        .push_slice(&pubkey.to_bytes())
        .into_script()
}

/// `OP_m <pubkeys...> OP_n OP_CHECKMULTISIG` redeem script.
pub fn multisig_redeem_script(multisig: &MultisigInfo) -> Result<Script, SigningError> {
    if multisig.pubkeys.is_empty() || multisig.m == 0 || multisig.m > multisig.pubkeys.len() {
        return Err(SigningError::MissingMultisigInfo);
    }

    let mut builder = Builder::new().push_int(multisig.m as i64);
    for pk in &multisig.pubkeys {
        builder = builder.push_slice(&pk.to_bytes());
    }
    builder = builder
        .push_int(multisig.pubkeys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG);

    Ok(builder.into_script())
}

/// Bare-P2SH `scriptPubKey` wrapping the multisig redeem script.
pub fn multisig_script_pubkey(
    network: Network,
    multisig: &MultisigInfo,
) -> Result<Script, SigningError> {
    let redeem = multisig_redeem_script(multisig)?;
    Ok(Address::p2sh(&redeem, network).script_pubkey())
}

/// Partial `scriptSig` carrying only the signatures this device knows:
/// `OP_0 <sig...> <redeem_script>`. Slots for cosigners this device hasn't
/// signed for are left empty; the host merges partial scriptSigs from each
/// cosigner into the final one.
pub fn serialize_multisig_script_sig(multisig: &MultisigInfo) -> Result<Script, SigningError> {
    let redeem = multisig_redeem_script(multisig)
        .map_err(|_| SigningError::SerializeMultisigScript)?;

    let mut builder = Builder::new().push_int(0); // OP_CHECKMULTISIG off-by-one bug
    for sig in &multisig.signatures {
        if let Some(sig) = sig {
            let mut sig = sig.clone();
            sig.push(SigHashType::All as u8);
            builder = builder.push_slice(&sig);
        }
    }
    builder = builder.push_slice(redeem.as_bytes());

    Ok(builder.into_script())
}

/// Index of `pubkey` within the multisig pubkey list, or `None`.
pub fn multisig_pubkey_index(multisig: &MultisigInfo, pubkey: &PublicKey) -> Option<usize> {
    multisig.pubkeys.iter().position(|pk| pk == pubkey)
}
