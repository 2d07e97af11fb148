//! Change-vs-spend classification.

use crate::protocol::{AddressType, OutputScriptType, TxOutput};

/// Tracks the multisig fingerprint shared by input 0, if it is a
/// `SPENDMULTISIG` input, used to recognise change back to the same group.
#[derive(Clone, Copy, Debug, Default)]
pub struct MultisigFingerprintState {
    fp: Option<[u8; 32]>,
    mismatch: bool,
}

impl MultisigFingerprintState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Input 0 establishes the fingerprint if it is SPENDMULTISIG.
    pub fn set_from_input0(&mut self, fp: [u8; 32]) {
        self.fp = Some(fp);
    }

    /// Any later input that is SPENDADDRESS, or whose multisig fingerprint
    /// differs, permanently disables multisig-change detection.
    pub fn observe_later_input(&mut self, fp: Option<[u8; 32]>) {
        match (self.fp, fp) {
            (Some(expected), Some(actual)) if expected == actual => {}
            _ => self.mismatch = true,
        }
    }

    pub fn fingerprint(&self) -> Option<[u8; 32]> {
        if self.mismatch {
            None
        } else {
            self.fp
        }
    }
}

/// Evaluate the three change/spend rules, in order, against one output.
pub fn is_change(output: &TxOutput, multisig_fp: &MultisigFingerprintState) -> bool {
    // Rule 1: multisig change, only while the group fingerprint is known and
    // uncontested.
    if output.script_type == OutputScriptType::PayToMultisig {
        if let (Some(expected), Some(info)) = (multisig_fp.fingerprint(), &output.multisig) {
            if let Some(actual) = multisig_info_fingerprint(info) {
                if actual == expected {
                    return true;
                }
            }
        }
    }

    // Rule 2: explicit address_type field.
    if output.has_address_type {
        return output.address_type == AddressType::Change
            && !output.address_n.is_empty()
            && output.script_type == OutputScriptType::PayToAddress;
    }

    // Rule 3: legacy path, no address_type field present at all.
    output.script_type == OutputScriptType::PayToAddress && !output.address_n.is_empty()
}

/// The exact bytes covered by a multisig fingerprint are an external-library
/// contract; we hash the ordered pubkey list plus the `m` threshold, which
/// is the one piece of the redeem script that must match bit-for-bit for
/// two outputs to belong to the same signer group.
pub(crate) fn multisig_info_fingerprint(info: &crate::protocol::MultisigInfo) -> Option<[u8; 32]> {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(&(info.m as u32).to_le_bytes());
    for pk in &info.pubkeys {
        hasher.update(&pk.to_bytes());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    Some(out)
}
