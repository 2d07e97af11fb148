//! Canonical byte layout for inputs and outputs, fed either into a running
//! hash or into an emit buffer.
//!
//! The codec tracks its own cursor so it knows when to prepend the
//! transaction-level varint counts (the first input carries `version` and
//! the input-count varint; the first output carries the output-count
//! varint; the last output carries `lock_time`). Callers invoke
//! `encode_input`/`encode_output` once per item, in order. Byte layout
//! follows Bitcoin's own consensus encoding, the same layout
//! `thor::transaction` relies on when it hands `TxIn`/`TxOut` to
//! `bitcoin::Transaction`'s own serializer; here we build it by hand a
//! field at a time, since the full transaction is never materialized.

use sha2::{Digest, Sha256};

/// A running SHA-256 context. Three of these coexist in a signing session:
/// `checksum_hash`, `prev_tx_hash`, `sign_tx_hash`.
#[derive(Clone)]
pub struct RunningHash(Sha256);

impl RunningHash {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    /// Single SHA-256 digest of everything written so far.
    pub fn finalize(self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.0.finalize());
        out
    }

    /// Double SHA-256 digest (txid / legacy sighash convention).
    pub fn finalize_double(self) -> [u8; 32] {
        let once = self.0.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(&once));
        out
    }
}

impl Default for RunningHash {
    fn default() -> Self {
        Self::new()
    }
}

fn write_varint(n: u64, out: &mut Vec<u8>) {
    if n < 0xfd {
        out.push(n as u8);
    } else if n <= 0xffff {
        out.push(0xfd);
        out.extend_from_slice(&(n as u16).to_le_bytes());
    } else if n <= 0xffff_ffff {
        out.push(0xfe);
        out.extend_from_slice(&(n as u32).to_le_bytes());
    } else {
        out.push(0xff);
        out.extend_from_slice(&n.to_le_bytes());
    }
}

/// One input's canonical fields, ready to serialize.
pub struct CodecInput<'a> {
    pub prev_hash: &'a [u8; 32],
    pub prev_index: u32,
    pub script_sig: &'a [u8],
    pub sequence: u32,
}

/// One output's canonical fields, ready to serialize.
pub struct CodecOutput<'a> {
    pub amount: u64,
    pub script_pubkey: &'a [u8],
}

/// Tracks where we are in the (header, inputs, outputs, locktime) byte
/// stream so the right varints land in the right place.
pub struct TxCodec {
    inputs_len: u32,
    outputs_len: u32,
    version: u32,
}

impl TxCodec {
    pub fn new(inputs_len: u32, outputs_len: u32, version: u32, _lock_time: u32) -> Self {
        Self {
            inputs_len,
            outputs_len,
            version,
        }
    }

    /// Serialize input `idx` (0-based). Prepends `version` and the
    /// input-count varint when `idx == 0`.
    pub fn encode_input(&self, idx: u32, input: &CodecInput) -> Vec<u8> {
        let mut out = Vec::new();
        if idx == 0 {
            out.extend_from_slice(&self.version.to_le_bytes());
            write_varint(self.inputs_len as u64, &mut out);
        }
        out.extend_from_slice(input.prev_hash);
        out.extend_from_slice(&input.prev_index.to_le_bytes());
        write_varint(input.script_sig.len() as u64, &mut out);
        out.extend_from_slice(input.script_sig);
        out.extend_from_slice(&input.sequence.to_le_bytes());
        out
    }

    /// Serialize output `idx` (0-based). Prepends the output-count varint
    /// when `idx == 0`; appends `lock_time` when `idx` is the last output.
    pub fn encode_output(&self, idx: u32, lock_time: u32, output: &CodecOutput) -> Vec<u8> {
        let mut out = Vec::new();
        if idx == 0 {
            write_varint(self.outputs_len as u64, &mut out);
        }
        out.extend_from_slice(&output.amount.to_le_bytes());
        write_varint(output.script_pubkey.len() as u64, &mut out);
        out.extend_from_slice(output.script_pubkey);
        if idx + 1 == self.outputs_len {
            out.extend_from_slice(&lock_time.to_le_bytes());
        }
        out
    }
}
