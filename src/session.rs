//! The signing engine's state machine, the heart of the crate.
//!
//! `SigningSession` owns the three running SHA-256 contexts, the held
//! input, the running totals, and the `Stage` tag. `on_ack` is the single
//! entry point: it consumes one `TxAck`, advances `stage`, and returns
//! exactly one outbound step. There is no background task and no queued
//! work; suspension happens naturally between calls.

use std::str::FromStr;

use bitcoin::secp256k1::{All, Message, Secp256k1};
use bitcoin::{Address, Network};
use log::{debug, trace, warn};

use crate::classify::{self, multisig_info_fingerprint as multisig_fingerprint, MultisigFingerprintState};
use crate::codec::{CodecInput, CodecOutput, RunningHash, TxCodec};
use crate::coin::CoinParams;
use crate::confirm::ConfirmationProvider;
use crate::error::SigningError;
use crate::keys::{ActiveKey, RootNode};
use crate::protocol::{
    InputScriptType, OutputScriptType, Serialized, TxAck, TxInput, TxMeta, TxOutput, TxRequest,
};

const SIGHASH_ALL: u32 = 1;

fn ceil_div(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

/// Estimated transaction size in kB, used only for the fee-threshold check.
fn estimate_size_kb(inputs_count: u32, outputs_count: u32) -> u64 {
    let bytes = 148u64 * inputs_count as u64 + 34u64 * outputs_count as u64 + 10;
    ceil_div(bytes, 1000).max(1)
}

/// Seed bytes for `checksum_hash`/`sign_tx_hash`: the `(inputs_count,
/// outputs_count, version, lock_time)` 4-tuple.
fn seeded_hash(inputs_count: u32, outputs_count: u32) -> RunningHash {
    let mut h = RunningHash::new();
    h.update(&inputs_count.to_le_bytes());
    h.update(&outputs_count.to_le_bytes());
    h.update(&1u32.to_le_bytes()); // version
    h.update(&0u32.to_le_bytes()); // lock_time
    h
}

#[derive(Debug)]
enum Stage {
    Req1Input { idx1: u32 },
    Req2PrevMeta { idx1: u32 },
    Req2PrevInput { idx1: u32, idx2: u32, prev: TxMeta },
    Req2PrevOutput { idx1: u32, idx2: u32, prev: TxMeta },
    Req3Output { idx1: u32 },
    Req4Input { idx1: u32, idx2: u32 },
    Req4Output { idx1: u32, idx2: u32 },
    Req5Output { idx1: u32 },
}

pub(crate) struct SigningSession {
    inputs_count: u32,
    outputs_count: u32,
    coin: CoinParams,
    root: RootNode,
    secp: Secp256k1<All>,
    codec: TxCodec,
    stage: Stage,

    to_spend: u64,
    spending: u64,
    change_spend: u64,
    change_seen: bool,
    fee: u64,

    held_input: Option<TxInput>,

    checksum_hash: RunningHash,
    hash_check: Option<[u8; 32]>,

    prev_tx_hash: Option<RunningHash>,

    sign_tx_hash: Option<RunningHash>,
    output_emit_hash: RunningHash,

    multisig_fp: MultisigFingerprintState,
    active_key: ActiveKey,
}

impl SigningSession {
    pub fn start(
        inputs_count: u32,
        outputs_count: u32,
        coin: CoinParams,
        root: RootNode,
    ) -> (Self, TxRequest) {
        let codec = TxCodec::new(inputs_count, outputs_count, 1, 0);
        let session = Self {
            inputs_count,
            outputs_count,
            coin,
            root,
            secp: Secp256k1::new(),
            codec,
            stage: Stage::Req1Input { idx1: 0 },
            to_spend: 0,
            spending: 0,
            change_spend: 0,
            change_seen: false,
            fee: 0,
            held_input: None,
            checksum_hash: seeded_hash(inputs_count, outputs_count),
            hash_check: None,
            prev_tx_hash: None,
            sign_tx_hash: None,
            output_emit_hash: RunningHash::new(),
            multisig_fp: MultisigFingerprintState::new(),
            active_key: ActiveKey::empty(),
        };

        trace!(
            "signing session started: {} inputs, {} outputs",
            inputs_count,
            outputs_count
        );
        (session, TxRequest::input(0))
    }

    pub fn abort(&mut self) {
        self.active_key = ActiveKey::empty();
        self.held_input = None;
        debug!("signing session aborted, key material wiped");
    }

    /// Returns the next outbound request (completion is a request whose
    /// `request_type` is `TxFinished`), or `Err` on any terminal failure.
    pub fn on_ack(
        &mut self,
        ack: TxAck,
        confirm: &mut dyn ConfirmationProvider,
    ) -> Result<TxRequest, SigningError> {
        let network = self.coin.network;
        match std::mem::replace(&mut self.stage, Stage::Req1Input { idx1: 0 }) {
            Stage::Req1Input { idx1 } => self.handle_req1_input(idx1, ack),
            Stage::Req2PrevMeta { idx1 } => self.handle_req2_prev_meta(idx1, ack),
            Stage::Req2PrevInput { idx1, idx2, prev } => {
                self.handle_req2_prev_input(idx1, idx2, prev, ack)
            }
            Stage::Req2PrevOutput { idx1, idx2, prev } => {
                self.handle_req2_prev_output(idx1, idx2, prev, ack)
            }
            Stage::Req3Output { idx1 } => self.handle_req3_output(idx1, ack, confirm),
            Stage::Req4Input { idx1, idx2 } => self.handle_req4_input(idx1, idx2, ack),
            Stage::Req4Output { idx1, idx2 } => self.handle_req4_output(idx1, idx2, ack),
            Stage::Req5Output { idx1 } => self.handle_req5_output(idx1, ack, network),
        }
    }

    // ---- Phase 1 -------------------------------------------------------

    fn handle_req1_input(
        &mut self,
        idx1: u32,
        ack: TxAck,
    ) -> Result<TxRequest, SigningError> {
        let input = match ack {
            TxAck::Input(input) => input,
            _ => return Err(SigningError::SerializeInput),
        };

        self.checksum_hash.update(&checksum_input_bytes(&input));

        self.update_multisig_fp(idx1, &input)?;

        let prev_hash = input.prev_hash;
        self.held_input = Some(input);
        self.stage = Stage::Req2PrevMeta { idx1 };
        Ok(TxRequest::prev_meta(prev_hash))
    }

    fn update_multisig_fp(&mut self, idx1: u32, input: &TxInput) -> Result<(), SigningError> {
        match (idx1, input.script_type, &input.multisig) {
            (0, InputScriptType::SpendMultisig, Some(info)) => {
                let fp = multisig_fingerprint(info).ok_or(SigningError::MultisigFingerprint)?;
                self.multisig_fp.set_from_input0(fp);
            }
            (0, InputScriptType::SpendMultisig, None) => {
                return Err(SigningError::MultisigFingerprint);
            }
            (_, InputScriptType::SpendMultisig, Some(info)) => {
                self.multisig_fp.observe_later_input(multisig_fingerprint(info));
            }
            _ => self.multisig_fp.observe_later_input(None),
        }
        Ok(())
    }

    fn handle_req2_prev_meta(
        &mut self,
        idx1: u32,
        ack: TxAck,
    ) -> Result<TxRequest, SigningError> {
        let meta = match ack {
            TxAck::Meta(meta) => meta,
            _ => return Err(SigningError::InvalidPrevhash),
        };

        self.prev_tx_hash = Some(RunningHash::new());
        let prev_hash = self.held_input.as_ref().expect("held input set").prev_hash;

        if meta.inputs_cnt > 0 {
            self.stage = Stage::Req2PrevInput {
                idx1,
                idx2: 0,
                prev: meta,
            };
            Ok(TxRequest::prev_input(0, prev_hash))
        } else if meta.outputs_cnt > 0 {
            self.stage = Stage::Req2PrevOutput {
                idx1,
                idx2: 0,
                prev: meta,
            };
            Ok(TxRequest::prev_output(0, prev_hash))
        } else {
            Err(SigningError::InvalidPrevhash)
        }
    }

    fn handle_req2_prev_input(
        &mut self,
        idx1: u32,
        idx2: u32,
        prev: TxMeta,
        ack: TxAck,
    ) -> Result<TxRequest, SigningError> {
        let input = match ack {
            TxAck::Input(input) => input,
            _ => return Err(SigningError::SerializeInput),
        };

        let prev_codec = TxCodec::new(prev.inputs_cnt, prev.outputs_cnt, prev.version, prev.lock_time);
        self.prev_tx_hash
            .as_mut()
            .expect("prev_tx_hash initialised")
            .update(&prev_codec.encode_input(idx2, &raw_input_codec(&input)));

        let prev_hash = self.held_input.as_ref().expect("held input set").prev_hash;
        let next = idx2 + 1;
        if next < prev.inputs_cnt {
            self.stage = Stage::Req2PrevInput { idx1, idx2: next, prev };
            Ok(TxRequest::prev_input(next, prev_hash))
        } else if prev.outputs_cnt > 0 {
            self.stage = Stage::Req2PrevOutput { idx1, idx2: 0, prev };
            Ok(TxRequest::prev_output(0, prev_hash))
        } else {
            Err(SigningError::InvalidPrevhash)
        }
    }

    fn handle_req2_prev_output(
        &mut self,
        idx1: u32,
        idx2: u32,
        prev: TxMeta,
        ack: TxAck,
    ) -> Result<TxRequest, SigningError> {
        let output = match ack {
            TxAck::BinOutput(output) => output,
            _ => return Err(SigningError::SerializeOutput),
        };

        let prev_codec = TxCodec::new(prev.inputs_cnt, prev.outputs_cnt, prev.version, prev.lock_time);
        self.prev_tx_hash
            .as_mut()
            .expect("prev_tx_hash initialised")
            .update(&prev_codec.encode_output(
                idx2,
                prev.lock_time,
                &CodecOutput {
                    amount: output.amount,
                    script_pubkey: &output.script_pubkey,
                },
            ));

        let held = self.held_input.as_ref().expect("held input set");
        if idx2 == held.prev_index {
            self.to_spend += output.amount;
        }
        let prev_hash = held.prev_hash;

        let next = idx2 + 1;
        if next < prev.outputs_cnt {
            self.stage = Stage::Req2PrevOutput { idx1, idx2: next, prev };
            return Ok(TxRequest::prev_output(next, prev_hash));
        }

        let prev_tx_hash = self.prev_tx_hash.take().expect("prev_tx_hash initialised");
        let computed = prev_tx_hash.finalize_double();
        if computed != prev_hash {
            warn!("prevhash mismatch for input {}", idx1);
            return Err(SigningError::InvalidPrevhash);
        }

        let next_idx1 = idx1 + 1;
        if next_idx1 < self.inputs_count {
            self.stage = Stage::Req1Input { idx1: next_idx1 };
            Ok(TxRequest::input(next_idx1))
        } else {
            self.stage = Stage::Req3Output { idx1: 0 };
            Ok(TxRequest::output(0))
        }
    }

    fn handle_req3_output(
        &mut self,
        idx1: u32,
        ack: TxAck,
        confirm: &mut dyn ConfirmationProvider,
    ) -> Result<TxRequest, SigningError> {
        let output = match ack {
            TxAck::Output(output) => output,
            _ => return Err(SigningError::SerializeOutput),
        };

        let is_change = classify::is_change(&output, &self.multisig_fp);
        if is_change {
            if self.change_seen {
                return Err(SigningError::TooManyChangeOutputs);
            }
            self.change_seen = true;
            self.change_spend += output.amount;
        }
        self.spending += output.amount;

        let (script_pubkey, address) = compile_output(self.coin.network, &output)?;

        if !is_change && !confirm.confirm_transaction_output(output.amount, &address) {
            return Err(SigningError::CancelledByUser);
        }

        self.checksum_hash.update(&self.codec.encode_output(
            idx1,
            0,
            &CodecOutput {
                amount: output.amount,
                script_pubkey: script_pubkey.as_bytes(),
            },
        ));

        let next = idx1 + 1;
        if next < self.outputs_count {
            self.stage = Stage::Req3Output { idx1: next };
            return Ok(TxRequest::output(next));
        }

        self.hash_check = Some(std::mem::replace(&mut self.checksum_hash, RunningHash::new()).finalize());

        if self.spending > self.to_spend {
            return Err(SigningError::NotEnoughFunds);
        }
        self.fee = self.to_spend - self.spending;

        let threshold = estimate_size_kb(self.inputs_count, self.outputs_count) * self.coin.maxfee_kb;
        if self.fee > threshold && !confirm.confirm_fee_over_threshold(self.fee) {
            return Err(SigningError::FeeOverThreshold);
        }

        if !confirm.confirm_transaction(self.to_spend - self.change_spend, self.fee) {
            return Err(SigningError::CancelledByUser);
        }

        self.checksum_hash = seeded_hash(self.inputs_count, self.outputs_count);
        self.sign_tx_hash = Some(seeded_hash(self.inputs_count, self.outputs_count));
        self.stage = Stage::Req4Input { idx1: 0, idx2: 0 };
        Ok(TxRequest::input(0))
    }

    // ---- Phase 2 -------------------------------------------------------

    fn handle_req4_input(
        &mut self,
        idx1: u32,
        idx2: u32,
        ack: TxAck,
    ) -> Result<TxRequest, SigningError> {
        let input = match ack {
            TxAck::Input(input) => input,
            _ => return Err(SigningError::SerializeInput),
        };

        if idx2 == 0 {
            self.checksum_hash = seeded_hash(self.inputs_count, self.outputs_count);
            self.sign_tx_hash = Some(seeded_hash(self.inputs_count, self.outputs_count));
        }

        self.checksum_hash.update(&checksum_input_bytes(&input));

        let subscript = if idx2 == idx1 {
            let active = self.root.derive(&input.address_n, &self.secp)?;
            let subscript = match input.script_type {
                InputScriptType::SpendMultisig => {
                    let multisig = input
                        .multisig
                        .as_ref()
                        .ok_or(SigningError::MissingMultisigInfo)?;
                    crate::script::multisig_redeem_script(multisig)
                        .map_err(|_| SigningError::SerializeInput)?
                        .into_bytes()
                }
                InputScriptType::SpendAddress => {
                    crate::script::p2pkh_script_pubkey(self.coin.network, &active.pubkey)
                        .into_bytes()
                }
            };
            self.active_key = active;
            self.held_input = Some(input.clone());
            subscript
        } else {
            Vec::new()
        };

        self.sign_tx_hash.as_mut().expect("sign_tx_hash initialised").update(
            &self.codec.encode_input(
                idx2,
                &CodecInput {
                    prev_hash: &input.prev_hash,
                    prev_index: input.prev_index,
                    script_sig: &subscript,
                    sequence: input.sequence,
                },
            ),
        );

        let next = idx2 + 1;
        if next < self.inputs_count {
            self.stage = Stage::Req4Input { idx1, idx2: next };
            Ok(TxRequest::input(next))
        } else {
            self.stage = Stage::Req4Output { idx1, idx2: 0 };
            Ok(TxRequest::output(0))
        }
    }

    fn handle_req4_output(
        &mut self,
        idx1: u32,
        idx2: u32,
        ack: TxAck,
    ) -> Result<TxRequest, SigningError> {
        let output = match ack {
            TxAck::Output(output) => output,
            _ => return Err(SigningError::SerializeOutput),
        };

        let (script_pubkey, _) = compile_output(self.coin.network, &output)?;
        let codec_output = CodecOutput {
            amount: output.amount,
            script_pubkey: script_pubkey.as_bytes(),
        };
        self.checksum_hash
            .update(&self.codec.encode_output(idx2, 0, &codec_output));
        self.sign_tx_hash
            .as_mut()
            .expect("sign_tx_hash initialised")
            .update(&self.codec.encode_output(idx2, 0, &codec_output));

        let next = idx2 + 1;
        if next < self.outputs_count {
            self.stage = Stage::Req4Output { idx1, idx2: next };
            return Ok(TxRequest::output(next));
        }

        self.finish_signing_pass(idx1)
    }

    fn finish_signing_pass(&mut self, idx1: u32) -> Result<TxRequest, SigningError> {
        let mut sign_tx_hash = self.sign_tx_hash.take().expect("sign_tx_hash initialised");
        sign_tx_hash.update(&SIGHASH_ALL.to_le_bytes());
        let digest = sign_tx_hash.finalize_double();

        let checksum_hash = std::mem::replace(&mut self.checksum_hash, RunningHash::new());
        let hash = checksum_hash.finalize();
        if Some(hash) != self.hash_check {
            return Err(SigningError::ChecksumMismatch);
        }

        let held = self.held_input.clone().expect("held input set in REQ_4_INPUT");
        let message = Message::from_slice(&digest).map_err(|_| SigningError::Signing)?;
        let secret_key = self.active_key.secret_key()?;
        let mut sig = self.secp.sign(&message, &secret_key);
        sig.normalize_s();
        let sig_der = sig.serialize_der().to_vec();

        let final_script_sig = match held.script_type {
            InputScriptType::SpendMultisig => {
                let mut multisig = held
                    .multisig
                    .clone()
                    .ok_or(SigningError::MissingMultisigInfo)?;
                let pi = crate::script::multisig_pubkey_index(&multisig, &self.active_key.pubkey)
                    .ok_or(SigningError::PubkeyNotInMultisig)?;
                multisig.signatures[pi] = Some(sig_der.clone());
                crate::script::serialize_multisig_script_sig(&multisig)
                    .map_err(|_| SigningError::SerializeMultisigScript)?
            }
            InputScriptType::SpendAddress => {
                crate::script::p2pkh_script_sig(&sig_der, &self.active_key.pubkey)
            }
        };

        let emit_bytes = self.codec.encode_input(
            idx1,
            &CodecInput {
                prev_hash: &held.prev_hash,
                prev_index: held.prev_index,
                script_sig: final_script_sig.as_bytes(),
                sequence: held.sequence,
            },
        );
        self.output_emit_hash.update(&emit_bytes);

        self.active_key = ActiveKey::empty();

        let next = idx1 + 1;
        let next_request = if next < self.inputs_count {
            self.stage = Stage::Req4Input { idx1: next, idx2: 0 };
            TxRequest::input(next)
        } else {
            self.stage = Stage::Req5Output { idx1: 0 };
            TxRequest::output(0)
        };

        Ok(next_request.with_serialized(Serialized {
            signature_index: Some(idx1),
            signature: Some(sig_der),
            serialized_tx: emit_bytes,
        }))
    }

    fn handle_req5_output(
        &mut self,
        idx1: u32,
        ack: TxAck,
        network: Network,
    ) -> Result<TxRequest, SigningError> {
        let output = match ack {
            TxAck::Output(output) => output,
            _ => return Err(SigningError::SerializeOutput),
        };

        let (script_pubkey, _) = compile_output(network, &output)?;
        let emit_bytes = self.codec.encode_output(
            idx1,
            0,
            &CodecOutput {
                amount: output.amount,
                script_pubkey: script_pubkey.as_bytes(),
            },
        );
        self.output_emit_hash.update(&emit_bytes);

        let next = idx1 + 1;
        let next_request = if next < self.outputs_count {
            self.stage = Stage::Req5Output { idx1: next };
            TxRequest::output(next)
        } else {
            TxRequest::finished()
        };

        Ok(next_request.with_serialized(Serialized {
            signature_index: None,
            signature: None,
            serialized_tx: emit_bytes,
        }))
    }
}

fn raw_input_codec(input: &TxInput) -> CodecInput {
    CodecInput {
        prev_hash: &input.prev_hash,
        prev_index: input.prev_index,
        script_sig: &input.script_sig,
        sequence: input.sequence,
    }
}

/// The full "received form" of an input, hashed into `checksum_hash`.
/// Unlike the consensus-encoded bytes fed to `prev_tx_hash`/`sign_tx_hash`,
/// this also covers `address_n`, so a host returning a different
/// derivation path for the same input between Phase 1 and Phase 2 is
/// caught as "Transaction has changed during signing" instead of silently
/// re-deriving a different key.
fn checksum_input_bytes(input: &TxInput) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&input.prev_hash);
    out.extend_from_slice(&input.prev_index.to_le_bytes());
    out.extend_from_slice(&(input.script_sig.len() as u32).to_le_bytes());
    out.extend_from_slice(&input.script_sig);
    out.extend_from_slice(&input.sequence.to_le_bytes());
    out.push(match input.script_type {
        InputScriptType::SpendAddress => 0,
        InputScriptType::SpendMultisig => 1,
    });
    out.extend_from_slice(&(input.address_n.len() as u32).to_le_bytes());
    for n in &input.address_n {
        out.extend_from_slice(&n.to_le_bytes());
    }
    out.extend_from_slice(&input.amount.to_le_bytes());
    if let Some(multisig) = &input.multisig {
        out.push(1);
        out.extend_from_slice(&(multisig.m as u32).to_le_bytes());
        for pk in &multisig.pubkeys {
            out.extend_from_slice(&pk.to_bytes());
        }
    } else {
        out.push(0);
    }
    out
}

fn compile_output(
    network: Network,
    output: &TxOutput,
) -> Result<(bitcoin::Script, String), SigningError> {
    match output.script_type {
        OutputScriptType::PayToAddress => {
            let addr_str = output.address.clone().ok_or(SigningError::CompileOutput)?;
            let address =
                Address::from_str(&addr_str).map_err(|_| SigningError::CompileOutput)?;
            Ok((address.script_pubkey(), addr_str))
        }
        OutputScriptType::PayToMultisig => {
            let multisig = output
                .multisig
                .as_ref()
                .ok_or(SigningError::MissingMultisigInfo)?;
            let redeem = crate::script::multisig_redeem_script(multisig)
                .map_err(|_| SigningError::CompileOutput)?;
            let address = Address::p2sh(&redeem, network);
            Ok((address.script_pubkey(), address.to_string()))
        }
    }
}
