//! Logical shapes of the host-protocol messages the engine exchanges. Wire
//! framing onto USB is an external collaborator; an adapter maps these to
//! and from wire bytes.

use crate::error::ErrorKind;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestType {
    TxInput,
    TxOutput,
    TxMeta,
    TxFinished,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxRequest {
    pub request_type: RequestType,
    pub request_index: Option<u32>,
    /// Set only during the Phase-1 prev-tx sub-walk.
    pub tx_hash: Option<[u8; 32]>,
    pub serialized: Option<Serialized>,
}

impl TxRequest {
    pub fn input(request_index: u32) -> Self {
        Self {
            request_type: RequestType::TxInput,
            request_index: Some(request_index),
            tx_hash: None,
            serialized: None,
        }
    }

    pub fn output(request_index: u32) -> Self {
        Self {
            request_type: RequestType::TxOutput,
            request_index: Some(request_index),
            tx_hash: None,
            serialized: None,
        }
    }

    pub fn prev_meta(tx_hash: [u8; 32]) -> Self {
        Self {
            request_type: RequestType::TxMeta,
            request_index: None,
            tx_hash: Some(tx_hash),
            serialized: None,
        }
    }

    pub fn prev_input(request_index: u32, tx_hash: [u8; 32]) -> Self {
        Self {
            request_type: RequestType::TxInput,
            request_index: Some(request_index),
            tx_hash: Some(tx_hash),
            serialized: None,
        }
    }

    pub fn prev_output(request_index: u32, tx_hash: [u8; 32]) -> Self {
        Self {
            request_type: RequestType::TxOutput,
            request_index: Some(request_index),
            tx_hash: Some(tx_hash),
            serialized: None,
        }
    }

    pub fn finished() -> Self {
        Self {
            request_type: RequestType::TxFinished,
            request_index: None,
            tx_hash: None,
            serialized: None,
        }
    }

    pub fn with_serialized(mut self, serialized: Serialized) -> Self {
        self.serialized = Some(serialized);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Serialized {
    pub signature_index: Option<u32>,
    /// DER-encoded, no sighash byte appended.
    pub signature: Option<Vec<u8>>,
    pub serialized_tx: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InputScriptType {
    SpendAddress,
    SpendMultisig,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputScriptType {
    PayToAddress,
    PayToMultisig,
}

/// Absent on legacy hosts; the classifier handles that case directly.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressType {
    Spend,
    Change,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MultisigInfo {
    pub pubkeys: Vec<bitcoin::PublicKey>,
    pub signatures: Vec<Option<Vec<u8>>>,
    pub m: usize,
}

impl MultisigInfo {
    pub fn new(pubkeys: Vec<bitcoin::PublicKey>, m: usize) -> Self {
        let signatures = vec![None; pubkeys.len()];
        Self {
            pubkeys,
            signatures,
            m,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxInput {
    pub prev_hash: [u8; 32],
    pub prev_index: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub script_type: InputScriptType,
    pub address_n: Vec<u32>,
    pub amount: u64,
    pub multisig: Option<MultisigInfo>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TxOutput {
    pub amount: u64,
    pub script_type: OutputScriptType,
    pub address: Option<String>,
    pub address_n: Vec<u32>,
    pub has_address_type: bool,
    pub address_type: AddressType,
    pub multisig: Option<MultisigInfo>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BinOutput {
    pub amount: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxMeta {
    pub inputs_cnt: u32,
    pub outputs_cnt: u32,
    pub version: u32,
    pub lock_time: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TxAck {
    Input(TxInput),
    Output(TxOutput),
    BinOutput(BinOutput),
    Meta(TxMeta),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<crate::error::SigningError> for Failure {
    fn from(err: crate::error::SigningError) -> Self {
        Failure {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Completion is not a separate case, just a `Request` with `request_type`
/// `TxFinished` carrying the last signed fragment in `serialized`.
#[derive(Debug)]
pub enum StepOutcome {
    Request(TxRequest),
    Failed(Failure),
}
