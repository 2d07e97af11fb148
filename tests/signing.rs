//! End-to-end walk of the signing engine, driven the way a host adapter
//! would: feed one ack, read the next request, repeat. No USB framing and
//! no real blockchain data; previous-transaction hashes are built with the
//! crate's own codec, the same way the session computes them internally.

use std::str::FromStr;

use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::util::bip32::ExtendedPrivKey;
use bitcoin::{Address, Network};

use coldsign_core::codec::{CodecInput, CodecOutput, RunningHash, TxCodec};
use coldsign_core::protocol::{
    AddressType, BinOutput, InputScriptType, OutputScriptType, RequestType, TxAck, TxInput,
    TxMeta, TxOutput, TxRequest,
};
use coldsign_core::{CoinParams, ConfirmationProvider, Engine, RootNode, StepOutcome};

const TEST_XPRV: &str = "tprv8ZgxMBicQKsPd9TeAdPADNnSyH9SSUUbTVeFszDE23Ki6TBB5nCefAdHkK8Fm3qMQR6sHwA56zqRmKmxnHk37JkiFzvncDqoKmPWubu7hDF";

fn test_root() -> RootNode {
    RootNode::new(ExtendedPrivKey::from_str(TEST_XPRV).unwrap())
}

fn derive_address(root: &RootNode, secp: &Secp256k1<All>, path: &[u32], network: Network) -> String {
    let key = root.derive(path, secp).unwrap();
    Address::p2pkh(&key.pubkey, network).to_string()
}

/// A host-side confirmation stub whose answers are fixed per test.
struct ScriptedConfirm {
    output: bool,
    fee: bool,
    total: bool,
}

impl Default for ScriptedConfirm {
    fn default() -> Self {
        Self {
            output: true,
            fee: true,
            total: true,
        }
    }
}

impl ConfirmationProvider for ScriptedConfirm {
    fn confirm_transaction_output(&mut self, _amount: u64, _to_address: &str) -> bool {
        self.output
    }
    fn confirm_fee_over_threshold(&mut self, _fee: u64) -> bool {
        self.fee
    }
    fn confirm_transaction(&mut self, _total_amount: u64, _fee: u64) -> bool {
        self.total
    }
}

fn expect_request(outcome: StepOutcome) -> TxRequest {
    match outcome {
        StepOutcome::Request(req) => req,
        StepOutcome::Failed(f) => panic!("unexpected failure: {:?}", f),
    }
}

fn expect_failure(outcome: StepOutcome) -> coldsign_core::protocol::Failure {
    match outcome {
        StepOutcome::Failed(f) => f,
        StepOutcome::Request(req) => panic!("expected a failure, got {:?}", req),
    }
}

/// Hash of a synthetic one-input/one-output previous transaction, computed
/// the same way `handle_req2_prev_input`/`handle_req2_prev_output` do.
fn synthetic_prev_tx_hash(
    prev_input_hash: [u8; 32],
    prev_input_index: u32,
    output_amount: u64,
    output_script: &[u8],
) -> [u8; 32] {
    let codec = TxCodec::new(1, 1, 1, 0);
    let mut hash = RunningHash::new();
    hash.update(&codec.encode_input(
        0,
        &CodecInput {
            prev_hash: &prev_input_hash,
            prev_index: prev_input_index,
            script_sig: &[],
            sequence: 0xFFFF_FFFF,
        },
    ));
    hash.update(&codec.encode_output(
        0,
        0,
        &CodecOutput {
            amount: output_amount,
            script_pubkey: output_script,
        },
    ));
    hash.finalize_double()
}

const SPEND_PATH: [u32; 5] = [0x8000_002c, 0x8000_0000, 0x8000_0000, 0, 0];
const PREV_OUTPOINT: [u8; 32] = [9u8; 32];

struct Fixture {
    root: RootNode,
    coin: CoinParams,
    dest_address: String,
    prev_output_script: Vec<u8>,
    input_amount: u64,
}

impl Fixture {
    fn new() -> Self {
        let secp = Secp256k1::new();
        let root = test_root();
        let network = Network::Testnet;
        let dest_address = derive_address(
            &root,
            &secp,
            &[0x8000_002c, 0x8000_0000, 0x8000_0000, 0, 1],
            network,
        );
        Self {
            root,
            coin: CoinParams::bitcoin_testnet(),
            dest_address,
            prev_output_script: vec![0xAA; 25],
            input_amount: 100_000,
        }
    }

    fn input(&self, prev_hash: [u8; 32]) -> TxInput {
        TxInput {
            prev_hash,
            prev_index: 0,
            script_sig: vec![],
            sequence: 0xFFFF_FFFF,
            script_type: InputScriptType::SpendAddress,
            address_n: SPEND_PATH.to_vec(),
            amount: self.input_amount,
            multisig: None,
        }
    }

    fn change_output(&self, amount: u64, address_n: Vec<u32>) -> TxOutput {
        TxOutput {
            amount,
            script_type: OutputScriptType::PayToAddress,
            address: Some(self.dest_address.clone()),
            address_n,
            has_address_type: false,
            address_type: AddressType::Spend,
            multisig: None,
        }
    }

    fn spend_output(&self, amount: u64) -> TxOutput {
        self.change_output(amount, vec![])
    }

    fn prev_meta(&self) -> TxMeta {
        TxMeta {
            inputs_cnt: 1,
            outputs_cnt: 1,
            version: 1,
            lock_time: 0,
        }
    }

    fn prev_input(&self) -> TxInput {
        TxInput {
            prev_hash: PREV_OUTPOINT,
            prev_index: 0,
            script_sig: vec![],
            sequence: 0xFFFF_FFFF,
            script_type: InputScriptType::SpendAddress,
            address_n: vec![],
            amount: 0,
            multisig: None,
        }
    }

    fn prev_bin_output(&self) -> BinOutput {
        BinOutput {
            amount: self.input_amount,
            script_pubkey: self.prev_output_script.clone(),
        }
    }

    fn real_prev_hash(&self) -> [u8; 32] {
        synthetic_prev_tx_hash(PREV_OUTPOINT, 0, self.input_amount, &self.prev_output_script)
    }
}

#[test]
fn full_single_input_output_signing_flow() {
    let _ = env_logger::try_init();
    let fx = Fixture::new();
    let prev_hash = fx.real_prev_hash();
    let input = fx.input(prev_hash);
    let output = fx.spend_output(90_000);

    let mut engine = Engine::new();
    let mut confirm = ScriptedConfirm::default();

    let req = engine.start(1, 1, fx.coin, fx.root.clone()).unwrap();
    assert_eq!(req.request_type, RequestType::TxInput);
    assert_eq!(req.request_index, Some(0));

    // Phase 1: declare the input, then walk its previous transaction.
    let req = expect_request(engine.on_ack(TxAck::Input(input.clone()), &mut confirm));
    assert_eq!(req.request_type, RequestType::TxMeta);
    assert_eq!(req.tx_hash, Some(prev_hash));

    let req = expect_request(engine.on_ack(TxAck::Meta(fx.prev_meta()), &mut confirm));
    assert_eq!(req.request_type, RequestType::TxInput);
    assert_eq!(req.tx_hash, Some(prev_hash));

    let req = expect_request(engine.on_ack(TxAck::Input(fx.prev_input()), &mut confirm));
    assert_eq!(req.request_type, RequestType::TxOutput);
    assert_eq!(req.tx_hash, Some(prev_hash));

    let req = expect_request(engine.on_ack(TxAck::BinOutput(fx.prev_bin_output()), &mut confirm));
    assert_eq!(req.request_type, RequestType::TxOutput);
    assert_eq!(req.request_index, Some(0));
    assert!(req.tx_hash.is_none());

    // Still phase 1: declare the output the host wants signed.
    let req = expect_request(engine.on_ack(TxAck::Output(output.clone()), &mut confirm));
    assert_eq!(req.request_type, RequestType::TxInput);
    assert_eq!(req.request_index, Some(0));

    // Phase 2: re-walk the input, derive the key, get a signature back
    // attached to the request for the output that follows it.
    let req = expect_request(engine.on_ack(TxAck::Input(input), &mut confirm));
    assert_eq!(req.request_type, RequestType::TxOutput);
    assert_eq!(req.request_index, Some(0));

    let req = expect_request(engine.on_ack(TxAck::Output(output.clone()), &mut confirm));
    assert_eq!(req.request_type, RequestType::TxOutput);
    let fragment = req.serialized.expect("signed input fragment attached");
    assert_eq!(fragment.signature_index, Some(0));
    assert!(fragment.signature.is_some());
    assert!(!fragment.serialized_tx.is_empty());

    // Phase 3: re-walk the output once more to emit its signed fragment.
    let req = expect_request(engine.on_ack(TxAck::Output(output), &mut confirm));
    assert_eq!(req.request_type, RequestType::TxFinished);
    let fragment = req.serialized.expect("final output fragment attached");
    assert!(fragment.signature.is_none());
    assert!(!fragment.serialized_tx.is_empty());

    assert!(!engine.is_active());
}

#[test]
fn too_many_change_outputs_is_rejected() {
    let fx = Fixture::new();
    let prev_hash = fx.real_prev_hash();
    let input = fx.input(prev_hash);
    let mut engine = Engine::new();
    let mut confirm = ScriptedConfirm::default();

    engine.start(1, 2, fx.coin, fx.root.clone()).unwrap();
    expect_request(engine.on_ack(TxAck::Input(input), &mut confirm));
    expect_request(engine.on_ack(TxAck::Meta(fx.prev_meta()), &mut confirm));
    expect_request(engine.on_ack(TxAck::Input(fx.prev_input()), &mut confirm));
    expect_request(engine.on_ack(TxAck::BinOutput(fx.prev_bin_output()), &mut confirm));

    expect_request(engine.on_ack(TxAck::Output(fx.change_output(40_000, vec![0])), &mut confirm));
    let failure = expect_failure(engine.on_ack(
        TxAck::Output(fx.change_output(40_000, vec![1])),
        &mut confirm,
    ));
    assert_eq!(failure.message, "Only one change output allowed");
    assert!(!engine.is_active());
}

#[test]
fn outputs_exceeding_inputs_is_rejected() {
    let fx = Fixture::new();
    let prev_hash = fx.real_prev_hash();
    let input = fx.input(prev_hash);
    let mut engine = Engine::new();
    let mut confirm = ScriptedConfirm::default();

    engine.start(1, 1, fx.coin, fx.root.clone()).unwrap();
    expect_request(engine.on_ack(TxAck::Input(input), &mut confirm));
    expect_request(engine.on_ack(TxAck::Meta(fx.prev_meta()), &mut confirm));
    expect_request(engine.on_ack(TxAck::Input(fx.prev_input()), &mut confirm));
    expect_request(engine.on_ack(TxAck::BinOutput(fx.prev_bin_output()), &mut confirm));

    let failure = expect_failure(engine.on_ack(
        TxAck::Output(fx.spend_output(200_000)),
        &mut confirm,
    ));
    assert_eq!(failure.kind, coldsign_core::ErrorKind::NotEnoughFunds);
    assert!(!engine.is_active());
}

#[test]
fn user_rejecting_the_spend_cancels_signing() {
    let fx = Fixture::new();
    let prev_hash = fx.real_prev_hash();
    let input = fx.input(prev_hash);
    let mut engine = Engine::new();
    let mut confirm = ScriptedConfirm {
        output: false,
        ..Default::default()
    };

    engine.start(1, 1, fx.coin, fx.root.clone()).unwrap();
    expect_request(engine.on_ack(TxAck::Input(input), &mut confirm));
    expect_request(engine.on_ack(TxAck::Meta(fx.prev_meta()), &mut confirm));
    expect_request(engine.on_ack(TxAck::Input(fx.prev_input()), &mut confirm));
    expect_request(engine.on_ack(TxAck::BinOutput(fx.prev_bin_output()), &mut confirm));

    let failure = expect_failure(engine.on_ack(TxAck::Output(fx.spend_output(90_000)), &mut confirm));
    assert_eq!(failure.kind, coldsign_core::ErrorKind::ActionCancelled);
    assert!(!engine.is_active());
}

#[test]
fn change_output_is_not_prompted_and_fee_is_computed_correctly() {
    let fx = Fixture::new();
    let prev_hash = fx.real_prev_hash();
    let input = fx.input(prev_hash);
    let mut engine = Engine::new();

    struct CountingConfirm {
        output_prompts: u32,
    }
    impl ConfirmationProvider for CountingConfirm {
        fn confirm_transaction_output(&mut self, _amount: u64, _to_address: &str) -> bool {
            self.output_prompts += 1;
            true
        }
        fn confirm_fee_over_threshold(&mut self, _fee: u64) -> bool {
            true
        }
        fn confirm_transaction(&mut self, total_amount: u64, fee: u64) -> bool {
            // to_spend=100000, spending=99000, change_spend=39000.
            assert_eq!(total_amount, 61_000);
            assert_eq!(fee, 1_000);
            true
        }
    }
    let mut confirm = CountingConfirm { output_prompts: 0 };

    engine.start(1, 2, fx.coin, fx.root.clone()).unwrap();
    expect_request(engine.on_ack(TxAck::Input(input), &mut confirm));
    expect_request(engine.on_ack(TxAck::Meta(fx.prev_meta()), &mut confirm));
    expect_request(engine.on_ack(TxAck::Input(fx.prev_input()), &mut confirm));
    expect_request(engine.on_ack(TxAck::BinOutput(fx.prev_bin_output()), &mut confirm));

    expect_request(engine.on_ack(TxAck::Output(fx.spend_output(60_000)), &mut confirm));
    expect_request(engine.on_ack(
        TxAck::Output(fx.change_output(39_000, vec![0])),
        &mut confirm,
    ));

    assert_eq!(confirm.output_prompts, 1, "change output must not be prompted");
}

#[test]
fn fee_over_threshold_triggers_the_high_fee_prompt_exactly_once() {
    let fx = Fixture::new();
    let prev_hash = fx.real_prev_hash();
    let input = fx.input(prev_hash);
    let mut engine = Engine::new();

    struct CountingFeeConfirm {
        fee_prompts: u32,
    }
    impl ConfirmationProvider for CountingFeeConfirm {
        fn confirm_transaction_output(&mut self, _amount: u64, _to_address: &str) -> bool {
            true
        }
        fn confirm_fee_over_threshold(&mut self, _fee: u64) -> bool {
            self.fee_prompts += 1;
            true
        }
        fn confirm_transaction(&mut self, _total_amount: u64, _fee: u64) -> bool {
            true
        }
    }
    let mut confirm = CountingFeeConfirm { fee_prompts: 0 };

    // tx_est_size_kb for 1 input/1 output is 1 (ceil((148+34+10)/1000)).
    // A maxfee_kb of 1 makes any fee above 1 sat/byte trip the threshold.
    let low_threshold_coin = CoinParams::new(Network::Testnet, 1);
    engine.start(1, 1, low_threshold_coin, fx.root.clone()).unwrap();
    expect_request(engine.on_ack(TxAck::Input(input), &mut confirm));
    expect_request(engine.on_ack(TxAck::Meta(fx.prev_meta()), &mut confirm));
    expect_request(engine.on_ack(TxAck::Input(fx.prev_input()), &mut confirm));
    expect_request(engine.on_ack(TxAck::BinOutput(fx.prev_bin_output()), &mut confirm));

    // fee = 100_000 - 90_000 = 10_000, well above the threshold of 1.
    expect_request(engine.on_ack(TxAck::Output(fx.spend_output(90_000)), &mut confirm));

    assert_eq!(confirm.fee_prompts, 1);
}

#[test]
fn different_address_n_between_phases_is_rejected() {
    let fx = Fixture::new();
    let prev_hash = fx.real_prev_hash();
    let input = fx.input(prev_hash);
    let output = fx.spend_output(90_000);
    let mut engine = Engine::new();
    let mut confirm = ScriptedConfirm::default();

    engine.start(1, 1, fx.coin, fx.root.clone()).unwrap();
    expect_request(engine.on_ack(TxAck::Input(input.clone()), &mut confirm));
    expect_request(engine.on_ack(TxAck::Meta(fx.prev_meta()), &mut confirm));
    expect_request(engine.on_ack(TxAck::Input(fx.prev_input()), &mut confirm));
    expect_request(engine.on_ack(TxAck::BinOutput(fx.prev_bin_output()), &mut confirm));
    expect_request(engine.on_ack(TxAck::Output(output.clone()), &mut confirm));

    // Phase 2: same input, but a different derivation path than the one
    // the user approved in Phase 1.
    let mut tampered_input = input;
    tampered_input.address_n = vec![0x8000_002c, 0x8000_0000, 0x8000_0000, 0, 99];
    expect_request(engine.on_ack(TxAck::Input(tampered_input), &mut confirm));

    let failure = expect_failure(engine.on_ack(TxAck::Output(output), &mut confirm));
    assert_eq!(failure.message, "Transaction has changed during signing");
    assert!(!engine.is_active());
}

#[test]
fn prevhash_mismatch_is_rejected() {
    let fx = Fixture::new();
    // A previous-tx hash that does not match the real prev tx data sent below.
    let bogus_prev_hash = [0x42u8; 32];
    let input = fx.input(bogus_prev_hash);
    let mut engine = Engine::new();
    let mut confirm = ScriptedConfirm::default();

    engine.start(1, 1, fx.coin, fx.root.clone()).unwrap();
    expect_request(engine.on_ack(TxAck::Input(input), &mut confirm));
    expect_request(engine.on_ack(TxAck::Meta(fx.prev_meta()), &mut confirm));
    expect_request(engine.on_ack(TxAck::Input(fx.prev_input()), &mut confirm));
    let failure = expect_failure(engine.on_ack(TxAck::BinOutput(fx.prev_bin_output()), &mut confirm));
    assert_eq!(failure.message, "Encountered invalid prevhash");
    assert!(!engine.is_active());
}
