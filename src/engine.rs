//! Public entry point: a session that is active or isn't.
//!
//! `Engine` owns at most one `SigningSession`. `start` refuses while one is
//! already running; `on_ack` refuses while none is; `abort` always
//! succeeds and always wipes key material, whichever state it finds.

use crate::coin::CoinParams;
use crate::confirm::ConfirmationProvider;
use crate::error::SigningError;
use crate::keys::RootNode;
use crate::protocol::{Failure, RequestType, StepOutcome, TxAck, TxRequest};
use crate::session::SigningSession;

#[derive(Default)]
pub struct Engine {
    session: Option<SigningSession>,
}

impl Engine {
    pub fn new() -> Self {
        Self { session: None }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Begin a new signing session. Fails if one is already in progress.
    pub fn start(
        &mut self,
        inputs_count: u32,
        outputs_count: u32,
        coin: CoinParams,
        root: RootNode,
    ) -> Result<TxRequest, SigningError> {
        if self.session.is_some() {
            return Err(SigningError::NotInSigningMode);
        }
        let (session, request) = SigningSession::start(inputs_count, outputs_count, coin, root);
        self.session = Some(session);
        Ok(request)
    }

    /// Advance the state machine by one inbound message. Always produces
    /// exactly one outbound step.
    pub fn on_ack(&mut self, ack: TxAck, confirm: &mut dyn ConfirmationProvider) -> StepOutcome {
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => {
                return StepOutcome::Failed(Failure::from(SigningError::NotInSigningMode));
            }
        };

        match session.on_ack(ack, confirm) {
            Ok(request) => {
                if request.request_type == RequestType::TxFinished {
                    self.session = None;
                }
                StepOutcome::Request(request)
            }
            Err(err) => {
                self.session = None;
                StepOutcome::Failed(Failure::from(err))
            }
        }
    }

    /// Drop any in-progress session, wiping its key material. Safe to call
    /// whether or not a session is active.
    pub fn abort(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{InputScriptType, TxInput};
    use bitcoin::util::bip32::ExtendedPrivKey;
    use std::str::FromStr;

    struct AlwaysConfirm;
    impl ConfirmationProvider for AlwaysConfirm {
        fn confirm_transaction_output(&mut self, _amount: u64, _to_address: &str) -> bool {
            true
        }
        fn confirm_fee_over_threshold(&mut self, _fee: u64) -> bool {
            true
        }
        fn confirm_transaction(&mut self, _total_amount: u64, _fee: u64) -> bool {
            true
        }
    }

    fn test_root() -> RootNode {
        let xprv = ExtendedPrivKey::from_str(
            "tprv8ZgxMBicQKsPd9TeAdPADNnSyH9SSUUbTVeFszDE23Ki6TBB5nCefAdHkK8Fm3qMQR6sHwA56zqRmKmxnHk37JkiFzvncDqoKmPWubu7hDF",
        )
        .unwrap();
        RootNode::new(xprv)
    }

    #[test]
    fn start_twice_without_finishing_is_refused() {
        let mut engine = Engine::new();
        let coin = CoinParams::bitcoin_testnet();
        engine.start(1, 1, coin, test_root()).unwrap();
        let err = engine.start(1, 1, coin, test_root()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::UnexpectedMessage);
    }

    #[test]
    fn ack_without_active_session_is_refused() {
        let mut engine = Engine::new();
        let mut confirm = AlwaysConfirm;
        let outcome = engine.on_ack(
            TxAck::Input(TxInput {
                prev_hash: [0u8; 32],
                prev_index: 0,
                script_sig: vec![],
                sequence: 0xFFFF_FFFF,
                script_type: InputScriptType::SpendAddress,
                address_n: vec![],
                amount: 0,
                multisig: None,
            }),
            &mut confirm,
        );
        match outcome {
            StepOutcome::Failed(f) => assert_eq!(f.kind, crate::error::ErrorKind::UnexpectedMessage),
            _ => panic!("expected a protocol-violation failure"),
        }
    }

    #[test]
    fn abort_without_active_session_is_a_no_op() {
        let mut engine = Engine::new();
        engine.abort();
        assert!(!engine.is_active());
    }
}
