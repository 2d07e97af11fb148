//! Buttons, screens, and QR rendering are external collaborators; the core
//! only invokes these three yes/no prompts and aborts on any `false`.
//! Synchronous: these are the engine's only suspension points and have no
//! timeout, so the trait is not `async`.

pub trait ConfirmationProvider {
    /// "Send `amount` to `to_address`." Invoked once per non-change output.
    fn confirm_transaction_output(&mut self, amount: u64, to_address: &str) -> bool;

    /// Invoked only when the fee exceeds `coin.maxfee_kb`.
    fn confirm_fee_over_threshold(&mut self, fee: u64) -> bool;

    /// Final, session-closing confirmation.
    fn confirm_transaction(&mut self, total_amount: u64, fee: u64) -> bool;
}
