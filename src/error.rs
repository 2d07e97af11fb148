//! Error kinds and exact user-visible messages emitted by the signing engine.

/// The three outbound failure classes the host protocol can distinguish.
///
/// These map 1:1 onto the wire `Failure.kind` field; the exact strings below
/// are part of the protocol contract, not just debug text.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// An ack arrived while no session was active, or a lifecycle call
    /// arrived while one was.
    UnexpectedMessage,
    /// Every other protocol or crypto fault.
    Other,
    /// Declared outputs exceed declared input amounts.
    NotEnoughFunds,
    /// The user rejected a confirmation prompt.
    ActionCancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("Not in Signing mode")]
    NotInSigningMode,

    #[error("Failed to serialize input")]
    SerializeInput,

    #[error("Failed to serialize output")]
    SerializeOutput,

    #[error("Encountered invalid prevhash")]
    InvalidPrevhash,

    #[error("Error computing multisig fingerprint")]
    MultisigFingerprint,

    #[error("Only one change output allowed")]
    TooManyChangeOutputs,

    #[error("Failed to compile output")]
    CompileOutput,

    #[error("Failed to derive private key")]
    DerivePrivateKey,

    #[error("Multisig info not provided")]
    MissingMultisigInfo,

    #[error("Pubkey not found in multisig script")]
    PubkeyNotInMultisig,

    #[error("Failed to serialize multisig script")]
    SerializeMultisigScript,

    #[error("Transaction has changed during signing")]
    ChecksumMismatch,

    #[error("Signing error")]
    Signing,

    #[error("Not enough funds")]
    NotEnoughFunds,

    #[error("Fee over threshold. Signing cancelled.")]
    FeeOverThreshold,

    #[error("Signing cancelled by user")]
    CancelledByUser,
}

impl SigningError {
    /// The `ErrorKind` this error is reported under on the wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SigningError::NotInSigningMode => ErrorKind::UnexpectedMessage,
            SigningError::NotEnoughFunds => ErrorKind::NotEnoughFunds,
            SigningError::FeeOverThreshold | SigningError::CancelledByUser => {
                ErrorKind::ActionCancelled
            }
            _ => ErrorKind::Other,
        }
    }
}
