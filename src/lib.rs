//! Streamed, constant-memory transaction signing for a Bitcoin hardware
//! wallet. The host walks a transaction past the device one input or
//! output at a time; the device checks it, confirms it with the user,
//! then walks it again to derive keys and emit signed fragments. See
//! [`engine::Engine`] for the state machine that drives this.

pub mod classify;
pub mod codec;
pub mod coin;
pub mod confirm;
pub mod engine;
pub mod error;
pub mod keys;
pub mod protocol;
pub mod script;
mod session;

pub use coin::CoinParams;
pub use confirm::ConfirmationProvider;
pub use engine::Engine;
pub use error::{ErrorKind, SigningError};
pub use keys::RootNode;
pub use protocol::{StepOutcome, TxAck, TxRequest};
