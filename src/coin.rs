//! Per-coin parameters the engine needs to validate amounts and addresses.
//! No file or environment loading here; the caller passes this in at
//! `start()`.

use bitcoin::Network;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoinParams {
    pub network: Network,
    /// Satoshis per kilobyte of estimated transaction size before the user
    /// sees a high-fee warning.
    pub maxfee_kb: u64,
}

impl CoinParams {
    pub fn new(network: Network, maxfee_kb: u64) -> Self {
        Self { network, maxfee_kb }
    }

    pub fn bitcoin_mainnet() -> Self {
        Self::new(Network::Bitcoin, 100_000)
    }

    pub fn bitcoin_testnet() -> Self {
        Self::new(Network::Testnet, 100_000)
    }
}
