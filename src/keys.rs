//! HD-node derivation and the zeroised key material held while signing one
//! input. A thin wrapper around `bitcoin::util::bip32` so the rest of the
//! engine never touches `secp256k1::Secp256k1` or raw scalars directly.

use bitcoin::secp256k1::{self, Secp256k1};
use bitcoin::util::bip32::{ChildNumber, ExtendedPrivKey};
use bitcoin::PublicKey;
use zeroize::Zeroize;

use crate::error::SigningError;

#[derive(Clone)]
pub struct RootNode {
    xprv: ExtendedPrivKey,
}

impl RootNode {
    pub fn new(xprv: ExtendedPrivKey) -> Self {
        Self { xprv }
    }

    // address_n entries are raw wire u32s; the high bit already encodes
    // hardened-ness, as the host sends it.
    pub fn derive(
        &self,
        address_n: &[u32],
        secp: &Secp256k1<secp256k1::All>,
    ) -> Result<ActiveKey, SigningError> {
        let path: Vec<ChildNumber> = address_n.iter().map(|&n| ChildNumber::from(n)).collect();
        let child = self
            .xprv
            .derive_priv(secp, &path)
            .map_err(|_| SigningError::DerivePrivateKey)?;
        let privkey = child.private_key.key;
        let pubkey = secp256k1::PublicKey::from_secret_key(secp, &privkey);

        let mut privkey_bytes = [0u8; 32];
        privkey_bytes.copy_from_slice(&privkey[..]);

        Ok(ActiveKey {
            privkey: privkey_bytes,
            pubkey: PublicKey {
                compressed: true,
                key: pubkey,
            },
        })
    }
}

pub struct ActiveKey {
    privkey: [u8; 32],
    pub pubkey: PublicKey,
}

impl ActiveKey {
    pub fn secret_key(&self) -> Result<secp256k1::SecretKey, SigningError> {
        secp256k1::SecretKey::from_slice(&self.privkey).map_err(|_| SigningError::DerivePrivateKey)
    }

    pub fn empty() -> Self {
        Self {
            privkey: [0u8; 32],
            pubkey: PublicKey::from_slice(&[2u8; 33]).expect("valid placeholder point"),
        }
    }

    pub fn is_wiped(&self) -> bool {
        self.privkey.iter().all(|&b| b == 0)
    }
}

impl Drop for ActiveKey {
    fn drop(&mut self) {
        self.privkey.zeroize();
    }
}
