//! Signer using the k256 Rust crate (implementation of ecdsa in Rust).

use crate::{
    hashing::keccak256,
    types::{Address, Hash, Signature},
};
use k256::{
    ecdsa::{
        recoverable,
        signature::{hazmat::PrehashSigner, Signature as k256Signature},
        SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};
use sha3::{Digest, Keccak256};

use super::hash_to_eth_signed_msg_hash;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("signature must be 65 bytes, got {0}")]
    Length(usize),
    #[error("invalid recovery id {0}")]
    RecoveryId(u8),
    #[error(transparent)]
    Ecdsa(#[from] k256::ecdsa::Error),
}

/// An L2 identity: a secp256k1 key pair and its Ethereum style address.
#[derive(Debug)]
pub struct Signer {
    key: SigningKey,
    addr: Address,
}

impl From<VerifyingKey> for Address {
    fn from(key: VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);

        // See https://ethereum.stackexchange.com/questions/65233/goethereum-getting-public-key-from-private-key-hex-formatting
        //
        // Throw away the first byte, which is not part of the public key. It is
        // added by the uncompressed SEC1 encoding.
        let hash: [u8; 32] = Keccak256::digest(&point.as_bytes()[1..]).into();

        let mut addr = Address([0; 20]);
        addr.0.copy_from_slice(&hash[32 - 20..]);
        addr
    }
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let key = SigningKey::random(rng);
        let addr = key.verifying_key().into();
        Self { key, addr }
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    pub fn sign_eth(&self, msg: Hash) -> Result<Signature, Error> {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        let sig: recoverable::Signature = self.key.sign_prehash(&hash.0)?;

        // The recoverable signature is already r, s, v. v needs an offset of
        // 27 to be valid in the EVM.
        let mut sig_bytes = sig.as_bytes().to_vec();
        sig_bytes[64] += 27;

        Ok(Signature(sig_bytes))
    }

    /// Sign arbitrary data the way remote Ethereum wallets do: Keccak-256 of
    /// the data, then the signed message prefix.
    pub fn sign_data(&self, data: &[u8]) -> Result<Signature, Error> {
        self.sign_eth(keccak256(data))
    }
}

/// Recover the address that produced `eth_sig` over `msg`.
pub fn recover_signer(msg: Hash, eth_sig: &Signature) -> Result<Address, Error> {
    // "\x19Ethereum Signed Message:\n32" format
    let hash = hash_to_eth_signed_msg_hash(msg);

    if eth_sig.0.len() != 65 {
        return Err(Error::Length(eth_sig.0.len()));
    }

    // Undo adding the 27, to go back to the format expected below
    let mut sig_bytes = eth_sig.0.clone();
    sig_bytes[64] = match sig_bytes[64] {
        v @ 27..=28 => v - 27,
        v @ 0..=1 => v,
        v => return Err(Error::RecoveryId(v)),
    };

    let sig = recoverable::Signature::from_bytes(&sig_bytes)?;
    let verifying_key = sig.recover_verifying_key_from_digest_bytes(&hash.0.into())?;
    Ok(verifying_key.into())
}
