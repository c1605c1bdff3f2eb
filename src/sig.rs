//! Handles the creation and verification of (Ethereum) Signatures.

use crate::types::Hash;
use sha3::{Digest, Keccak256};

mod k256;
pub use self::k256::{recover_signer, Error, Signer};

/// Add the `\x19Ethereum Signed Message\n<length>` prefix to hash.
///
/// This is the format wallets apply when asked to sign arbitrary data.
pub fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding => We can't use the slot writer
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}
