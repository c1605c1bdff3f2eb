//! Keccak-256 hashing of channel data.
//!
//! Values are written as a sequence of 32 byte slots, numbers and addresses
//! right aligned, fixed-size bytes left aligned and dynamic data replaced by
//! its own hash. Two values hash equal iff they encode the same slots.

use crate::types::{Address, Hash, U256};
use sha3::{
    digest::{core_api::CoreWrapper, Output},
    Digest, Keccak256, Keccak256Core,
};

pub const SLOT_SIZE: usize = 32;

pub struct Keccak256Writer {
    hasher: CoreWrapper<Keccak256Core>,
}

impl Default for Keccak256Writer {
    fn default() -> Self {
        Self {
            hasher: Keccak256::new(),
        }
    }
}

impl Keccak256Writer {
    pub fn write_slot(&mut self, slot: &[u8; SLOT_SIZE]) {
        self.hasher.update(slot);
    }

    pub fn write_u256(&mut self, v: U256) {
        self.write_slot(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write_u256(U256::from(v));
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u64(v as u64);
    }

    pub fn write_address(&mut self, addr: &Address) {
        // Addresses are right aligned like uints.
        let mut slot = [0u8; SLOT_SIZE];
        slot[SLOT_SIZE - 20..].copy_from_slice(&addr.0);
        self.write_slot(&slot);
    }

    pub fn write_hash(&mut self, hash: &Hash) {
        self.write_slot(&hash.0);
    }

    /// Dynamic length data is committed to by its hash, so the slot layout
    /// stays fixed.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_hash(&keccak256(bytes));
    }

    /// Lists are prefixed with their length.
    pub fn write_list<T: Encode>(&mut self, items: &[T]) {
        self.write_u64(items.len() as u64);
        for item in items {
            item.encode(self);
        }
    }

    pub fn finalize(self) -> Output<Keccak256> {
        self.hasher.finalize()
    }
}

/// Types with a canonical slot encoding.
pub trait Encode {
    fn encode(&self, w: &mut Keccak256Writer);
}

impl Encode for U256 {
    fn encode(&self, w: &mut Keccak256Writer) {
        w.write_u256(*self);
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, w: &mut Keccak256Writer) {
        w.write_list(self);
    }
}

pub fn to_hash<T: Encode + ?Sized>(value: &T) -> Hash {
    let mut writer = Keccak256Writer::default();
    value.encode(&mut writer);
    Hash(writer.finalize().into())
}

pub fn keccak256(bytes: &[u8]) -> Hash {
    Hash(Keccak256::digest(bytes).into())
}
