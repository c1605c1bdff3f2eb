pub mod types;

mod hashing;
pub mod sig;

pub mod config;
pub mod message;
pub mod wire;

pub mod channel;
pub mod wallet;

pub mod client;
pub mod registry;
pub mod server;

pub use types::{Address, ChannelId, Hash, Signature, U256};
