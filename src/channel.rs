mod backend;
mod chain;
pub mod local;
mod proposal;
pub(crate) mod state;

pub use backend::*;
pub use chain::SimulatedChain;
pub use proposal::*;
pub use state::*;

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Proposed,
    Funding,
    Open,
    Disputed,
    Settling,
    Closed,
}
