use serde::{Deserialize, Serialize};

/// Class of an operation deadline, see [crate::config::Timeouts].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutType {
    Default,
    Handle,
    Funding,
    Settle,
}
