//! Fault taxonomy of the runtime. Every variant is fatal for the whole process
//! group: ranks execute one program trace, so a fault on one rank cannot be
//! repaired locally without the others diverging.

use std::time::Duration;

use thiserror::Error;

use crate::types::{HistoryId, Rank, TransferKey};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The pool could not obtain a new slab from the system allocator.
    #[error("allocation exhausted: could not acquire a slab of {bytes} bytes for size class {class}")]
    AllocationExhausted { class: usize, bytes: usize },

    /// A scope computed a rank outside of the process group. This is the symptom
    /// of ranks having diverged in control flow.
    #[error("scheduling inconsistency: {scope} scope selected rank {sector}, but the group has {size} ranks")]
    SchedulingInconsistency {
        scope: &'static str,
        sector: Rank,
        size: Rank,
    },

    /// A single scope was stepped back past its first step.
    #[error("single scope stepped back below zero (step {step})")]
    NegativeSector { step: i64 },

    /// The drain loop made no progress for the configured stall timeout.
    #[error("deadlock: {pending} functors and {in_flight} transfers made no progress for {waited:?}")]
    Deadlock {
        pending: usize,
        in_flight: usize,
        waited: Duration,
    },

    /// A transfer arrived with a size that does not match the receiver's layout.
    #[error("transfer {key} from rank {source_rank} carries {actual} bytes, expected {expected}")]
    ExtentMismatch {
        key: TransferKey,
        source_rank: Rank,
        expected: usize,
        actual: usize,
    },

    /// A peer left the process group while a transfer to or from it was pending.
    #[error("rank {0} left the process group")]
    Disconnected(Rank),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown history {0}")]
    UnknownHistory(HistoryId),

    /// A scope-specific operation was used while another kind of scope is active.
    #[error("operation requires a {expected} scope")]
    ScopeMismatch { expected: &'static str },

    #[error("wire encoding failed")]
    Wire(#[from] bincode::Error),

    #[error("could not start the worker pool")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl Error {
    /// Exit code passed to the transport when the group is aborted.
    pub fn code(&self) -> i32 {
        match self {
            Error::AllocationExhausted { .. } => 2,
            Error::SchedulingInconsistency { .. } | Error::NegativeSector { .. } => 3,
            Error::Deadlock { .. } => 4,
            Error::ExtentMismatch { .. } | Error::Wire(_) | Error::Disconnected(_) => 5,
            Error::InvalidConfig(_) | Error::WorkerPool(_) => 6,
            Error::UnknownHistory(_) | Error::ScopeMismatch { .. } => 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let error = Error::SchedulingInconsistency {
            scope: "base",
            sector: -1,
            size: 4,
        };
        assert_eq!(
            error.to_string(),
            "scheduling inconsistency: base scope selected rank -1, but the group has 4 ranks"
        );
        assert_eq!(error.code(), 3);
        assert_eq!(
            Error::NegativeSector { step: -1 }.to_string(),
            "single scope stepped back below zero (step -1)"
        );
    }
}
