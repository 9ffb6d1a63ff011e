//! Error types for the SDUPI ledger core

use thiserror::Error;

use crate::round::Phase;
use crate::types::{NodeId, ValidatorId};

#[derive(Error, Debug)]
pub enum SdupiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    #[error("Invalid parent: {0}")]
    InvalidParent(NodeId),

    #[error("Unknown proposer: {0}")]
    UnknownProposer(ValidatorId),

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Invalid stake for {validator}: {reason}")]
    InvalidStake { validator: ValidatorId, reason: String },

    #[error("Round {0} is already in progress")]
    RoundInProgress(u64),

    #[error("Round {round_id} timed out waiting for quorum in phase {phase:?}")]
    QuorumTimeout { round_id: u64, phase: Phase },

    #[error("Round {round_id} rejected in phase {phase:?}: approval quorum unreachable")]
    QuorumRejected { round_id: u64, phase: Phase },

    #[error("Consensus degraded after {0} consecutive failed rounds")]
    DegradedConsensus(u64),

    #[error("No active validators available for a committee")]
    NoActiveValidators,

    #[error("Consensus engine is shutting down")]
    ShuttingDown,

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SdupiError {
    /// Errors a caller can retry later without changing its input.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SdupiError::RoundInProgress(_)
                | SdupiError::QuorumTimeout { .. }
                | SdupiError::QuorumRejected { .. }
                | SdupiError::DegradedConsensus(_)
        )
    }
}

impl From<bincode::Error> for SdupiError {
    fn from(err: bincode::Error) -> Self {
        SdupiError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SdupiError>;
