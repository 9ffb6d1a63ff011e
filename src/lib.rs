//! SDUPI ledger core
//!
//! Stake-weighted DAG ledger with committee consensus rounds that finalize
//! nodes, plus a sliding-window performance monitor.

pub mod config;
pub mod consensus;
pub mod crypto;
pub mod dag;
pub mod error;
pub mod events;
pub mod metrics;
pub mod network;
pub mod round;
pub mod types;
pub mod validators;

// Re-export commonly used types
pub use config::Config;
pub use consensus::{ConsensusEngine, ConsensusStats, FinalityListener, FinalizedBatch};
pub use crypto::KeyPair;
pub use dag::{DagLedger, DagNode, DagStatistics, NodeSubmission};
pub use error::{Result, SdupiError};
pub use metrics::{PercentileEstimate, PerformanceMonitor, PerformanceReport};
pub use network::{ConsensusNetwork, LoopbackNetwork, VoteRequest};
pub use round::{Ballot, ConsensusAlgorithm, ConsensusRound, Decision, Phase, RoundStatus, Vote};
pub use types::{Hash, NodeId, PayloadRef, ValidatorId, hash_to_hex, hex_to_hash};
pub use validators::{ValidatorEntry, ValidatorRegistry};
