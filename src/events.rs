//! Ledger and consensus event types
//!
//! Broadcast to subscribers (gossip, persistence, dashboards) as nodes are
//! added and rounds progress.

use serde::Serialize;

use crate::round::{ConsensusAlgorithm, FailureReason, Phase};

/// Event published on the ledger event channel
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum LedgerEvent {
    #[serde(rename = "node_added")]
    NodeAdded {
        node_id: String,
        proposer: String,
        parents: Vec<String>,
        payload_count: usize,
    },
    #[serde(rename = "round_started")]
    RoundStarted {
        round_id: u64,
        algorithm: ConsensusAlgorithm,
        committee_size: usize,
        batch_size: usize,
    },
    #[serde(rename = "round_committed")]
    RoundCommitted {
        round_id: u64,
        finalized_nodes: usize,
        duration_ms: u64,
    },
    #[serde(rename = "round_failed")]
    RoundFailed {
        round_id: u64,
        phase: Phase,
        reason: FailureReason,
    },
    #[serde(rename = "consensus_degraded")]
    ConsensusDegraded { consecutive_failures: u64 },
}

pub type EventSender = tokio::sync::broadcast::Sender<LedgerEvent>;
