//! Vote collection interface to the network layer
//!
//! The engine announces each voted phase through [`ConsensusNetwork`]; the
//! network layer answers by pushing committee votes into the supplied
//! [`VoteSender`] as they arrive. Transport and gossip live outside this crate.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::crypto::KeyPair;
use crate::error::{Result, SdupiError};
use crate::round::{Ballot, CommitteeMember, ConsensusAlgorithm, Decision, Vote};
use crate::types::{NodeId, ValidatorId};

/// Channel for votes flowing back into the engine
pub type VoteSender = mpsc::Sender<Vote>;

/// Announcement of a phase that needs committee votes
#[derive(Debug, Clone, Serialize)]
pub struct VoteRequest {
    pub ballot: Ballot,
    pub algorithm: ConsensusAlgorithm,
    /// Member expected to announce `batch` during Proposing
    pub leader: Option<ValidatorId>,
    pub committee: Vec<CommitteeMember>,
    pub batch: Vec<NodeId>,
}

#[async_trait]
pub trait ConsensusNetwork: Send + Sync {
    /// Ask the committee to vote on `request.ballot`. Votes may arrive on
    /// `votes` any time until the phase times out.
    async fn solicit_votes(&self, request: VoteRequest, votes: VoteSender) -> Result<()>;
}

/// Network for single-node devnets: every locally held committee key
/// approves every phase immediately.
pub struct LoopbackNetwork {
    signers: Vec<KeyPair>,
}

impl LoopbackNetwork {
    pub fn new(signers: Vec<KeyPair>) -> Self {
        Self { signers }
    }
}

#[async_trait]
impl ConsensusNetwork for LoopbackNetwork {
    async fn solicit_votes(&self, request: VoteRequest, votes: VoteSender) -> Result<()> {
        for signer in &self.signers {
            let id = signer.validator_id();
            if !request.committee.iter().any(|m| m.id == id) {
                continue;
            }
            let vote = Vote::signed(signer, request.ballot, Decision::Approve);
            votes
                .send(vote)
                .await
                .map_err(|e| SdupiError::Network(format!("vote channel closed: {}", e)))?;
        }
        Ok(())
    }
}
