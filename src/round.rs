//! Consensus round data: algorithms, phases, votes and weighted tallies

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::crypto::KeyPair;
use crate::types::{NodeId, Timestamp, ValidatorId};

/// Agreement protocol run by a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusAlgorithm {
    /// Highest-weight committee member proposes; three voted phases
    LeaderBased,
    /// Leaderless; prepare, commit and finalize are each voted
    ByzantineVoting,
    /// `LeaderBased` first, one `ByzantineVoting` retry on failure
    Hybrid,
}

impl ConsensusAlgorithm {
    /// Phases that need a 2/3-weighted approval, in order.
    ///
    /// `Hybrid` reports the phases of its first attempt.
    pub fn voting_phases(&self) -> &'static [Phase] {
        match self {
            ConsensusAlgorithm::LeaderBased | ConsensusAlgorithm::Hybrid => {
                &[Phase::Proposing, Phase::Preparing, Phase::Committing]
            }
            ConsensusAlgorithm::ByzantineVoting => {
                &[Phase::Preparing, Phase::Committing, Phase::Finalizing]
            }
        }
    }

    pub fn has_leader(&self) -> bool {
        !matches!(self, ConsensusAlgorithm::ByzantineVoting)
    }
}

/// Round phase. `Idle` is reported when no round is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Proposing,
    Preparing,
    Committing,
    Finalizing,
}

impl Phase {
    fn as_u8(&self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Proposing => 1,
            Phase::Preparing => 2,
            Phase::Committing => 3,
            Phase::Finalizing => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Pending,
    Running,
    Committed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

/// What a vote is cast on: one phase of one attempt of one round.
///
/// A hybrid round's fallback runs as attempt 1, so votes left over from the
/// leader-based attempt never count toward it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ballot {
    pub round_id: u64,
    pub attempt: u8,
    pub phase: Phase,
}

impl Ballot {
    pub fn new(round_id: u64, attempt: u8, phase: Phase) -> Self {
        Self {
            round_id,
            attempt,
            phase,
        }
    }
}

/// Committee vote delivered by the network collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub validator: ValidatorId,
    pub ballot: Ballot,
    pub decision: Decision,
    pub signature: Vec<u8>,
}

impl Vote {
    /// Bytes covered by the vote signature
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(10 + 8 + 3 + 32);
        data.extend_from_slice(b"sdupi.vote");
        data.extend_from_slice(&self.ballot.round_id.to_le_bytes());
        data.push(self.ballot.attempt);
        data.push(self.ballot.phase.as_u8());
        data.push(match self.decision {
            Decision::Approve => 1,
            Decision::Reject => 0,
        });
        data.extend_from_slice(self.validator.as_bytes());
        data
    }

    pub fn unsigned(validator: ValidatorId, ballot: Ballot, decision: Decision) -> Self {
        Self {
            validator,
            ballot,
            decision,
            signature: Vec::new(),
        }
    }

    pub fn signed(keypair: &KeyPair, ballot: Ballot, decision: Decision) -> Self {
        let mut vote = Self::unsigned(keypair.validator_id(), ballot, decision);
        vote.signature = keypair.sign(&vote.signing_bytes());
        vote
    }
}

/// Committee member with the weight captured at round start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeMember {
    pub id: ValidatorId,
    pub weight: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Phase timeout elapsed before quorum
    Timeout,
    /// Rejecting weight made an approval quorum impossible
    Rejected,
    /// Engine shutdown cancelled the round
    Cancelled,
    /// Quorum was reached but the ledger refused to mark the batch final
    Finalization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundFailure {
    pub algorithm: ConsensusAlgorithm,
    pub phase: Phase,
    pub reason: FailureReason,
}

/// One instance of the phase protocol. Owned by the engine; callers only
/// ever see clones.
#[derive(Debug, Clone, Serialize)]
pub struct ConsensusRound {
    pub round_id: u64,
    /// Algorithm requested by the caller
    pub requested_algorithm: ConsensusAlgorithm,
    /// Algorithm of the attempt currently (or last) running
    pub algorithm: ConsensusAlgorithm,
    pub phase: Phase,
    pub committee: Vec<CommitteeMember>,
    /// Proposer for leader-based attempts. Advisory only: the batch is the
    /// engine's oldest-first candidate set, which the leader announces in
    /// the Proposing phase but does not choose.
    pub leader: Option<ValidatorId>,
    /// Nodes this round finalizes on commit
    pub batch: Vec<NodeId>,
    /// Votes of the current phase
    pub votes: HashMap<ValidatorId, Decision>,
    pub status: RoundStatus,
    pub started_at: Timestamp,
    pub ended_at: Option<Timestamp>,
    pub duration_ms: Option<u64>,
    pub fallback_used: bool,
    pub failures: Vec<RoundFailure>,
    /// Mean fraction of committee weight that voted, over the phases tallied
    pub participation: f64,
}

impl ConsensusRound {
    pub fn new(
        round_id: u64,
        algorithm: ConsensusAlgorithm,
        committee: Vec<CommitteeMember>,
        batch: Vec<NodeId>,
        started_at: Timestamp,
    ) -> Self {
        let leader = if algorithm.has_leader() {
            leader_of(&committee)
        } else {
            None
        };
        Self {
            round_id,
            requested_algorithm: algorithm,
            algorithm: match algorithm {
                ConsensusAlgorithm::Hybrid => ConsensusAlgorithm::LeaderBased,
                other => other,
            },
            phase: Phase::Idle,
            committee,
            leader,
            batch,
            votes: HashMap::new(),
            status: RoundStatus::Pending,
            started_at,
            ended_at: None,
            duration_ms: None,
            fallback_used: false,
            failures: Vec::new(),
            participation: 0.0,
        }
    }

    pub fn total_weight(&self) -> u128 {
        self.committee.iter().map(|m| u128::from(m.weight)).sum()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RoundStatus::Committed | RoundStatus::Failed)
    }

    /// Last recorded failure, if any
    pub fn failure(&self) -> Option<&RoundFailure> {
        self.failures.last()
    }
}

/// Highest captured weight wins; ties go to the lowest id
pub fn leader_of(committee: &[CommitteeMember]) -> Option<ValidatorId> {
    committee
        .iter()
        .max_by(|a, b| a.weight.cmp(&b.weight).then_with(|| b.id.cmp(&a.id)))
        .map(|m| m.id)
}

/// `part` is at least two thirds of `total`
pub fn is_quorum(part: u128, total: u128) -> bool {
    total > 0 && part * 3 >= total * 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TallyOutcome {
    Counted,
    NotMember,
    Duplicate,
}

/// Weighted vote tally for a single phase
#[derive(Debug, Clone)]
pub struct VoteTally {
    weights: HashMap<ValidatorId, u64>,
    total: u128,
    approve: u128,
    reject: u128,
    votes: HashMap<ValidatorId, Decision>,
}

impl VoteTally {
    pub fn new(committee: &[CommitteeMember]) -> Self {
        let weights: HashMap<ValidatorId, u64> =
            committee.iter().map(|m| (m.id, m.weight)).collect();
        let total = weights.values().map(|w| u128::from(*w)).sum();
        Self {
            weights,
            total,
            approve: 0,
            reject: 0,
            votes: HashMap::new(),
        }
    }

    pub fn record(&mut self, validator: ValidatorId, decision: Decision) -> TallyOutcome {
        let Some(weight) = self.weights.get(&validator).copied() else {
            return TallyOutcome::NotMember;
        };
        if self.votes.contains_key(&validator) {
            return TallyOutcome::Duplicate;
        }
        self.votes.insert(validator, decision);
        match decision {
            Decision::Approve => self.approve += u128::from(weight),
            Decision::Reject => self.reject += u128::from(weight),
        }
        TallyOutcome::Counted
    }

    pub fn has_quorum(&self) -> bool {
        is_quorum(self.approve, self.total)
    }

    /// Even if every silent member approves, 2/3 can no longer be reached
    pub fn quorum_unreachable(&self) -> bool {
        !is_quorum(self.total - self.reject, self.total)
    }

    /// Fraction of committee weight that has voted either way
    pub fn participation(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.approve + self.reject) as f64 / self.total as f64
    }

    pub fn votes(&self) -> &HashMap<ValidatorId, Decision> {
        &self.votes
    }

    pub fn approve_weight(&self) -> u128 {
        self.approve
    }
}
