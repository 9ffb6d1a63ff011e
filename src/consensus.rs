//! Consensus engine for the SDUPI ledger
//!
//! A round snapshots the committee and the oldest non-final DAG nodes, then
//! walks the voted phases of its algorithm. Every phase needs approving
//! weight of at least two thirds of the committee before the phase timeout.
//! Nodes are marked final only once the last phase has passed, so a failed
//! round leaves the ledger untouched.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ConsensusConfig;
use crate::crypto::{Ed25519VoteVerifier, VoteVerifier};
use crate::dag::{DagLedger, FinalizedNode};
use crate::error::{Result, SdupiError};
use crate::events::{EventSender, LedgerEvent};
use crate::network::{ConsensusNetwork, VoteRequest, VoteSender};
use crate::round::{
    Ballot, CommitteeMember, ConsensusAlgorithm, ConsensusRound, FailureReason, Phase, RoundFailure,
    RoundStatus, TallyOutcome, Vote, VoteTally,
};
use crate::types::{Timestamp, ValidatorId, now_millis};
use crate::validators::ValidatorRegistry;

const VOTE_CHANNEL_CAPACITY: usize = 4096;

/// Nodes finalized by one committed round
#[derive(Debug, Clone, Serialize)]
pub struct FinalizedBatch {
    pub round_id: u64,
    pub committed_at: Timestamp,
    pub nodes: Vec<FinalizedNode>,
}

/// Observer of finality. Called exactly once per committed round, after the
/// batch is final in the ledger.
pub trait FinalityListener: Send + Sync {
    fn on_finalized(&self, batch: &FinalizedBatch);
}

/// Consensus statistics
#[derive(Debug, Clone, Serialize)]
pub struct ConsensusStats {
    pub current_round: Option<u64>,
    pub current_phase: Phase,
    pub rounds_started: u64,
    pub rounds_committed: u64,
    pub rounds_failed: u64,
    pub consecutive_failures: u64,
    pub degraded: bool,
    pub fallbacks_used: u64,
    pub finalized_nodes: u64,
    pub average_round_duration_ms: f64,
    /// Mean committee participation over closed rounds
    pub average_participation: f64,
    pub active_validators: usize,
}

#[derive(Debug, Default)]
struct EngineMetrics {
    rounds_started: u64,
    rounds_committed: u64,
    rounds_failed: u64,
    consecutive_failures: u64,
    degraded: bool,
    fallbacks_used: u64,
    finalized_nodes: u64,
    average_round_duration_ms: f64,
    average_participation: f64,
}

type ActiveRound = Arc<Mutex<Option<ConsensusRound>>>;

/// The engine's single round slot. Released on drop, including when a
/// spawned round is aborted before it ever runs.
struct RoundSlot {
    active: ActiveRound,
}

impl Drop for RoundSlot {
    fn drop(&mut self) {
        *self.active.lock() = None;
    }
}

/// Votes for later phases that arrived early, and participation per phase.
/// Only verified committee votes are buffered, one per member and phase.
#[derive(Default)]
struct RoundProgress {
    early_votes: HashMap<(ValidatorId, Phase), Vote>,
    participation: Vec<f64>,
}

/// Consensus engine driving one round at a time
pub struct ConsensusEngine {
    config: ConsensusConfig,
    registry: Arc<ValidatorRegistry>,
    ledger: Arc<DagLedger>,
    network: Arc<dyn ConsensusNetwork>,
    verifier: Arc<dyn VoteVerifier>,

    vote_tx: VoteSender,
    vote_rx: tokio::sync::Mutex<mpsc::Receiver<Vote>>,

    active: ActiveRound,
    next_round_id: AtomicU64,
    history: RwLock<VecDeque<ConsensusRound>>,
    metrics: RwLock<EngineMetrics>,

    listeners: RwLock<Vec<Arc<dyn FinalityListener>>>,
    event_tx: RwLock<Option<EventSender>>,
    shutdown: CancellationToken,
}

impl ConsensusEngine {
    pub fn new(
        config: ConsensusConfig,
        registry: Arc<ValidatorRegistry>,
        ledger: Arc<DagLedger>,
        network: Arc<dyn ConsensusNetwork>,
    ) -> Self {
        let (vote_tx, vote_rx) = mpsc::channel(VOTE_CHANNEL_CAPACITY);
        Self {
            config,
            registry,
            ledger,
            network,
            verifier: Arc::new(Ed25519VoteVerifier),
            vote_tx,
            vote_rx: tokio::sync::Mutex::new(vote_rx),
            active: Arc::new(Mutex::new(None)),
            next_round_id: AtomicU64::new(1),
            history: RwLock::new(VecDeque::new()),
            metrics: RwLock::new(EngineMetrics::default()),
            listeners: RwLock::new(Vec::new()),
            event_tx: RwLock::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replace the ed25519 vote check
    pub fn with_verifier(mut self, verifier: Arc<dyn VoteVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn set_event_sender(&self, tx: EventSender) {
        *self.event_tx.write() = Some(tx);
    }

    pub fn add_finality_listener(&self, listener: Arc<dyn FinalityListener>) {
        self.listeners.write().push(listener);
    }

    /// Sender for votes arriving outside a [`ConsensusNetwork`] solicitation
    pub fn vote_sender(&self) -> VoteSender {
        self.vote_tx.clone()
    }

    pub async fn submit_vote(&self, vote: Vote) -> Result<()> {
        self.vote_tx
            .send(vote)
            .await
            .map_err(|e| SdupiError::Network(format!("vote channel closed: {}", e)))
    }

    /// Run one round to completion.
    ///
    /// `None` uses the configured algorithm. Returns the committed round, or
    /// the reason it failed; failed rounds are still archived and visible
    /// through [`recent_rounds`](Self::recent_rounds).
    pub async fn start_round(&self, algorithm: Option<ConsensusAlgorithm>) -> Result<ConsensusRound> {
        let (round, slot) = self.claim_round(algorithm)?;
        self.drive_round(round, slot).await
    }

    /// Claim the round slot now and run the round on a background task
    pub fn spawn_round(
        self: &Arc<Self>,
        algorithm: Option<ConsensusAlgorithm>,
    ) -> Result<JoinHandle<Result<ConsensusRound>>> {
        let (round, slot) = self.claim_round(algorithm)?;
        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move { engine.drive_round(round, slot).await }))
    }

    /// Start rounds on the configured interval while non-final nodes exist.
    /// Returns once the engine shuts down.
    pub async fn run_scheduler(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.round_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            if self.ledger.finalization_candidates(1).is_empty() {
                continue;
            }

            match self.start_round(None).await {
                Ok(round) => tracing::debug!(
                    "Scheduled round {} committed {} nodes",
                    round.round_id,
                    round.batch.len()
                ),
                Err(SdupiError::ShuttingDown) => break,
                Err(SdupiError::RoundInProgress(id)) => {
                    tracing::debug!("Round {} still running, skipping tick", id)
                }
                Err(e) => {
                    tracing::warn!("Scheduled round failed: {}", e);
                    if let Err(health) = self.check_health() {
                        tracing::warn!("{}", health);
                    }
                }
            }
        }

        tracing::info!("Consensus scheduler stopped");
    }

    /// Cancel the running round and refuse new ones
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("Consensus engine shutting down");
        }
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// `Err(DegradedConsensus)` after too many consecutive failed rounds
    pub fn check_health(&self) -> Result<()> {
        let metrics = self.metrics.read();
        if metrics.degraded {
            return Err(SdupiError::DegradedConsensus(metrics.consecutive_failures));
        }
        Ok(())
    }

    pub fn get_consensus_stats(&self) -> ConsensusStats {
        let (current_round, current_phase) = match self.active.lock().as_ref() {
            Some(round) => (Some(round.round_id), round.phase),
            None => (None, Phase::Idle),
        };
        let metrics = self.metrics.read();
        ConsensusStats {
            current_round,
            current_phase,
            rounds_started: metrics.rounds_started,
            rounds_committed: metrics.rounds_committed,
            rounds_failed: metrics.rounds_failed,
            consecutive_failures: metrics.consecutive_failures,
            degraded: metrics.degraded,
            fallbacks_used: metrics.fallbacks_used,
            finalized_nodes: metrics.finalized_nodes,
            average_round_duration_ms: metrics.average_round_duration_ms,
            average_participation: metrics.average_participation,
            active_validators: self.registry.active_count(),
        }
    }

    /// Snapshot of the running round
    pub fn current_round(&self) -> Option<ConsensusRound> {
        self.active.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Archived rounds, oldest first
    pub fn recent_rounds(&self) -> Vec<ConsensusRound> {
        self.history.read().iter().cloned().collect()
    }

    pub fn round(&self, round_id: u64) -> Option<ConsensusRound> {
        self.history
            .read()
            .iter()
            .rev()
            .find(|r| r.round_id == round_id)
            .cloned()
    }

    fn claim_round(&self, algorithm: Option<ConsensusAlgorithm>) -> Result<(ConsensusRound, RoundSlot)> {
        if self.shutdown.is_cancelled() {
            return Err(SdupiError::ShuttingDown);
        }

        let mut active = self.active.lock();
        if let Some(current) = active.as_ref() {
            return Err(SdupiError::RoundInProgress(current.round_id));
        }

        let committee: Vec<CommitteeMember> = self
            .registry
            .select_committee(self.config.max_committee_size)
            .into_iter()
            .map(|entry| CommitteeMember {
                id: entry.id,
                weight: entry.stake,
            })
            .collect();
        if committee.iter().all(|m| m.weight == 0) {
            return Err(SdupiError::NoActiveValidators);
        }

        let batch = self.ledger.finalization_candidates(self.config.max_batch_size);
        let round_id = self.next_round_id.fetch_add(1, Ordering::SeqCst);
        let mut round = ConsensusRound::new(
            round_id,
            algorithm.unwrap_or(self.config.algorithm),
            committee,
            batch,
            now_millis(),
        );
        round.status = RoundStatus::Running;
        round.phase = Phase::Proposing;
        *active = Some(round.clone());
        drop(active);

        self.metrics.write().rounds_started += 1;
        Ok((
            round,
            RoundSlot {
                active: Arc::clone(&self.active),
            },
        ))
    }

    async fn drive_round(&self, mut round: ConsensusRound, _slot: RoundSlot) -> Result<ConsensusRound> {
        let started = Instant::now();
        tracing::info!(
            "Round {} started: {:?}, {} validators, {} nodes",
            round.round_id,
            round.requested_algorithm,
            round.committee.len(),
            round.batch.len()
        );
        self.publish(LedgerEvent::RoundStarted {
            round_id: round.round_id,
            algorithm: round.requested_algorithm,
            committee_size: round.committee.len(),
            batch_size: round.batch.len(),
        });

        // Only one round holds the slot, so this lock is never contended
        let mut votes = self.vote_rx.lock().await;
        let mut progress = RoundProgress::default();
        let mut outcome = self.run_attempt(&mut round, 0, &mut votes, &mut progress).await;

        let fallback = match outcome {
            Err(failure) if round.requested_algorithm == ConsensusAlgorithm::Hybrid => {
                (failure.reason != FailureReason::Cancelled).then_some(failure)
            }
            _ => None,
        };
        if let Some(failure) = fallback {
            tracing::warn!(
                "Round {} leader-based attempt failed in {:?} ({:?}), falling back to Byzantine voting",
                round.round_id,
                failure.phase,
                failure.reason
            );
            round.failures.push(failure);
            round.algorithm = ConsensusAlgorithm::ByzantineVoting;
            round.leader = None;
            round.fallback_used = true;
            progress.early_votes.clear();
            self.metrics.write().fallbacks_used += 1;
            outcome = self.run_attempt(&mut round, 1, &mut votes, &mut progress).await;
        }
        drop(votes);

        if !progress.participation.is_empty() {
            round.participation =
                progress.participation.iter().sum::<f64>() / progress.participation.len() as f64;
        }

        match outcome {
            Ok(()) => self.commit_round(round, started),
            Err(failure) => Err(self.fail_round(round, failure, started)),
        }
    }

    async fn run_attempt(
        &self,
        round: &mut ConsensusRound,
        attempt: u8,
        votes: &mut mpsc::Receiver<Vote>,
        progress: &mut RoundProgress,
    ) -> std::result::Result<(), RoundFailure> {
        for &phase in round.algorithm.voting_phases() {
            let ballot = Ballot::new(round.round_id, attempt, phase);
            self.enter_phase(round, phase);

            let (tally, outcome) = self.collect_votes(round, ballot, votes, progress).await;
            progress.participation.push(tally.participation());
            round.votes = tally.votes().clone();

            if let Err(reason) = outcome {
                return Err(RoundFailure {
                    algorithm: round.algorithm,
                    phase,
                    reason,
                });
            }
            tracing::debug!(
                "Round {} {:?} reached quorum with {} of {} weight",
                round.round_id,
                phase,
                tally.approve_weight(),
                round.total_weight()
            );
        }
        Ok(())
    }

    fn enter_phase(&self, round: &mut ConsensusRound, phase: Phase) {
        round.phase = phase;
        round.votes.clear();
        if let Some(active) = self.active.lock().as_mut() {
            active.phase = phase;
            active.algorithm = round.algorithm;
            active.leader = round.leader;
            active.fallback_used = round.fallback_used;
            active.votes.clear();
        }
    }

    /// Collect votes for one phase until quorum, rejection, timeout or
    /// shutdown.
    async fn collect_votes(
        &self,
        round: &ConsensusRound,
        ballot: Ballot,
        votes: &mut mpsc::Receiver<Vote>,
        progress: &mut RoundProgress,
    ) -> (VoteTally, std::result::Result<(), FailureReason>) {
        let mut tally = VoteTally::new(&round.committee);
        self.solicit(round, ballot);

        progress.early_votes.retain(|(_, phase), _| *phase >= ballot.phase);
        let ready: Vec<(ValidatorId, Phase)> = progress
            .early_votes
            .keys()
            .filter(|(_, phase)| *phase == ballot.phase)
            .copied()
            .collect();
        for key in ready {
            if let Some(vote) = progress.early_votes.remove(&key) {
                self.count_vote(&mut tally, vote);
            }
        }

        let deadline = tokio::time::sleep(self.config.phase_timeout());
        tokio::pin!(deadline);

        loop {
            if tally.has_quorum() {
                return (tally, Ok(()));
            }
            if tally.quorum_unreachable() {
                return (tally, Err(FailureReason::Rejected));
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return (tally, Err(FailureReason::Cancelled)),
                _ = &mut deadline => return (tally, Err(FailureReason::Timeout)),
                received = votes.recv() => match received {
                    Some(vote) => self.route_vote(round, ballot, vote, &mut tally, progress),
                    None => return (tally, Err(FailureReason::Cancelled)),
                },
            }
        }
    }

    fn solicit(&self, round: &ConsensusRound, ballot: Ballot) {
        let request = VoteRequest {
            ballot,
            algorithm: round.algorithm,
            leader: round.leader,
            committee: round.committee.clone(),
            batch: round.batch.clone(),
        };
        let network = Arc::clone(&self.network);
        let votes = self.vote_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = network.solicit_votes(request, votes).await {
                tracing::warn!(
                    "Vote solicitation for round {} {:?} failed: {}",
                    ballot.round_id,
                    ballot.phase,
                    e
                );
            }
        });
    }

    fn route_vote(
        &self,
        round: &ConsensusRound,
        ballot: Ballot,
        vote: Vote,
        tally: &mut VoteTally,
        progress: &mut RoundProgress,
    ) {
        let current_attempt = vote.ballot.round_id == ballot.round_id && vote.ballot.attempt == ballot.attempt;
        if !current_attempt || vote.ballot.phase < ballot.phase {
            tracing::debug!(
                "Dropping stale vote from {} for round {} {:?}",
                vote.validator.short(),
                vote.ballot.round_id,
                vote.ballot.phase
            );
            return;
        }

        if vote.ballot.phase > ballot.phase {
            if !round.committee.iter().any(|m| m.id == vote.validator) {
                tracing::warn!("Ignoring early vote from non-member {}", vote.validator.short());
                return;
            }
            if !self.verifier.verify(&vote) {
                tracing::warn!("Rejected early vote with invalid signature from {}", vote.validator.short());
                return;
            }
            // First verified vote per member and phase wins
            progress
                .early_votes
                .entry((vote.validator, vote.ballot.phase))
                .or_insert(vote);
            return;
        }

        self.count_vote(tally, vote);
    }

    fn count_vote(&self, tally: &mut VoteTally, vote: Vote) {
        if !self.verifier.verify(&vote) {
            tracing::warn!("Rejected vote with invalid signature from {}", vote.validator.short());
            return;
        }

        match tally.record(vote.validator, vote.decision) {
            TallyOutcome::Counted => {
                if let Some(active) = self.active.lock().as_mut() {
                    active.votes.insert(vote.validator, vote.decision);
                }
            }
            TallyOutcome::NotMember => {
                tracing::warn!("Ignoring vote from non-member {}", vote.validator.short());
            }
            TallyOutcome::Duplicate => {
                tracing::debug!("Duplicate vote from {}", vote.validator.short());
            }
        }
    }

    fn commit_round(&self, mut round: ConsensusRound, started: Instant) -> Result<ConsensusRound> {
        round.phase = Phase::Finalizing;
        if let Some(active) = self.active.lock().as_mut() {
            active.phase = Phase::Finalizing;
        }

        let nodes = match self.ledger.mark_final(&round.batch) {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::error!("Round {} could not finalize its batch: {}", round.round_id, e);
                let failure = RoundFailure {
                    algorithm: round.algorithm,
                    phase: Phase::Finalizing,
                    reason: FailureReason::Finalization,
                };
                self.record_failure(round, failure, started);
                return Err(e);
            }
        };

        Self::close(&mut round, RoundStatus::Committed, started);
        let duration_ms = round.duration_ms.unwrap_or(0);
        {
            let mut metrics = self.metrics.write();
            metrics.rounds_committed += 1;
            if metrics.degraded {
                tracing::info!("Consensus recovered at round {}", round.round_id);
            }
            metrics.consecutive_failures = 0;
            metrics.degraded = false;
            metrics.finalized_nodes += nodes.len() as u64;
            metrics.average_round_duration_ms +=
                (duration_ms as f64 - metrics.average_round_duration_ms) / metrics.rounds_committed as f64;
            let closed = (metrics.rounds_committed + metrics.rounds_failed) as f64;
            metrics.average_participation += (round.participation - metrics.average_participation) / closed;
        }
        self.archive(round.clone());

        tracing::info!(
            "Round {} committed: {} nodes final in {}ms",
            round.round_id,
            nodes.len(),
            duration_ms
        );

        let batch = FinalizedBatch {
            round_id: round.round_id,
            committed_at: round.ended_at.unwrap_or_else(now_millis),
            nodes,
        };
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_finalized(&batch);
        }

        self.publish(LedgerEvent::RoundCommitted {
            round_id: round.round_id,
            finalized_nodes: batch.nodes.len(),
            duration_ms,
        });
        Ok(round)
    }

    fn fail_round(&self, round: ConsensusRound, failure: RoundFailure, started: Instant) -> SdupiError {
        let round_id = round.round_id;
        self.record_failure(round, failure, started);
        match failure.reason {
            FailureReason::Timeout => SdupiError::QuorumTimeout {
                round_id,
                phase: failure.phase,
            },
            FailureReason::Rejected => SdupiError::QuorumRejected {
                round_id,
                phase: failure.phase,
            },
            FailureReason::Cancelled => SdupiError::ShuttingDown,
            FailureReason::Finalization => {
                SdupiError::Validation(format!("round {} could not finalize its batch", round_id))
            }
        }
    }

    fn record_failure(&self, mut round: ConsensusRound, failure: RoundFailure, started: Instant) {
        round.failures.push(failure);
        Self::close(&mut round, RoundStatus::Failed, started);

        let degraded = {
            let mut metrics = self.metrics.write();
            metrics.rounds_failed += 1;
            metrics.consecutive_failures += 1;
            let closed = (metrics.rounds_committed + metrics.rounds_failed) as f64;
            metrics.average_participation += (round.participation - metrics.average_participation) / closed;

            let crossed = !metrics.degraded
                && metrics.consecutive_failures >= self.config.degraded_after_failures;
            if crossed {
                metrics.degraded = true;
            }
            crossed.then_some(metrics.consecutive_failures)
        };

        tracing::warn!(
            "Round {} failed in {:?} ({:?}) after {}ms",
            round.round_id,
            failure.phase,
            failure.reason,
            round.duration_ms.unwrap_or(0)
        );
        self.publish(LedgerEvent::RoundFailed {
            round_id: round.round_id,
            phase: failure.phase,
            reason: failure.reason,
        });
        self.archive(round);

        if let Some(consecutive_failures) = degraded {
            tracing::warn!(
                "Consensus degraded: {} consecutive rounds failed",
                consecutive_failures
            );
            self.publish(LedgerEvent::ConsensusDegraded { consecutive_failures });
        }
    }

    fn close(round: &mut ConsensusRound, status: RoundStatus, started: Instant) {
        round.status = status;
        round.ended_at = Some(now_millis());
        round.duration_ms = Some(started.elapsed().as_millis() as u64);
    }

    fn archive(&self, round: ConsensusRound) {
        let mut history = self.history.write();
        history.push_back(round);
        while history.len() > self.config.round_history {
            history.pop_front();
        }
    }

    fn publish(&self, event: LedgerEvent) {
        if let Some(tx) = self.event_tx.read().as_ref() {
            // No subscribers is fine
            let _ = tx.send(event);
        }
    }
}
