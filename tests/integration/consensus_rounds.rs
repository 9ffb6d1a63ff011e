//! Consensus round scenarios against a seven-member committee

use std::sync::Arc;

use async_trait::async_trait;

use sdupi::config::{ConsensusConfig, DagConfig};
use sdupi::consensus::ConsensusEngine;
use sdupi::crypto::KeyPair;
use sdupi::dag::DagLedger;
use sdupi::error::{Result, SdupiError};
use sdupi::network::{ConsensusNetwork, VoteRequest, VoteSender};
use sdupi::round::{Ballot, ConsensusAlgorithm, Decision, FailureReason, Phase, RoundStatus, Vote};
use sdupi::types::PayloadRef;
use sdupi::validators::ValidatorRegistry;

const COMMITTEE: u8 = 7;
const STAKE: u64 = 1_000;

/// Network where only the listed keys answer, always approving
struct PartialNetwork {
    voters: Vec<KeyPair>,
}

#[async_trait]
impl ConsensusNetwork for PartialNetwork {
    async fn solicit_votes(&self, request: VoteRequest, votes: VoteSender) -> Result<()> {
        for voter in &self.voters {
            votes
                .send(Vote::signed(voter, request.ballot, Decision::Approve))
                .await
                .map_err(|e| SdupiError::Network(e.to_string()))?;
        }
        Ok(())
    }
}

struct Cluster {
    keys: Vec<KeyPair>,
    registry: Arc<ValidatorRegistry>,
    ledger: Arc<DagLedger>,
}

fn create_cluster() -> Cluster {
    let keys: Vec<KeyPair> = (1..=COMMITTEE).map(|i| KeyPair::from_seed([i; 32])).collect();
    let registry = Arc::new(ValidatorRegistry::new(STAKE));
    for key in &keys {
        registry.upsert(key.validator_id(), STAKE);
    }
    let ledger = Arc::new(DagLedger::new(
        DagConfig {
            tip_selection_seed: Some(1),
            ..DagConfig::default()
        },
        Arc::clone(&registry),
    ));
    let proposer = keys[0].validator_id();
    ledger.add_node(vec![PayloadRef::from("genesis")], proposer).unwrap();
    for i in 0..3 {
        ledger
            .add_node(vec![PayloadRef::from(format!("tx-{}", i).as_str())], proposer)
            .unwrap();
    }
    Cluster {
        keys,
        registry,
        ledger,
    }
}

fn consensus_config(algorithm: ConsensusAlgorithm) -> ConsensusConfig {
    ConsensusConfig {
        algorithm,
        phase_timeout_ms: 1_000,
        ..ConsensusConfig::default()
    }
}

fn create_engine(cluster: &Cluster, algorithm: ConsensusAlgorithm, voters: usize) -> Arc<ConsensusEngine> {
    let voters = (1..=voters as u8).map(|i| KeyPair::from_seed([i; 32])).collect();
    Arc::new(ConsensusEngine::new(
        consensus_config(algorithm),
        Arc::clone(&cluster.registry),
        Arc::clone(&cluster.ledger),
        Arc::new(PartialNetwork { voters }),
    ))
}

#[tokio::test(start_paused = true)]
async fn test_five_of_seven_commits_in_every_algorithm() {
    for algorithm in [
        ConsensusAlgorithm::LeaderBased,
        ConsensusAlgorithm::ByzantineVoting,
        ConsensusAlgorithm::Hybrid,
    ] {
        let cluster = create_cluster();
        let engine = create_engine(&cluster, algorithm, 5);
        let batch = cluster.ledger.finalization_candidates(usize::MAX);

        let round = engine.start_round(None).await.unwrap();
        assert_eq!(round.status, RoundStatus::Committed, "{:?}", algorithm);
        assert_eq!(round.committee.len(), COMMITTEE as usize);
        assert!(!round.fallback_used);
        assert!(batch.iter().all(|id| cluster.ledger.is_final(id) == Some(true)));
        assert!((round.participation - 5.0 / 7.0).abs() < 1e-9);
    }
}

#[tokio::test(start_paused = true)]
async fn test_two_of_seven_fails_after_timeout() {
    let cluster = create_cluster();
    let engine = create_engine(&cluster, ConsensusAlgorithm::ByzantineVoting, 2);

    let started = tokio::time::Instant::now();
    let err = engine.start_round(None).await.unwrap_err();
    assert!(matches!(
        err,
        SdupiError::QuorumTimeout {
            phase: Phase::Preparing,
            ..
        }
    ));
    assert!(err.is_recoverable());
    assert!(started.elapsed() >= std::time::Duration::from_millis(1_000));

    let round = engine.recent_rounds().pop().unwrap();
    assert_eq!(round.status, RoundStatus::Failed);
    assert_eq!(round.failure().unwrap().reason, FailureReason::Timeout);
    assert!(round.ended_at.is_some());
    assert_eq!(cluster.ledger.get_statistics().final_count, 0);

    // The next round proceeds normally
    assert!(matches!(
        engine.start_round(None).await,
        Err(SdupiError::QuorumTimeout { round_id: 2, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_hybrid_falls_back_when_leader_attempt_times_out() {
    /// Answers only the Byzantine fallback attempt
    struct FallbackOnly(Vec<KeyPair>);

    #[async_trait]
    impl ConsensusNetwork for FallbackOnly {
        async fn solicit_votes(&self, request: VoteRequest, votes: VoteSender) -> Result<()> {
            if request.algorithm != ConsensusAlgorithm::ByzantineVoting {
                return Ok(());
            }
            assert_eq!(request.leader, None);
            for key in &self.0 {
                let _ = votes.send(Vote::signed(key, request.ballot, Decision::Approve)).await;
            }
            Ok(())
        }
    }

    let cluster = create_cluster();
    let voters = (1..=COMMITTEE).map(|i| KeyPair::from_seed([i; 32])).collect();
    let engine = ConsensusEngine::new(
        consensus_config(ConsensusAlgorithm::Hybrid),
        Arc::clone(&cluster.registry),
        Arc::clone(&cluster.ledger),
        Arc::new(FallbackOnly(voters)),
    );

    let round = engine.start_round(None).await.unwrap();
    assert_eq!(round.status, RoundStatus::Committed);
    assert_eq!(round.requested_algorithm, ConsensusAlgorithm::Hybrid);
    assert_eq!(round.algorithm, ConsensusAlgorithm::ByzantineVoting);
    assert!(round.fallback_used);
    assert_eq!(round.failures[0].phase, Phase::Proposing);
    assert_eq!(round.failures[0].reason, FailureReason::Timeout);
}

#[tokio::test(start_paused = true)]
async fn test_hybrid_fails_once_when_both_attempts_time_out() {
    let cluster = create_cluster();
    let engine = create_engine(&cluster, ConsensusAlgorithm::Hybrid, 2);

    let started = tokio::time::Instant::now();
    let err = engine.start_round(None).await.unwrap_err();
    assert!(matches!(
        err,
        SdupiError::QuorumTimeout {
            round_id: 1,
            phase: Phase::Preparing
        }
    ));
    assert!(started.elapsed() >= std::time::Duration::from_millis(2_000));

    let rounds = engine.recent_rounds();
    assert_eq!(rounds.len(), 1);
    let round = &rounds[0];
    assert_eq!(round.status, RoundStatus::Failed);
    assert!(round.fallback_used);
    assert_eq!(round.algorithm, ConsensusAlgorithm::ByzantineVoting);
    assert_eq!(round.failures.len(), 2);
    assert_eq!(round.failures[0].algorithm, ConsensusAlgorithm::LeaderBased);
    assert_eq!(round.failures[0].phase, Phase::Proposing);
    assert_eq!(round.failures[1].algorithm, ConsensusAlgorithm::ByzantineVoting);
    assert_eq!(round.failures[1].phase, Phase::Preparing);
    assert!(round.failures.iter().all(|f| f.reason == FailureReason::Timeout));

    let stats = engine.get_consensus_stats();
    assert_eq!(stats.fallbacks_used, 1);
    assert_eq!(stats.rounds_failed, 1);
    assert_eq!(stats.rounds_committed, 0);
    assert_eq!(cluster.ledger.get_statistics().final_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_round_in_progress_leaves_running_round_untouched() {
    let cluster = create_cluster();
    let engine = create_engine(&cluster, ConsensusAlgorithm::ByzantineVoting, 0);
    let votes = engine.vote_sender();

    let handle = engine.spawn_round(None).unwrap();
    let running = engine.current_round().unwrap();
    assert_eq!(running.status, RoundStatus::Running);

    assert!(matches!(
        engine.start_round(None).await,
        Err(SdupiError::RoundInProgress(id)) if id == running.round_id
    ));

    // Mid-round changes are invisible to the running round
    let late = cluster
        .ledger
        .add_node(vec![PayloadRef::from("late")], cluster.keys[0].validator_id())
        .unwrap();
    cluster.registry.upsert(cluster.keys[6].validator_id(), STAKE * 100);

    for phase in [Phase::Preparing, Phase::Committing, Phase::Finalizing] {
        let ballot = Ballot::new(running.round_id, 0, phase);
        for key in &cluster.keys[..5] {
            votes
                .send(Vote::signed(key, ballot, Decision::Approve))
                .await
                .unwrap();
        }
    }

    let round = handle.await.unwrap().unwrap();
    assert_eq!(round.round_id, running.round_id);
    assert_eq!(round.status, RoundStatus::Committed);
    assert_eq!(round.batch, running.batch);
    assert!(!round.batch.contains(&late));
    assert!(round.committee.iter().all(|m| m.weight == STAKE));
    assert_eq!(cluster.ledger.is_final(&late), Some(false));
    assert_eq!(cluster.ledger.finalization_candidates(10), vec![late]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_without_finalizing() {
    let cluster = create_cluster();
    let engine = create_engine(&cluster, ConsensusAlgorithm::Hybrid, 0);

    let handle = engine.spawn_round(None).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    engine.shutdown();

    assert!(matches!(handle.await.unwrap(), Err(SdupiError::ShuttingDown)));
    let round = engine.recent_rounds().pop().unwrap();
    assert_eq!(round.status, RoundStatus::Failed);
    assert_eq!(round.failure().unwrap().reason, FailureReason::Cancelled);
    // Cancellation skips the hybrid fallback
    assert!(!round.fallback_used);
    assert_eq!(cluster.ledger.get_statistics().final_count, 0);
    assert!(!engine.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_degraded_consensus_does_not_block_writes() {
    let cluster = create_cluster();
    let engine = create_engine(&cluster, ConsensusAlgorithm::ByzantineVoting, 2);

    for _ in 0..ConsensusConfig::default().degraded_after_failures {
        assert!(engine.start_round(None).await.is_err());
    }
    let stats = engine.get_consensus_stats();
    assert!(stats.degraded);
    assert_eq!(stats.consecutive_failures, 3);
    assert!(matches!(engine.check_health(), Err(SdupiError::DegradedConsensus(3))));

    cluster
        .ledger
        .add_node(vec![PayloadRef::from("still-writing")], cluster.keys[1].validator_id())
        .unwrap();
    assert_eq!(cluster.ledger.len(), 5);
}
