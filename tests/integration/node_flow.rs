//! End-to-end node flow: submissions, scheduled rounds, finality, reports

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use sdupi::config::Config;
use sdupi::consensus::ConsensusEngine;
use sdupi::crypto::KeyPair;
use sdupi::dag::{DagLedger, NodeSubmission};
use sdupi::events::LedgerEvent;
use sdupi::metrics::PerformanceMonitor;
use sdupi::network::LoopbackNetwork;
use sdupi::types::PayloadRef;
use sdupi::validators::ValidatorRegistry;

struct TestNode {
    keys: Vec<KeyPair>,
    ledger: Arc<DagLedger>,
    engine: Arc<ConsensusEngine>,
    monitor: Arc<PerformanceMonitor>,
    events: broadcast::Receiver<LedgerEvent>,
    _dir: tempfile::TempDir,
}

fn create_test_node() -> TestNode {
    let dir = tempfile::TempDir::new().unwrap();
    let mut config = Config::load_from(dir.path().join("sdupi_config.json")).unwrap();
    config.dag.tip_selection_seed = Some(11);
    config.consensus.round_interval_ms = 100;

    let keys: Vec<KeyPair> = (1..=4u8).map(|i| KeyPair::from_seed([i; 32])).collect();
    let registry = Arc::new(ValidatorRegistry::new(config.validators.min_stake));
    for (i, key) in keys.iter().enumerate() {
        registry.upsert(key.validator_id(), config.validators.min_stake * (i as u64 + 1));
    }

    let ledger = Arc::new(DagLedger::new(config.dag.clone(), Arc::clone(&registry)));
    let signers = (1..=4u8).map(|i| KeyPair::from_seed([i; 32])).collect();
    let engine = Arc::new(ConsensusEngine::new(
        config.consensus.clone(),
        registry,
        Arc::clone(&ledger),
        Arc::new(LoopbackNetwork::new(signers)),
    ));
    let monitor = Arc::new(PerformanceMonitor::new(config.metrics.clone()));
    engine.add_finality_listener(monitor.clone());

    let (event_tx, events) = broadcast::channel(4096);
    ledger.set_event_sender(event_tx.clone());
    engine.set_event_sender(event_tx);

    TestNode {
        keys,
        ledger,
        engine,
        monitor,
        events,
        _dir: dir,
    }
}

#[tokio::test(start_paused = true)]
async fn test_submitted_payloads_become_final_and_are_measured() {
    let mut node = create_test_node();
    let genesis_proposer = node.keys[0].validator_id();
    node.ledger
        .add_node(vec![PayloadRef::from("genesis")], genesis_proposer)
        .unwrap();

    let scheduler = tokio::spawn(Arc::clone(&node.engine).run_scheduler());

    let mut payloads = 1;
    for wave in 0..5 {
        let submissions: Vec<NodeSubmission> = node
            .keys
            .iter()
            .enumerate()
            .map(|(i, key)| NodeSubmission {
                payload_refs: (0..3)
                    .map(|j| PayloadRef::from(format!("wave-{}-node-{}-tx-{}", wave, i, j).as_str()))
                    .collect(),
                proposer: key.validator_id(),
                parents: None,
            })
            .collect();
        for result in node.ledger.add_nodes(submissions).await {
            result.unwrap();
            payloads += 3;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    tokio::time::sleep(Duration::from_secs(2)).await;

    let stats = node.ledger.get_statistics();
    assert_eq!(stats.node_count, 21);
    assert_eq!(stats.final_count, 21);
    assert_eq!(stats.pending_count, 0);
    assert_eq!(node.monitor.total_finalized(), payloads);

    let consensus = node.engine.get_consensus_stats();
    assert!(consensus.rounds_committed >= 1);
    assert_eq!(consensus.rounds_failed, 0);
    assert_eq!(consensus.finalized_nodes, 21);
    assert!(!consensus.degraded);

    let report = node.monitor.report(&node.ledger, &node.engine).unwrap();
    assert!(report.peak_tps > 0.0);
    assert_eq!(report.ledger.final_count, 21);
    assert!(report.p50.samples as u64 <= payloads);

    node.engine.shutdown();
    scheduler.await.unwrap();

    let mut added = 0;
    let mut committed = 0;
    while let Ok(event) = node.events.try_recv() {
        match event {
            LedgerEvent::NodeAdded { .. } => added += 1,
            LedgerEvent::RoundCommitted { .. } => committed += 1,
            _ => {}
        }
    }
    assert_eq!(added, 21);
    assert_eq!(committed as u64, consensus.rounds_committed);
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_idles_without_pending_nodes() {
    let node = create_test_node();
    let scheduler = tokio::spawn(Arc::clone(&node.engine).run_scheduler());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(node.engine.get_consensus_stats().rounds_started, 0);
    assert_eq!(node.monitor.compute_tps(), 0.0);

    node.engine.shutdown();
    scheduler.await.unwrap();
    assert!(node.engine.start_round(None).await.is_err());
}
