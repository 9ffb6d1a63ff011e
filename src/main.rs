//! SDUPI devnet node
//!
//! Single-validator node: a local DAG ledger, a consensus engine voting
//! through the loopback network, and periodic performance reports.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sdupi::config::Config;
use sdupi::consensus::ConsensusEngine;
use sdupi::crypto::{ContentHasher, KeyPair};
use sdupi::dag::{DagLedger, NodeSubmission};
use sdupi::events::LedgerEvent;
use sdupi::metrics::PerformanceMonitor;
use sdupi::network::LoopbackNetwork;
use sdupi::types::{PayloadRef, ValidatorId};
use sdupi::validators::ValidatorRegistry;

const REPORT_INTERVAL: Duration = Duration::from_secs(10);
const LOAD_TICK: Duration = Duration::from_millis(100);
const NODES_PER_TICK: u64 = 4;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    // Initialize logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("═══════════════════════════════════════════════════════════");
    info!("  SDUPI devnet node");
    info!("═══════════════════════════════════════════════════════════");
    info!("✓ Configuration loaded from: {}", sdupi::config::DEFAULT_CONFIG_PATH);
    info!("  Node ID: {}", config.node_id);
    info!("  Consensus: {:?}, phase timeout {}ms", config.consensus.algorithm, config.consensus.phase_timeout_ms);
    info!("  Tip fan-out: {}", config.dag.tip_fanout);

    // Local validator
    let keypair = KeyPair::generate();
    let validator = keypair.validator_id();
    let registry = Arc::new(ValidatorRegistry::new(config.validators.min_stake));
    let entry = registry.upsert(validator, config.local_stake);
    info!("✓ Validator {} registered (stake {}, active: {})", validator.short(), entry.stake, entry.active);

    // Ledger and event channel
    let ledger = Arc::new(DagLedger::new(config.dag.clone(), Arc::clone(&registry)));
    let (event_tx, _) = broadcast::channel::<LedgerEvent>(1024);
    ledger.set_event_sender(event_tx.clone());
    let genesis = ledger.add_node(vec![PayloadRef::from("genesis")], validator)?;
    info!("✓ DAG ledger initialized, genesis {}", genesis);

    // Consensus
    let network = Arc::new(LoopbackNetwork::new(vec![keypair]));
    let engine = Arc::new(ConsensusEngine::new(
        config.consensus.clone(),
        Arc::clone(&registry),
        Arc::clone(&ledger),
        network,
    ));
    engine.set_event_sender(event_tx.clone());
    info!("✓ Consensus engine initialized");

    let monitor = Arc::new(PerformanceMonitor::new(config.metrics.clone()));
    engine.add_finality_listener(monitor.clone());
    info!("✓ Performance monitor attached");

    let shutdown = engine.shutdown_token();
    let scheduler_handle = tokio::spawn(Arc::clone(&engine).run_scheduler());
    let events_handle = tokio::spawn(log_events(event_tx.subscribe(), shutdown.clone()));
    let load_handle = (config.demo_load > 0).then(|| {
        tokio::spawn(generate_load(
            Arc::clone(&ledger),
            validator,
            config.demo_load,
            shutdown.clone(),
        ))
    });

    let reporter_ledger = Arc::clone(&ledger);
    let reporter_engine = Arc::clone(&engine);
    let reporter_monitor = Arc::clone(&monitor);
    let reporter_shutdown = shutdown.clone();
    let reporter_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(REPORT_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = reporter_shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            report(&reporter_monitor, &reporter_ledger, &reporter_engine);
        }
    });

    info!("═══════════════════════════════════════════════════════════");
    info!("  SDUPI node is running!");
    info!("  Press Ctrl+C to shutdown");
    info!("═══════════════════════════════════════════════════════════");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down SDUPI node...");

    engine.shutdown();
    if let Err(e) = scheduler_handle.await {
        error!("Scheduler task failed: {}", e);
    }
    if let Some(handle) = load_handle {
        let _ = handle.await;
    }
    let _ = reporter_handle.await;
    let _ = events_handle.await;

    report(&monitor, &ledger, &engine);
    Ok(())
}

fn report(monitor: &PerformanceMonitor, ledger: &DagLedger, engine: &ConsensusEngine) {
    match monitor.report(ledger, engine) {
        Ok(report) => info!(
            "TPS {:.1} (peak {:.1}) | latency p50 {:.0}ms p99 {:.0}ms{} | nodes {} ({} final, {} tips) | rounds {} ok / {} failed",
            report.tps,
            report.peak_tps,
            report.p50.value_ms,
            report.p99.value_ms,
            if report.p99.low_confidence { " (low confidence)" } else { "" },
            report.ledger.node_count,
            report.ledger.final_count,
            report.ledger.tip_count,
            report.consensus.rounds_committed,
            report.consensus.rounds_failed
        ),
        Err(e) => error!("Failed to build performance report: {}", e),
    }
}

/// Submit `per_second` payload references as devnet traffic
async fn generate_load(
    ledger: Arc<DagLedger>,
    proposer: ValidatorId,
    per_second: u64,
    shutdown: CancellationToken,
) {
    let ticks_per_second = (1000 / LOAD_TICK.as_millis() as u64).max(1);
    let refs_per_node = (per_second / ticks_per_second / NODES_PER_TICK).max(1) as usize;
    let mut counter: u64 = 0;
    let mut interval = tokio::time::interval(LOAD_TICK);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let submissions: Vec<NodeSubmission> = (0..NODES_PER_TICK)
            .map(|_| NodeSubmission {
                payload_refs: (0..refs_per_node)
                    .map(|_| {
                        counter += 1;
                        PayloadRef::from(ledger.hasher().hash(&counter.to_le_bytes()))
                    })
                    .collect(),
                proposer,
                parents: None,
            })
            .collect();

        for result in ledger.add_nodes(submissions).await {
            if let Err(e) = result {
                error!("Devnet submission rejected: {}", e);
            }
        }
    }
}

/// Log ledger events as JSON at debug level
async fn log_events(mut events: broadcast::Receiver<LedgerEvent>, shutdown: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = events.recv() => received,
        };
        match event {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::debug!("event {}", json),
                Err(e) => error!("Failed to serialize event: {}", e),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Event log lagged, {} events skipped", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
