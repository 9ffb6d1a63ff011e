//! DAG ledger tests: concurrent insertion, tip invariants, tip distribution

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;

use sdupi::config::DagConfig;
use sdupi::dag::DagLedger;
use sdupi::error::SdupiError;
use sdupi::types::{NodeId, PayloadRef, ValidatorId};
use sdupi::validators::ValidatorRegistry;

fn validator(byte: u8) -> ValidatorId {
    ValidatorId([byte; 32])
}

fn create_ledger(stakes: &[(ValidatorId, u64)]) -> Arc<DagLedger> {
    let registry = Arc::new(ValidatorRegistry::new(1));
    for (id, stake) in stakes {
        registry.upsert(*id, *stake);
    }
    let config = DagConfig {
        tip_selection_seed: Some(42),
        ..DagConfig::default()
    };
    Arc::new(DagLedger::new(config, registry))
}

fn payload(label: &str) -> Vec<PayloadRef> {
    vec![PayloadRef::from(label)]
}

/// No tip may be a parent of another tip
fn assert_tips_are_independent(ledger: &DagLedger) {
    let tips: HashSet<NodeId> = ledger.tips().into_iter().collect();
    for tip in &tips {
        let node = ledger.get_node(tip).unwrap();
        for parent in &node.parents {
            assert!(!tips.contains(parent), "tip {} has tip parent {}", tip, parent);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_children_of_single_tip() {
    let proposer = validator(1);
    let ledger = create_ledger(&[(proposer, 100)]);
    let genesis = ledger.add_node(payload("genesis"), proposer).unwrap();

    let handles: Vec<_> = ["left", "right"]
        .into_iter()
        .map(|label| {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.add_node_with_parents(payload(label), proposer, vec![genesis]) })
        })
        .collect();

    let mut children = HashSet::new();
    for handle in handles {
        children.insert(handle.await.unwrap().unwrap());
    }

    let tips: HashSet<NodeId> = ledger.tips().into_iter().collect();
    assert_eq!(tips, children);
    assert!(!tips.contains(&genesis));
    assert_tips_are_independent(&ledger);
}

#[test]
fn test_tip_selection_follows_stake() {
    let stakes = [10u64, 20, 30, 15, 25];
    let root = validator(100);
    let mut registered: Vec<(ValidatorId, u64)> = stakes
        .iter()
        .enumerate()
        .map(|(i, stake)| (validator(i as u8 + 1), *stake))
        .collect();
    registered.push((root, 1));
    let ledger = create_ledger(&registered);

    let genesis = ledger.add_node(payload("genesis"), root).unwrap();
    let mut stake_of_tip = HashMap::new();
    for (i, stake) in stakes.iter().enumerate() {
        let id = ledger
            .add_node_with_parents(payload(&format!("child-{}", i)), validator(i as u8 + 1), vec![genesis])
            .unwrap();
        stake_of_tip.insert(id, *stake);
    }
    assert_eq!(ledger.tips().len(), stakes.len());

    const TRIALS: usize = 100_000;
    let mut rng = StdRng::seed_from_u64(2024);
    let mut observed: HashMap<NodeId, usize> = HashMap::new();
    for _ in 0..TRIALS {
        let picked = ledger.select_tips_with(1, &mut rng);
        assert_eq!(picked.len(), 1);
        *observed.entry(picked[0]).or_default() += 1;
    }

    let total_stake: u64 = stakes.iter().sum();
    let chi_square: f64 = stake_of_tip
        .iter()
        .map(|(id, stake)| {
            let expected = TRIALS as f64 * *stake as f64 / total_stake as f64;
            let seen = *observed.get(id).unwrap_or(&0) as f64;
            (seen - expected).powi(2) / expected
        })
        .sum();

    // 4 degrees of freedom, p = 0.001
    assert!(chi_square < 18.47, "chi-square {} too large", chi_square);
}

#[test]
fn test_fanout_selects_distinct_parents() {
    let proposers: Vec<ValidatorId> = (1..=6).map(validator).collect();
    let ledger = create_ledger(&proposers.iter().map(|p| (*p, 50)).collect::<Vec<_>>());
    let genesis = ledger.add_node(payload("genesis"), proposers[0]).unwrap();
    for (i, proposer) in proposers.iter().enumerate() {
        ledger
            .add_node_with_parents(payload(&format!("branch-{}", i)), *proposer, vec![genesis])
            .unwrap();
    }

    let picked = ledger.select_tips(2);
    assert_eq!(picked.len(), 2);
    assert_ne!(picked[0], picked[1]);

    // Asking for more than exists returns every tip
    assert_eq!(ledger.select_tips(50).len(), 6);
}

#[test]
fn test_tip_set_stays_independent_under_random_growth() {
    let proposers: Vec<ValidatorId> = (1..=4).map(validator).collect();
    let ledger = create_ledger(&[
        (proposers[0], 10),
        (proposers[1], 40),
        (proposers[2], 0),
        (proposers[3], 25),
    ]);

    ledger.add_node(payload("genesis"), proposers[0]).unwrap();
    for i in 0..200 {
        let proposer = proposers[i % proposers.len()];
        ledger.add_node(payload(&format!("tx-{}", i)), proposer).unwrap();
        assert_tips_are_independent(&ledger);
    }

    let stats = ledger.get_statistics();
    assert_eq!(stats.node_count, 201);
    assert_eq!(stats.pending_count, 201);
    assert_eq!(stats.tip_count, ledger.tips().len());
    for id in ledger.finalization_candidates(usize::MAX) {
        assert!(ledger.verify_node(&id).unwrap());
    }
}

#[test]
fn test_finality_is_atomic_and_monotonic() {
    let proposer = validator(1);
    let ledger = create_ledger(&[(proposer, 100)]);
    let genesis = ledger.add_node(payload("genesis"), proposer).unwrap();
    let child = ledger.add_node(payload("tx"), proposer).unwrap();

    let unknown = NodeId::new();
    assert!(matches!(
        ledger.mark_final(&[genesis, unknown]),
        Err(SdupiError::UnknownNode(id)) if id == unknown
    ));
    assert_eq!(ledger.is_final(&genesis), Some(false));

    let first = ledger.mark_final(&[genesis, child]).unwrap();
    assert_eq!(first.len(), 2);
    let again = ledger.mark_final(&[genesis, child]).unwrap();
    assert!(again.is_empty());
    assert_eq!(ledger.is_final(&child), Some(true));
    assert!(ledger.finalization_candidates(10).is_empty());

    // Writes continue after finality
    let later = ledger.add_node(payload("later"), proposer).unwrap();
    assert_eq!(ledger.is_final(&later), Some(false));
    assert_eq!(ledger.get_statistics().final_count, 2);
}
