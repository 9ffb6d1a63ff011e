//! DAG ledger: node storage, tip tracking and stake-weighted parent selection
//!
//! Every node references 1..k earlier nodes (the genesis node references
//! none). Insertion and the tip-set update happen under one write lock, so no
//! reader can observe a node whose parents are still listed as tips. Parents
//! must already exist when a node is admitted and every node gets the next
//! local sequence number, so a parent always has a lower sequence than its
//! child and cycles cannot be formed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::config::DagConfig;
use crate::crypto::ContentHasher;
use crate::error::{Result, SdupiError};
use crate::events::{EventSender, LedgerEvent};
use crate::types::{Hash, NodeId, PayloadRef, Timestamp, ValidatorId, now_millis};
use crate::validators::ValidatorRegistry;

/// Maximum byte length of a single payload reference
pub const MAX_PAYLOAD_REF_LEN: usize = 256;

/// Immutable DAG node. Only the finality flag changes after creation, and
/// only from false to true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagNode {
    pub id: NodeId,
    pub payload_refs: Vec<PayloadRef>,
    /// Sorted ascending, so the hash preimage does not depend on selection order
    pub parents: Vec<NodeId>,
    pub proposer: ValidatorId,
    /// Proposer stake captured at creation
    pub proposer_stake: u64,
    pub created_at: Timestamp,
    pub content_hash: Hash,
    /// Local insertion sequence
    #[serde(skip)]
    sequence: u64,
    #[serde(skip)]
    finalized: bool,
}

#[derive(Serialize)]
struct HashPreimage<'a> {
    id: &'a NodeId,
    payload_refs: &'a [PayloadRef],
    parent_hashes: &'a [Hash],
    created_at: Timestamp,
    proposer: &'a ValidatorId,
    proposer_stake: u64,
}

impl DagNode {
    /// Content hash over the immutable fields; `parent_hashes` must follow
    /// the order of `parents`
    pub fn compute_hash(&self, hasher: &dyn ContentHasher, parent_hashes: &[Hash]) -> Result<Hash> {
        let preimage = HashPreimage {
            id: &self.id,
            payload_refs: &self.payload_refs,
            parent_hashes,
            created_at: self.created_at,
            proposer: &self.proposer,
            proposer_stake: self.proposer_stake,
        };
        let data = bincode::serialize(&preimage)?;
        Ok(hasher.hash(&data))
    }

    pub fn is_final(&self) -> bool {
        self.finalized
    }

    pub fn is_genesis(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Node newly marked final by a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FinalizedNode {
    pub id: NodeId,
    pub created_at: Timestamp,
    pub payload_count: usize,
}

/// Node submission for batch insertion
#[derive(Debug, Clone)]
pub struct NodeSubmission {
    pub payload_refs: Vec<PayloadRef>,
    pub proposer: ValidatorId,
    /// Explicit parents; `None` selects them from the tip set
    pub parents: Option<Vec<NodeId>>,
}

/// Point-in-time ledger statistics
#[derive(Debug, Clone, Serialize)]
pub struct DagStatistics {
    pub node_count: usize,
    pub tip_count: usize,
    pub final_count: usize,
    pub pending_count: usize,
    pub total_payload_refs: u64,
    pub rejected_insertions: u64,
    pub genesis: Option<NodeId>,
    pub first_insert_at: Option<Timestamp>,
    pub last_insert_at: Option<Timestamp>,
    /// Node insertions per second since genesis
    pub nodes_per_second: f64,
}

#[derive(Default)]
struct DagStore {
    nodes: HashMap<NodeId, DagNode>,
    by_hash: HashMap<Hash, NodeId>,
    /// Tip set keyed by sequence for a stable iteration order
    tips: BTreeMap<u64, NodeId>,
    /// Non-final nodes, oldest first
    pending: BTreeMap<u64, NodeId>,
    next_sequence: u64,
    final_count: usize,
    total_payload_refs: u64,
    genesis: Option<NodeId>,
    first_insert_at: Option<Timestamp>,
    last_insert_at: Option<Timestamp>,
}

struct NodeDraft {
    id: NodeId,
    payload_refs: Vec<PayloadRef>,
    parents: Vec<NodeId>,
    proposer: ValidatorId,
    proposer_stake: u64,
    created_at: Timestamp,
    /// Hash claimed by an imported node
    claimed_hash: Option<Hash>,
}

/// DAG ledger
pub struct DagLedger {
    config: DagConfig,
    registry: Arc<ValidatorRegistry>,
    hasher: Arc<dyn ContentHasher>,
    store: RwLock<DagStore>,
    rng: Mutex<StdRng>,
    rejected: AtomicU64,
    event_tx: RwLock<Option<EventSender>>,
}

impl DagLedger {
    pub fn new(config: DagConfig, registry: Arc<ValidatorRegistry>) -> Self {
        let hasher = config.hash_algorithm.hasher();
        Self::with_hasher(config, registry, hasher)
    }

    pub fn with_hasher(
        config: DagConfig,
        registry: Arc<ValidatorRegistry>,
        hasher: Arc<dyn ContentHasher>,
    ) -> Self {
        let rng = match config.tip_selection_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            registry,
            hasher,
            store: RwLock::new(DagStore::default()),
            rng: Mutex::new(rng),
            rejected: AtomicU64::new(0),
            event_tx: RwLock::new(None),
        }
    }

    pub fn set_event_sender(&self, tx: EventSender) {
        *self.event_tx.write() = Some(tx);
    }

    pub fn hasher(&self) -> &dyn ContentHasher {
        self.hasher.as_ref()
    }

    /// Add a node whose parents are drawn from the current tips.
    ///
    /// The first node ever inserted becomes the genesis node.
    pub fn add_node(&self, payload_refs: Vec<PayloadRef>, proposer: ValidatorId) -> Result<NodeId> {
        let result = self
            .validate_payload(&payload_refs)
            .and_then(|_| self.insert_submission(payload_refs, proposer, None));
        self.track(result)
    }

    /// Add a node with caller-supplied parents
    pub fn add_node_with_parents(
        &self,
        payload_refs: Vec<PayloadRef>,
        proposer: ValidatorId,
        parents: Vec<NodeId>,
    ) -> Result<NodeId> {
        let result = self
            .validate_payload(&payload_refs)
            .and_then(|_| self.insert_submission(payload_refs, proposer, Some(parents)));
        self.track(result)
    }

    /// Admit a fully formed node received from a peer.
    ///
    /// The node keeps its id, timestamp and captured stake; its content hash
    /// must match the recomputed one. The proposer must be registered here and
    /// the captured stake may not exceed its locally known stake. Imported
    /// nodes always start non-final.
    pub fn import_node(&self, node: DagNode) -> Result<NodeId> {
        let result = self.validate_payload(&node.payload_refs).and_then(|_| {
            let registered = self
                .registry
                .stake_of(&node.proposer)
                .ok_or(SdupiError::UnknownProposer(node.proposer))?;
            if node.proposer_stake > registered {
                return Err(SdupiError::InvalidStake {
                    validator: node.proposer,
                    reason: format!(
                        "captured stake {} exceeds registered stake {}",
                        node.proposer_stake, registered
                    ),
                });
            }
            self.validate_parent_list(&node.parents)?;
            let draft = NodeDraft {
                id: node.id,
                payload_refs: node.payload_refs,
                parents: node.parents,
                proposer: node.proposer,
                proposer_stake: node.proposer_stake,
                created_at: node.created_at,
                claimed_hash: Some(node.content_hash),
            };
            let mut store = self.store.write();
            let inserted = self.insert_locked(&mut store, draft)?;
            drop(store);
            self.publish_added(&inserted);
            Ok(inserted.id)
        });
        self.track(result)
    }

    /// Add many nodes, validating payloads concurrently on a bounded pool.
    ///
    /// Results follow submission order. Insertion itself still serializes at
    /// the tip-set lock.
    pub async fn add_nodes(self: &Arc<Self>, submissions: Vec<NodeSubmission>) -> Vec<Result<NodeId>> {
        let semaphore = Arc::new(Semaphore::new(self.config.validation_workers));
        let checks = submissions.into_iter().map(|submission| {
            let ledger = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| SdupiError::Validation("validation pool closed".to_string()))?;
                ledger.validate_payload(&submission.payload_refs)?;
                Ok::<NodeSubmission, SdupiError>(submission)
            })
        });

        let validated = futures::future::join_all(checks).await;
        validated
            .into_iter()
            .map(|joined| {
                let result = match joined {
                    Ok(Ok(submission)) => self.insert_submission(
                        submission.payload_refs,
                        submission.proposer,
                        submission.parents,
                    ),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(SdupiError::Validation(format!("validation task failed: {}", e))),
                };
                self.track(result)
            })
            .collect()
    }

    /// Stake-weighted sample of up to `k` tips, using the ledger's seeded rng
    pub fn select_tips(&self, k: usize) -> Vec<NodeId> {
        let store = self.store.read();
        let mut rng = self.rng.lock();
        self.sample_tips(&store, k, &mut *rng)
    }

    /// Stake-weighted sample of up to `k` tips with a caller-provided rng
    pub fn select_tips_with<R: Rng + ?Sized>(&self, k: usize, rng: &mut R) -> Vec<NodeId> {
        let store = self.store.read();
        self.sample_tips(&store, k, rng)
    }

    /// Mark nodes final. Re-marking a final node is a no-op. Either every id
    /// is known and all are marked, or nothing changes.
    pub fn mark_final(&self, node_ids: &[NodeId]) -> Result<Vec<FinalizedNode>> {
        let mut store = self.store.write();
        if let Some(missing) = node_ids.iter().find(|id| !store.nodes.contains_key(id)) {
            return Err(SdupiError::UnknownNode(*missing));
        }

        let mut newly_final = Vec::new();
        for id in node_ids {
            let Some(node) = store.nodes.get_mut(id) else {
                continue;
            };
            if node.finalized {
                continue;
            }
            node.finalized = true;
            let sequence = node.sequence;
            newly_final.push(FinalizedNode {
                id: node.id,
                created_at: node.created_at,
                payload_count: node.payload_refs.len(),
            });
            store.pending.remove(&sequence);
            store.final_count += 1;
        }
        Ok(newly_final)
    }

    /// Up to `max` non-final nodes, oldest first
    pub fn finalization_candidates(&self, max: usize) -> Vec<NodeId> {
        self.store.read().pending.values().take(max).copied().collect()
    }

    pub fn get_statistics(&self) -> DagStatistics {
        let mut stats = {
            let store = self.store.read();
            DagStatistics {
                node_count: store.nodes.len(),
                tip_count: store.tips.len(),
                final_count: store.final_count,
                pending_count: store.pending.len(),
                total_payload_refs: store.total_payload_refs,
                rejected_insertions: 0,
                genesis: store.genesis,
                first_insert_at: store.first_insert_at,
                last_insert_at: store.last_insert_at,
                nodes_per_second: 0.0,
            }
        };

        stats.rejected_insertions = self.rejected.load(Ordering::Relaxed);
        if let Some(first) = stats.first_insert_at {
            let elapsed_ms = (now_millis() - first).max(1) as f64;
            stats.nodes_per_second = stats.node_count as f64 * 1000.0 / elapsed_ms;
        }
        stats
    }

    /// Current tips in insertion order
    pub fn tips(&self) -> Vec<NodeId> {
        self.store.read().tips.values().copied().collect()
    }

    pub fn get_node(&self, id: &NodeId) -> Option<DagNode> {
        self.store.read().nodes.get(id).cloned()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.store.read().nodes.contains_key(id)
    }

    pub fn is_final(&self, id: &NodeId) -> Option<bool> {
        self.store.read().nodes.get(id).map(|n| n.finalized)
    }

    pub fn len(&self) -> usize {
        self.store.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().nodes.is_empty()
    }

    /// Recompute a stored node's content hash and compare with the stored one
    pub fn verify_node(&self, id: &NodeId) -> Result<bool> {
        let store = self.store.read();
        let node = store.nodes.get(id).ok_or(SdupiError::UnknownNode(*id))?;
        let parent_hashes = Self::parent_hashes(&store, &node.parents)?;
        Ok(node.compute_hash(self.hasher.as_ref(), &parent_hashes)? == node.content_hash)
    }

    fn insert_submission(
        &self,
        payload_refs: Vec<PayloadRef>,
        proposer: ValidatorId,
        parents: Option<Vec<NodeId>>,
    ) -> Result<NodeId> {
        let proposer_stake = self
            .registry
            .stake_of(&proposer)
            .ok_or(SdupiError::UnknownProposer(proposer))?;
        if let Some(parents) = &parents {
            self.validate_parent_list(parents)?;
        }

        let inserted = {
            let mut store = self.store.write();
            let parents = match parents {
                Some(parents) => parents,
                None => {
                    let mut rng = self.rng.lock();
                    self.sample_tips(&store, self.config.tip_fanout, &mut *rng)
                }
            };
            let draft = NodeDraft {
                id: NodeId::new(),
                payload_refs,
                parents,
                proposer,
                proposer_stake,
                created_at: now_millis(),
                claimed_hash: None,
            };
            self.insert_locked(&mut store, draft)?
        };

        self.publish_added(&inserted);
        Ok(inserted.id)
    }

    fn insert_locked(&self, store: &mut DagStore, draft: NodeDraft) -> Result<DagNode> {
        if store.nodes.contains_key(&draft.id) {
            return Err(SdupiError::DuplicateNode(format!("node id {} already exists", draft.id)));
        }
        if draft.parents.is_empty() && !store.nodes.is_empty() {
            return Err(SdupiError::Validation(
                "only the genesis node may have no parents".to_string(),
            ));
        }
        if let Some(missing) = draft.parents.iter().find(|p| !store.nodes.contains_key(p)) {
            return Err(SdupiError::InvalidParent(*missing));
        }

        let mut parents = draft.parents;
        parents.sort();
        let parent_hashes = Self::parent_hashes(store, &parents)?;

        let mut node = DagNode {
            id: draft.id,
            payload_refs: draft.payload_refs,
            parents,
            proposer: draft.proposer,
            proposer_stake: draft.proposer_stake,
            created_at: draft.created_at,
            content_hash: [0u8; 32],
            sequence: store.next_sequence,
            finalized: false,
        };
        node.content_hash = node.compute_hash(self.hasher.as_ref(), &parent_hashes)?;

        if let Some(claimed) = draft.claimed_hash {
            if claimed != node.content_hash {
                return Err(SdupiError::Validation(format!(
                    "content hash mismatch for node {}",
                    node.id
                )));
            }
        }
        if let Some(existing) = store.by_hash.get(&node.content_hash) {
            return Err(SdupiError::DuplicateNode(format!(
                "content hash already stored as node {}",
                existing
            )));
        }

        // Nothing below can fail: the node and the tip update land together
        for parent in &node.parents {
            if let Some(parent_seq) = store.nodes.get(parent).map(|p| p.sequence) {
                store.tips.remove(&parent_seq);
            }
        }
        store.tips.insert(node.sequence, node.id);
        store.pending.insert(node.sequence, node.id);
        store.by_hash.insert(node.content_hash, node.id);
        store.next_sequence += 1;
        store.total_payload_refs += node.payload_refs.len() as u64;
        store.first_insert_at.get_or_insert(node.created_at);
        store.last_insert_at = Some(node.created_at);

        if node.is_genesis() {
            store.genesis = Some(node.id);
            tracing::info!("Genesis node {} inserted by {}", node.id, node.proposer.short());
        } else {
            tracing::debug!(
                "Node {} inserted with {} parents, {} payload refs (seq {})",
                node.id,
                node.parents.len(),
                node.payload_refs.len(),
                node.sequence
            );
        }

        store.nodes.insert(node.id, node.clone());
        Ok(node)
    }

    fn parent_hashes(store: &DagStore, parents: &[NodeId]) -> Result<Vec<Hash>> {
        parents
            .iter()
            .map(|p| {
                store
                    .nodes
                    .get(p)
                    .map(|n| n.content_hash)
                    .ok_or(SdupiError::InvalidParent(*p))
            })
            .collect()
    }

    fn sample_tips<R: Rng + ?Sized>(&self, store: &DagStore, k: usize, rng: &mut R) -> Vec<NodeId> {
        let candidates: Vec<(NodeId, u64)> = store
            .tips
            .values()
            .filter_map(|id| store.nodes.get(id).map(|n| (n.id, n.proposer_stake)))
            .collect();
        weighted_sample(candidates, k, self.config.zero_stake_fallback_weight, rng)
    }

    fn validate_payload(&self, payload_refs: &[PayloadRef]) -> Result<()> {
        if payload_refs.len() > self.config.max_payload_refs {
            return Err(SdupiError::Validation(format!(
                "{} payload refs exceed limit of {}",
                payload_refs.len(),
                self.config.max_payload_refs
            )));
        }
        let mut seen = HashSet::with_capacity(payload_refs.len());
        for payload in payload_refs {
            if payload.is_empty() {
                return Err(SdupiError::Validation("empty payload ref".to_string()));
            }
            if payload.len() > MAX_PAYLOAD_REF_LEN {
                return Err(SdupiError::Validation(format!(
                    "payload ref of {} bytes exceeds {} bytes",
                    payload.len(),
                    MAX_PAYLOAD_REF_LEN
                )));
            }
            if !seen.insert(payload) {
                return Err(SdupiError::Validation(format!(
                    "duplicate payload ref {}",
                    hex::encode(payload.as_bytes())
                )));
            }
        }
        Ok(())
    }

    fn validate_parent_list(&self, parents: &[NodeId]) -> Result<()> {
        if parents.len() > self.config.max_parents {
            return Err(SdupiError::Validation(format!(
                "{} parents exceed limit of {}",
                parents.len(),
                self.config.max_parents
            )));
        }
        let unique: HashSet<&NodeId> = parents.iter().collect();
        if unique.len() != parents.len() {
            return Err(SdupiError::Validation("duplicate parent".to_string()));
        }
        Ok(())
    }

    fn publish_added(&self, node: &DagNode) {
        if let Some(tx) = self.event_tx.read().as_ref() {
            // No subscribers is not an error
            let _ = tx.send(LedgerEvent::NodeAdded {
                node_id: node.id.to_string(),
                proposer: node.proposer.to_string(),
                parents: node.parents.iter().map(|p| p.to_string()).collect(),
                payload_count: node.payload_refs.len(),
            });
        }
    }

    fn track(&self, result: Result<NodeId>) -> Result<NodeId> {
        if let Err(e) = &result {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Node rejected: {}", e);
        }
        result
    }
}

/// Weighted sampling without replacement.
///
/// Each draw picks a remaining candidate with probability proportional to its
/// weight. When every remaining weight is zero, each candidate counts as
/// `fallback_weight` instead. Asking for at least as many as there are
/// candidates returns them all.
pub fn weighted_sample<R: Rng + ?Sized>(
    mut candidates: Vec<(NodeId, u64)>,
    k: usize,
    fallback_weight: u64,
    rng: &mut R,
) -> Vec<NodeId> {
    if k >= candidates.len() {
        return candidates.into_iter().map(|(id, _)| id).collect();
    }

    let mut chosen = Vec::with_capacity(k);
    while chosen.len() < k {
        let mut total: u128 = candidates.iter().map(|(_, w)| u128::from(*w)).sum();
        let use_fallback = total == 0;
        if use_fallback {
            total = u128::from(fallback_weight.max(1)) * candidates.len() as u128;
        }

        let mut target = rng.gen_range(0..total);
        let mut picked = candidates.len() - 1;
        for (index, (_, weight)) in candidates.iter().enumerate() {
            let weight = if use_fallback {
                u128::from(fallback_weight.max(1))
            } else {
                u128::from(*weight)
            };
            if target < weight {
                picked = index;
                break;
            }
            target -= weight;
        }
        chosen.push(candidates.swap_remove(picked).0);
    }
    chosen
}
