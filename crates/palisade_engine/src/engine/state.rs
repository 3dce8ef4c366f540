//! Shared in-memory state for a single replica.
//!
//! Digest-keyed concurrent maps hold every lifecycle stage; transaction
//! records are owned by `ongoing` and every other map refers to them by
//! digest, so removing from `ongoing` is the single authoritative forget.
//! P1/P2 metadata is retained after Clean so late stragglers and fallback
//! queries can still be answered.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use palisade_crypto::{ProcessId, SignedMessage};
use parking_lot::{Mutex, RwLock};

use super::messages::WritebackMsg;
use super::store::MultiVersionStore;
use super::types::{CcResult, CommittedProof, Decision, Key, Timestamp, Transaction, TxnDigest};

/// Phase2 metadata per digest. `decision_view` only moves forward, and the
/// decision may only change when it strictly increases.
#[derive(Clone, Debug)]
pub(super) struct P2Meta {
    pub(super) decision: Decision,
    pub(super) decision_view: u64,
    pub(super) has_p2: bool,
    /// Original client (req id, address) for late delivery of p2 results.
    pub(super) original_client: Option<(u64, ProcessId)>,
}

/// A transaction blocked on unresolved dependencies, plus who to notify
/// when it resolves.
#[derive(Clone, Debug, Default)]
pub(super) struct WaitingDependency {
    pub(super) req_id: u64,
    pub(super) client: Option<ProcessId>,
    pub(super) original_client: bool,
    pub(super) deps: HashSet<TxnDigest>,
}

/// ElectFB votes collected by the leader of one view.
#[derive(Debug, Default)]
pub(super) struct ElectState {
    pub(super) view: u64,
    pub(super) voted: HashSet<ProcessId>,
    pub(super) commit_sigs: Vec<SignedMessage>,
    pub(super) abort_sigs: Vec<SignedMessage>,
    /// Views this leader already emitted a DecisionFB for (single shot).
    pub(super) emitted_views: HashSet<u64>,
}

/// MoveView amplification counters per proposed view.
#[derive(Debug, Default)]
pub(super) struct MoveViewState {
    pub(super) proposers: HashSet<ProcessId>,
    pub(super) broadcast: bool,
}

/// RelayP1 scheduled for a stalled dependency.
#[derive(Clone, Debug)]
pub(super) struct PendingRelay {
    pub(super) dep_digest: TxnDigest,
    pub(super) dependent_req_id: u64,
    pub(super) client: ProcessId,
    pub(super) due_ms: u64,
}

pub(super) type PreparedReadsByKey = Arc<RwLock<HashMap<TxnDigest, Arc<Transaction>>>>;
pub(super) type PreparedWritesByKey = Arc<RwLock<BTreeMap<Timestamp, Arc<Transaction>>>>;

/// All digest- and key-indexed replica state.
pub(super) struct ReplicaState {
    pub(super) store: MultiVersionStore,
    /// Transactions with a Phase1 seen and no final decision.
    pub(super) ongoing: DashMap<TxnDigest, Arc<Transaction>>,
    /// Prepared transactions: timestamp plus the record.
    pub(super) prepared: DashMap<TxnDigest, (Timestamp, Arc<Transaction>)>,
    pub(super) prepared_reads: DashMap<Key, PreparedReadsByKey>,
    pub(super) prepared_writes: DashMap<Key, PreparedWritesByKey>,
    pub(super) committed: DashMap<TxnDigest, Arc<CommittedProof>>,
    pub(super) aborted: DashSet<TxnDigest>,
    /// Abort writebacks retained for ForwardWriteback.
    pub(super) writeback_log: DashMap<TxnDigest, WritebackMsg>,
    pub(super) p1_decisions: DashMap<TxnDigest, CcResult>,
    pub(super) p1_conflicts: DashMap<TxnDigest, Arc<CommittedProof>>,
    pub(super) p1_abstain_conflicts: DashMap<TxnDigest, TxnDigest>,
    pub(super) p2_meta: DashMap<TxnDigest, P2Meta>,
    pub(super) current_views: DashMap<TxnDigest, u64>,
    /// dependents[d] = digests waiting for d.
    pub(super) dependents: DashMap<TxnDigest, HashSet<TxnDigest>>,
    pub(super) waiting: DashMap<TxnDigest, WaitingDependency>,
    pub(super) interested_clients: DashMap<TxnDigest, HashSet<ProcessId>>,
    pub(super) elect: DashMap<TxnDigest, ElectState>,
    pub(super) move_views: DashMap<(TxnDigest, u64), MoveViewState>,
    /// Per-key lock table for the concurrency-control critical section.
    pub(super) key_locks: DashMap<Key, Arc<Mutex<()>>>,
    pub(super) relays: Mutex<Vec<PendingRelay>>,
}

impl ReplicaState {
    pub(super) fn new() -> Self {
        Self {
            store: MultiVersionStore::new(),
            ongoing: DashMap::new(),
            prepared: DashMap::new(),
            prepared_reads: DashMap::new(),
            prepared_writes: DashMap::new(),
            committed: DashMap::new(),
            aborted: DashSet::new(),
            writeback_log: DashMap::new(),
            p1_decisions: DashMap::new(),
            p1_conflicts: DashMap::new(),
            p1_abstain_conflicts: DashMap::new(),
            p2_meta: DashMap::new(),
            current_views: DashMap::new(),
            dependents: DashMap::new(),
            waiting: DashMap::new(),
            interested_clients: DashMap::new(),
            elect: DashMap::new(),
            move_views: DashMap::new(),
            key_locks: DashMap::new(),
            relays: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn is_decided(&self, digest: &TxnDigest) -> bool {
        self.committed.contains_key(digest) || self.aborted.contains(digest)
    }

    pub(super) fn current_view(&self, digest: &TxnDigest) -> u64 {
        self.current_views.get(digest).map(|v| *v).unwrap_or(0)
    }

    pub(super) fn reads_of_key(&self, key: &[u8]) -> Option<PreparedReadsByKey> {
        self.prepared_reads.get(key).map(|e| e.value().clone())
    }

    pub(super) fn writes_of_key(&self, key: &[u8]) -> Option<PreparedWritesByKey> {
        self.prepared_writes.get(key).map(|e| e.value().clone())
    }

    /// Install a transaction into the prepared indexes. Caller holds the
    /// per-key locks for the transaction's key set.
    pub(super) fn insert_prepared(&self, digest: TxnDigest, txn: &Arc<Transaction>) {
        self.prepared
            .insert(digest, (txn.timestamp, txn.clone()));
        for read in &txn.read_set {
            let by_key = self
                .prepared_reads
                .entry(read.key.clone())
                .or_insert_with(|| Arc::new(RwLock::new(HashMap::new())))
                .value()
                .clone();
            by_key.write().insert(digest, txn.clone());
        }
        for write in &txn.write_set {
            let by_key = self
                .prepared_writes
                .entry(write.key.clone())
                .or_insert_with(|| Arc::new(RwLock::new(BTreeMap::new())))
                .value()
                .clone();
            by_key.write().insert(txn.timestamp, txn.clone());
        }
    }

    /// Remove a transaction from the prepared indexes under the same per-key
    /// locks Prepare used.
    pub(super) fn remove_prepared(&self, digest: &TxnDigest) {
        let Some((_, (ts, txn))) = self.prepared.remove(digest) else {
            return;
        };
        for read in &txn.read_set {
            if let Some(by_key) = self.reads_of_key(&read.key) {
                by_key.write().remove(digest);
            }
        }
        for write in &txn.write_set {
            if let Some(by_key) = self.writes_of_key(&write.key) {
                by_key.write().remove(&ts);
            }
        }
    }

    pub(super) fn key_lock(&self, key: &[u8]) -> Arc<Mutex<()>> {
        self.key_locks
            .entry(key.to_vec())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }
}
