//! Multi-version key/value storage with committed proofs.
//!
//! Every committed write installs a version keyed by its commit timestamp
//! together with the proof that justified the commit, so any reader can
//! re-check the decision without consulting live replicas. The store also
//! tracks committed reads per key (for rw-conflict detection at prepare
//! time) and the advisory read-timestamp high-water mark.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use super::types::{CommittedProof, Key, Timestamp, Value};

/// One committed version of a key.
#[derive(Clone, Debug)]
pub struct VersionedValue {
    pub value: Value,
    pub proof: Arc<CommittedProof>,
}

/// Record of a committed read: the reading transaction's timestamp, the
/// version it observed, and the proof of its commit.
type CommittedReadMap = BTreeMap<(Timestamp, Timestamp), Arc<CommittedProof>>;

/// Versioned key→value map with short per-key critical sections.
///
/// Readers at a chosen timestamp observe a consistent snapshot; concurrent
/// readers and writers only contend on the key they touch.
pub struct MultiVersionStore {
    versions: DashMap<Key, Arc<RwLock<BTreeMap<Timestamp, VersionedValue>>>>,
    committed_reads: DashMap<Key, Arc<RwLock<CommittedReadMap>>>,
    rts: DashMap<Key, u64>,
}

impl Default for MultiVersionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiVersionStore {
    pub fn new() -> Self {
        Self {
            versions: DashMap::new(),
            committed_reads: DashMap::new(),
            rts: DashMap::new(),
        }
    }

    fn key_versions(&self, key: &[u8]) -> Option<Arc<RwLock<BTreeMap<Timestamp, VersionedValue>>>> {
        self.versions.get(key).map(|entry| entry.value().clone())
    }

    /// Largest committed version with timestamp <= `as_of`.
    pub fn get(&self, key: &[u8], as_of: Timestamp) -> Option<(Timestamp, VersionedValue)> {
        let versions = self.key_versions(key)?;
        let guard = versions.read();
        guard
            .range(..=as_of)
            .next_back()
            .map(|(ts, v)| (*ts, v.clone()))
    }

    /// Validity range of the version visible at `as_of`: the version itself
    /// and the next committed version above it, if any. Used by the
    /// single-version OCC variant for range checks.
    pub fn get_range(&self, key: &[u8], as_of: Timestamp) -> Option<(Timestamp, Option<Timestamp>)> {
        let versions = self.key_versions(key)?;
        let guard = versions.read();
        let (current, _) = guard.range(..=as_of).next_back()?;
        let next = guard
            .range((Bound::Excluded(*current), Bound::Unbounded))
            .next()
            .map(|(ts, _)| *ts);
        Some((*current, next))
    }

    /// Install a committed version. A duplicate timestamp indicates replica
    /// corruption upstream and is dropped with a warning.
    pub fn put(&self, key: &[u8], value: Value, proof: Arc<CommittedProof>, ts: Timestamp) {
        let versions = self
            .versions
            .entry(key.to_vec())
            .or_insert_with(|| Arc::new(RwLock::new(BTreeMap::new())))
            .value()
            .clone();
        let mut guard = versions.write();
        if guard.contains_key(&ts) {
            tracing::warn!(ts = ?ts, "duplicate version install dropped");
            return;
        }
        guard.insert(ts, VersionedValue { value, proof });
    }

    /// All committed versions strictly greater than `after`.
    pub fn get_committed_after(
        &self,
        key: &[u8],
        after: Timestamp,
    ) -> Vec<(Timestamp, VersionedValue)> {
        let Some(versions) = self.key_versions(key) else {
            return Vec::new();
        };
        let guard = versions.read();
        guard
            .range((Bound::Excluded(after), Bound::Unbounded))
            .map(|(ts, v)| (*ts, v.clone()))
            .collect()
    }

    /// Record that a committed transaction at `txn_ts` read `read_version`
    /// of `key`, with its commit proof.
    pub fn record_committed_read(
        &self,
        key: &[u8],
        txn_ts: Timestamp,
        read_version: Timestamp,
        proof: Arc<CommittedProof>,
    ) {
        let reads = self
            .committed_reads
            .entry(key.to_vec())
            .or_insert_with(|| Arc::new(RwLock::new(BTreeMap::new())))
            .value()
            .clone();
        reads.write().insert((txn_ts, read_version), proof);
    }

    /// Scan committed reads of `key` from the largest committing timestamp
    /// down, stopping once `stop` returns true. The visitor receives
    /// (committing ts, read version, proof).
    pub fn scan_committed_reads_desc(
        &self,
        key: &[u8],
        mut visit: impl FnMut(Timestamp, Timestamp, &Arc<CommittedProof>) -> bool,
    ) {
        let Some(reads) = self.committed_reads.get(key).map(|e| e.value().clone()) else {
            return;
        };
        let guard = reads.read();
        for ((txn_ts, read_version), proof) in guard.iter().rev() {
            if visit(*txn_ts, *read_version, proof) {
                break;
            }
        }
    }

    /// Advisory read-timestamp high-water mark for `key`.
    pub fn rts(&self, key: &[u8]) -> u64 {
        self.rts.get(key).map(|e| *e.value()).unwrap_or(0)
    }

    /// Advance the RTS to `ts_ms` if larger.
    pub fn advance_rts(&self, key: &[u8], ts_ms: u64) {
        let mut entry = self.rts.entry(key.to_vec()).or_insert(0);
        if ts_ms > *entry.value() {
            *entry.value_mut() = ts_ms;
        }
    }

    /// Drop the RTS entry if it still carries this exact timestamp. Used by
    /// the authenticated client stale-read cleanup; advisory only.
    pub fn clear_rts_if(&self, key: &[u8], ts_ms: u64) {
        self.rts.remove_if(key, |_, current| *current == ts_ms);
    }
}
