//! Concurrency-control checks: MVTSO and the single-version TAPIR variant.
//!
//! Both flavors run inside the same per-key locking discipline: the union of
//! the transaction's read and write keys is locked in sorted order with
//! duplicates skipped, held for the duration of the check, and released in
//! reverse order. Suspension never happens while the locks are held.

use std::ops::Bound;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::RawMutex;

use super::state::ReplicaState;
use super::types::{CcResult, CommittedProof, Config, GroupId, Transaction, TxnDigest};

/// Result of a concurrency-control check plus its supporting evidence.
#[derive(Clone, Debug, Default)]
pub(super) struct CcOutcome {
    pub(super) result: Option<CcResult>,
    /// Committed proof justifying an ABORT.
    pub(super) conflict: Option<Arc<CommittedProof>>,
    /// Prepared transaction an ABSTAIN collided with, for diagnostics.
    pub(super) abstain_conflict: Option<TxnDigest>,
    /// Dependencies that must resolve before a WAIT can re-evaluate.
    pub(super) unresolved: Vec<TxnDigest>,
}

impl CcOutcome {
    fn terminal(result: CcResult) -> Self {
        Self {
            result: Some(result),
            ..Default::default()
        }
    }

    pub(super) fn result(&self) -> CcResult {
        self.result.unwrap_or(CcResult::Abstain)
    }
}

type KeyGuard = ArcMutexGuard<RawMutex, ()>;

/// Lock the union of the transaction's keys in sorted order, skipping
/// duplicates. Deadlock-free across parallel checks because every check
/// acquires in the same global order.
pub(super) fn lock_txn_keys(state: &ReplicaState, txn: &Transaction) -> Vec<KeyGuard> {
    let mut keys: Vec<&[u8]> = txn
        .read_set
        .iter()
        .map(|r| r.key.as_slice())
        .chain(txn.write_set.iter().map(|w| w.key.as_slice()))
        .collect();
    keys.sort_unstable();
    keys.dedup();
    keys.into_iter()
        .map(|key| state.key_lock(key).lock_arc())
        .collect()
}

pub(super) fn release_keys(mut guards: Vec<KeyGuard>) {
    // Reverse acquisition order.
    while guards.pop().is_some() {}
}

/// Run the configured concurrency-control check for `txn`.
///
/// On success the transaction is installed into the prepared indexes before
/// the key locks are released. Dependency bookkeeping for WAIT results is
/// the caller's job; `unresolved` lists the blocking digests.
pub(super) fn occ_check(
    state: &ReplicaState,
    config: &Config,
    group: GroupId,
    digest: TxnDigest,
    txn: &Arc<Transaction>,
    now_ms: u64,
) -> CcOutcome {
    let guards = lock_txn_keys(state, txn);

    let mut outcome = CcOutcome::default();
    if !state.prepared.contains_key(&digest) {
        let checked = match config.occ_type {
            super::types::OccType::Mvtso => {
                mvtso_rules(state, config, group, digest, txn, now_ms)
            }
            super::types::OccType::Tapir => tapir_rules(state, config, group, txn, now_ms),
        };
        if checked.result.is_some() {
            release_keys(guards);
            return checked;
        }
        outcome = checked;

        // Unverified dependencies: with proofs and signatures on but per-dep
        // verification off, only deps we committed, aborted, or prepared
        // ourselves are acceptable.
        if config.validate_proofs && config.sign_messages && !config.verify_deps {
            for dep in txn.deps.iter().filter(|d| d.involved_group == group) {
                if !state.is_decided(&dep.write_digest)
                    && !state.prepared.contains_key(&dep.write_digest)
                {
                    release_keys(guards);
                    return CcOutcome::terminal(CcResult::Abstain);
                }
            }
        }

        if config.max_dep_depth >= 0 {
            let depth = dependency_depth(state, txn, config.max_dep_depth as u64);
            if depth > config.max_dep_depth as u64 {
                release_keys(guards);
                return CcOutcome::terminal(CcResult::Abstain);
            }
        }

        state.insert_prepared(digest, txn);
    }

    // Dependency closure; runs for re-entry on an already-prepared digest
    // as well (fallback executions).
    if config.max_dep_depth > -2 {
        let unresolved: Vec<TxnDigest> = txn
            .deps
            .iter()
            .filter(|d| d.involved_group == group)
            .filter(|d| !state.is_decided(&d.write_digest))
            .map(|d| d.write_digest)
            .collect();
        if !unresolved.is_empty() {
            release_keys(guards);
            outcome.result = Some(CcResult::Wait);
            outcome.unresolved = unresolved;
            return outcome;
        }
    }

    release_keys(guards);
    outcome.result = Some(if config.max_dep_depth > -2 {
        check_dependencies(state, group, txn)
    } else {
        // Dependency tracking disabled: deps are not consulted at all.
        CcResult::Commit
    });
    outcome
}

/// Re-evaluate a transaction whose dependencies have all resolved: any dep
/// that aborted, or committed past this transaction's timestamp, forces an
/// ABSTAIN; otherwise COMMIT.
pub(super) fn check_dependencies(
    state: &ReplicaState,
    group: GroupId,
    txn: &Transaction,
) -> CcResult {
    for dep in txn.deps.iter().filter(|d| d.involved_group == group) {
        if state.committed.contains_key(&dep.write_digest) {
            if dep.prepared_timestamp > txn.timestamp {
                return CcResult::Abstain;
            }
        } else {
            // Aborted, or vanished without a decision we can see.
            return CcResult::Abstain;
        }
    }
    CcResult::Commit
}

/// Length of the dependency chain below `txn`, walked through `ongoing` and
/// capped at `cap + 1` so unbounded graphs stay cheap to reject.
pub(super) fn dependency_depth(state: &ReplicaState, txn: &Transaction, cap: u64) -> u64 {
    let mut frontier: Vec<TxnDigest> = txn
        .deps
        .iter()
        .filter(|d| !state.is_decided(&d.write_digest))
        .map(|d| d.write_digest)
        .collect();
    let mut depth = 0u64;
    while !frontier.is_empty() {
        depth += 1;
        if depth > cap {
            return depth;
        }
        let mut next = Vec::new();
        for digest in frontier {
            if let Some(entry) = state.ongoing.get(&digest) {
                let txn = entry.value().clone();
                drop(entry);
                next.extend(
                    txn.deps
                        .iter()
                        .filter(|d| !state.is_decided(&d.write_digest))
                        .map(|d| d.write_digest),
                );
            }
        }
        frontier = next;
    }
    depth
}

fn beyond_watermark(config: &Config, now_ms: u64, ts_ms: u64) -> bool {
    // Exactly at the watermark is accepted; one tick beyond is rejected.
    ts_ms > now_ms + config.time_delta_ms
}

pub(super) fn read_beyond_watermark(config: &Config, now_ms: u64, ts_ms: u64) -> bool {
    beyond_watermark(config, now_ms, ts_ms)
}

fn mvtso_rules(
    state: &ReplicaState,
    config: &Config,
    group: GroupId,
    digest: TxnDigest,
    txn: &Transaction,
    now_ms: u64,
) -> CcOutcome {
    let ts = txn.timestamp;

    if beyond_watermark(config, now_ms, ts.ms) {
        tracing::debug!(ts = ?ts, "abstain: timestamp beyond high watermark");
        return CcOutcome::terminal(CcResult::Abstain);
    }

    for read in &txn.read_set {
        if config.group_for_key(&read.key) != group {
            continue;
        }
        // Committed write landed between the read version and our timestamp:
        // unrecoverable wr conflict, abort with the committed proof.
        for (write_ts, value) in state.store.get_committed_after(&read.key, read.read_time) {
            if write_ts < ts {
                tracing::debug!(
                    read_ts = ?read.read_time,
                    committed_ts = ?write_ts,
                    txn_ts = ?ts,
                    "abort: committed write inside read window"
                );
                return CcOutcome {
                    result: Some(CcResult::Abort),
                    conflict: Some(value.proof),
                    ..Default::default()
                };
            }
        }

        // Prepared write in the same window: the writer may still abort, so
        // only abstain, and report it for fallback targeting.
        if let Some(by_key) = state.writes_of_key(&read.key) {
            let guard = by_key.read();
            if let Some((_, other)) = guard
                .range((Bound::Excluded(read.read_time), Bound::Excluded(ts)))
                .next()
            {
                let conflict_digest = other.digest(config.hash_digest);
                return CcOutcome {
                    result: Some(CcResult::Abstain),
                    abstain_conflict: Some(conflict_digest),
                    ..Default::default()
                };
            }
        }
    }

    for write in &txn.write_set {
        if config.group_for_key(&write.key) != group {
            continue;
        }

        // Committed reader ordered after us but with an older read version:
        // committing our write would invalidate its read. Abort with the
        // reader's commit proof. Scan descends from the largest committing
        // timestamp; once ts >= the committing ts, all remaining are older.
        let mut abort_proof: Option<Arc<CommittedProof>> = None;
        state
            .store
            .scan_committed_reads_desc(&write.key, |txn_ts, read_version, proof| {
                if ts >= txn_ts {
                    return true;
                }
                if read_version < ts {
                    abort_proof = Some(proof.clone());
                    return true;
                }
                false
            });
        if let Some(proof) = abort_proof {
            return CcOutcome {
                result: Some(CcResult::Abort),
                conflict: Some(proof),
                ..Default::default()
            };
        }

        // Prepared readers that read below our timestamp and sit above it.
        // A reader that declared us as a dependency saw this very write, so
        // it is not a conflict.
        if let Some(by_key) = state.reads_of_key(&write.key) {
            let guard = by_key.read();
            for (_, reader) in guard.iter() {
                let reader_depends_on_us = reader.depends_on(&digest);
                let Some(read_version) = reader.has_key_in_read_set(&write.key) else {
                    continue;
                };
                if !reader_depends_on_us && read_version < ts && ts < reader.timestamp {
                    return CcOutcome::terminal(CcResult::Abstain);
                }
            }
        }

        // Advisory read-timestamp high-water mark; strictly greater rejects.
        if state.store.rts(&write.key) > ts.ms {
            return CcOutcome::terminal(CcResult::Abstain);
        }
    }

    CcOutcome::default()
}

fn tapir_rules(
    state: &ReplicaState,
    config: &Config,
    group: GroupId,
    txn: &Transaction,
    now_ms: u64,
) -> CcOutcome {
    let ts = txn.timestamp;

    if beyond_watermark(config, now_ms, ts.ms) {
        return CcOutcome::terminal(CcResult::Abstain);
    }

    for read in &txn.read_set {
        if config.group_for_key(&read.key) != group {
            continue;
        }
        // Single-version range validity: the version we read must still be
        // current at our timestamp.
        if let Some((_, Some(next))) = state.store.get_range(&read.key, read.read_time) {
            if next < ts {
                let conflict = state
                    .store
                    .get(&read.key, next)
                    .map(|(_, v)| v.proof);
                return CcOutcome {
                    result: Some(CcResult::Abort),
                    conflict,
                    ..Default::default()
                };
            }
        }
        if let Some(by_key) = state.writes_of_key(&read.key) {
            let guard = by_key.read();
            if let Some((_, other)) = guard
                .range((Bound::Excluded(read.read_time), Bound::Excluded(ts)))
                .next()
            {
                let conflict_digest = other.digest(config.hash_digest);
                return CcOutcome {
                    result: Some(CcResult::Abstain),
                    abstain_conflict: Some(conflict_digest),
                    ..Default::default()
                };
            }
        }
    }

    for write in &txn.write_set {
        if config.group_for_key(&write.key) != group {
            continue;
        }
        if state.store.rts(&write.key) > ts.ms {
            return CcOutcome::terminal(CcResult::Abstain);
        }
        if let Some(by_key) = state.reads_of_key(&write.key) {
            let guard = by_key.read();
            for (_, reader) in guard.iter() {
                let Some(read_version) = reader.has_key_in_read_set(&write.key) else {
                    continue;
                };
                if read_version < ts && ts < reader.timestamp {
                    return CcOutcome::terminal(CcResult::Abstain);
                }
            }
        }
    }

    CcOutcome::default()
}
