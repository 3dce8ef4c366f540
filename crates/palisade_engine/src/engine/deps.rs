//! Dependency tracker: orders transactions whose Phase1 returned WAIT.
//!
//! `dependents[d]` holds the digests blocked on `d`; `waiting[t]` holds the
//! blocked transaction's unresolved set plus the caller to notify. The graph
//! is only walked on state changes (a dependency committing or aborting),
//! and entries unlink themselves so the two maps stay mirror images.

use palisade_crypto::ProcessId;

use super::mvtso::check_dependencies;
use super::state::{ReplicaState, WaitingDependency};
use super::types::{CcResult, Config, GroupId, TxnDigest};

/// Caller registered for notification when a WAIT resolves.
#[derive(Clone, Copy, Debug)]
pub(super) struct Waiter {
    pub(super) req_id: u64,
    pub(super) client: Option<ProcessId>,
    /// Original client vs. an interested fallback driver.
    pub(super) original_client: bool,
}

/// A transaction whose dependencies have all resolved, with its buffered
/// result and the caller to notify.
#[derive(Debug)]
pub(super) struct Woken {
    pub(super) digest: TxnDigest,
    pub(super) result: CcResult,
    pub(super) waiter: WaitingDependency,
}

/// Register `digest` as waiting on `unresolved`.
///
/// The caller must follow up with [`resolve_if_ready`]: a dependency may
/// have resolved between the concurrency-control check and registration,
/// and nothing else will re-walk this entry.
pub(super) fn wait(
    state: &ReplicaState,
    digest: TxnDigest,
    unresolved: &[TxnDigest],
    waiter: Waiter,
) {
    for dep in unresolved {
        state.dependents.entry(*dep).or_default().insert(digest);
    }
    {
        let mut entry = state.waiting.entry(digest).or_default();
        if waiter.original_client {
            entry.original_client = true;
            entry.req_id = waiter.req_id;
            entry.client = waiter.client;
        }
        entry.deps.extend(unresolved.iter().copied());
    }
    // Close the race window: anything that resolved while we registered is
    // dropped here rather than waiting for a wake that already happened.
    for dep in unresolved {
        if state.is_decided(dep) {
            if let Some(mut entry) = state.waiting.get_mut(&digest) {
                entry.deps.remove(dep);
            }
        }
    }
}

/// If every dependency of `digest` has resolved, retire the waiting entry
/// and return the re-evaluated result.
pub(super) fn resolve_if_ready(
    state: &ReplicaState,
    config: &Config,
    group: GroupId,
    digest: TxnDigest,
) -> Option<Woken> {
    let ready = state
        .waiting
        .get(&digest)
        .map(|entry| entry.deps.is_empty())
        .unwrap_or(false);
    if !ready {
        return None;
    }
    let (_, waiter) = state.waiting.remove(&digest)?;
    Some(Woken {
        digest,
        result: resolve_result(state, config, group, &digest),
        waiter,
    })
}

/// Wake every dependent of `resolved`; returns the transactions whose last
/// dependency this was, with their final Phase1 results.
pub(super) fn on_resolved(
    state: &ReplicaState,
    config: &Config,
    group: GroupId,
    resolved: &TxnDigest,
) -> Vec<Woken> {
    let Some((_, dependents)) = state.dependents.remove(resolved) else {
        return Vec::new();
    };

    let mut woken = Vec::new();
    for dependent in dependents {
        let now_empty = match state.waiting.get_mut(&dependent) {
            Some(mut entry) => {
                entry.deps.remove(resolved);
                entry.deps.is_empty()
            }
            None => false,
        };
        if !now_empty {
            continue;
        }
        let Some((_, waiter)) = state.waiting.remove(&dependent) else {
            continue;
        };
        tracing::debug!(dependent = ?dependent, "all dependencies resolved");
        woken.push(Woken {
            digest: dependent,
            result: resolve_result(state, config, group, &dependent),
            waiter,
        });
    }
    woken
}

fn resolve_result(
    state: &ReplicaState,
    config: &Config,
    group: GroupId,
    digest: &TxnDigest,
) -> CcResult {
    if let Some(entry) = state.ongoing.get(digest) {
        let txn = entry.value().clone();
        drop(entry);
        return check_dependencies(state, group, &txn);
    }
    // Decided concurrently with the wake.
    if state.committed.contains_key(digest) {
        CcResult::Commit
    } else if state.aborted.contains(digest) {
        CcResult::Abstain
    } else {
        tracing::warn!(digest = ?digest, "woken transaction has no record");
        CcResult::Abstain
    }
}

/// Drop the waiting entry of `digest` and unlink it from its dependencies'
/// dependent sets. Called from Clean.
pub(super) fn clean_dependencies(state: &ReplicaState, digest: &TxnDigest) {
    let Some((_, entry)) = state.waiting.remove(digest) else {
        return;
    };
    for dep in entry.deps {
        let emptied = state
            .dependents
            .get_mut(&dep)
            .map(|mut set| {
                set.remove(digest);
                set.is_empty()
            })
            .unwrap_or(false);
        if emptied {
            state.dependents.remove_if(&dep, |_, set| set.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::types::{
        CommittedProof, Dependency, ProofSigs, Timestamp, Transaction, WriteSetEntry,
    };

    fn txn_with_dep(dep: TxnDigest, dep_ts: Timestamp, own_ts: Timestamp) -> Arc<Transaction> {
        Arc::new(Transaction {
            client_id: own_ts.id,
            client_seq_num: 1,
            timestamp: own_ts,
            read_set: Vec::new(),
            write_set: vec![WriteSetEntry {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            }],
            involved_groups: vec![0],
            deps: vec![Dependency {
                write_digest: dep,
                prepared_timestamp: dep_ts,
                involved_group: 0,
                write_sigs: Vec::new(),
            }],
        })
    }

    #[test]
    fn commit_of_dependency_wakes_dependent() {
        let state = ReplicaState::new();
        let config = Config::default();
        let dep = TxnDigest([1u8; 32]);
        let txn = txn_with_dep(dep, Timestamp::new(5, 0), Timestamp::new(10, 1));
        let digest = txn.digest(true);
        state.ongoing.insert(digest, txn.clone());

        wait(
            &state,
            digest,
            &[dep],
            Waiter {
                req_id: 7,
                client: Some(100),
                original_client: true,
            },
        );
        assert!(state.waiting.contains_key(&digest));

        // Dep commits at its prepared timestamp, below ours: COMMIT.
        state.committed.insert(
            dep,
            Arc::new(CommittedProof {
                txn: (*txn).clone(),
                sigs: ProofSigs::Genesis,
            }),
        );
        let woken = on_resolved(&state, &config, 0, &dep);
        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0].digest, digest);
        assert_eq!(woken[0].result, CcResult::Commit);
        assert_eq!(woken[0].waiter.req_id, 7);
        assert!(!state.waiting.contains_key(&digest));
        assert!(!state.dependents.contains_key(&dep));
    }

    #[test]
    fn abort_of_dependency_resolves_to_abstain() {
        let state = ReplicaState::new();
        let config = Config::default();
        let dep = TxnDigest([2u8; 32]);
        let txn = txn_with_dep(dep, Timestamp::new(5, 0), Timestamp::new(10, 1));
        let digest = txn.digest(true);
        state.ongoing.insert(digest, txn);

        wait(
            &state,
            digest,
            &[dep],
            Waiter {
                req_id: 1,
                client: None,
                original_client: false,
            },
        );
        state.aborted.insert(dep);
        let woken = on_resolved(&state, &config, 0, &dep);
        assert_eq!(woken.len(), 1);
        assert_eq!(woken[0].result, CcResult::Abstain);
    }

    #[test]
    fn registration_race_with_resolution_is_closed() {
        let state = ReplicaState::new();
        let config = Config::default();
        let dep = TxnDigest([3u8; 32]);
        let txn = txn_with_dep(dep, Timestamp::new(5, 0), Timestamp::new(10, 1));
        let digest = txn.digest(true);
        state.ongoing.insert(digest, txn.clone());

        // Dep decided before wait() registered it.
        state.committed.insert(
            dep,
            Arc::new(CommittedProof {
                txn: (*txn).clone(),
                sigs: ProofSigs::Genesis,
            }),
        );
        wait(
            &state,
            digest,
            &[dep],
            Waiter {
                req_id: 1,
                client: None,
                original_client: true,
            },
        );
        let woken = resolve_if_ready(&state, &config, 0, digest).expect("must resolve");
        assert_eq!(woken.result, CcResult::Commit);
    }

    #[test]
    fn clean_unlinks_both_directions() {
        let state = ReplicaState::new();
        let dep = TxnDigest([4u8; 32]);
        let txn = txn_with_dep(dep, Timestamp::new(5, 0), Timestamp::new(10, 1));
        let digest = txn.digest(true);
        state.ongoing.insert(digest, txn);
        wait(
            &state,
            digest,
            &[dep],
            Waiter {
                req_id: 1,
                client: None,
                original_client: false,
            },
        );
        clean_dependencies(&state, &digest);
        assert!(!state.waiting.contains_key(&digest));
        assert!(!state.dependents.contains_key(&dep));
    }
}
