//! Quorum and proof validation.
//!
//! Every proof that crosses a trust boundary lands here: Phase1 slow proofs
//! inside Phase2, Phase2 quorums inside Writeback, committed conflicts,
//! dependency proofs, fallback view certificates, and ElectFB quorums.
//! Malformed or insufficient evidence validates to false; senders are never
//! penalized because the no-replay property lets byzantine input be ignored.

use std::collections::HashSet;

use palisade_crypto::{ProcessId, SignedMessage, Verifier};

use super::messages::{decode_payload, CcVote, CurrentView, ElectMessage, Phase2Decision, WriteRecord};
use super::types::{
    CcResult, CommittedProof, Config, Decision, Dependency, GroupId, GroupedSigs, ProofSigs,
    Timestamp, Transaction, TxnDigest,
};

pub(super) fn replica_group_of(config: &Config, process_id: ProcessId) -> Option<GroupId> {
    let n = config.n();
    let group = process_id / n;
    (group < config.num_groups).then_some(group)
}

fn sig_ok(config: &Config, verifier: &Verifier, sig: &SignedMessage) -> bool {
    !config.sign_messages || verifier.verify(sig)
}

/// Count distinct in-group signers whose payload satisfies `accept`.
fn count_matching<T: for<'de> serde::Deserialize<'de>>(
    config: &Config,
    verifier: &Verifier,
    group: GroupId,
    sigs: &[SignedMessage],
    mut accept: impl FnMut(&T) -> bool,
) -> usize {
    let mut seen: HashSet<ProcessId> = HashSet::new();
    for sig in sigs {
        if replica_group_of(config, sig.process_id) != Some(group) {
            continue;
        }
        if seen.contains(&sig.process_id) {
            continue;
        }
        let Some(payload) = decode_payload::<T>(&sig.data) else {
            continue;
        };
        if !accept(&payload) {
            continue;
        }
        if !sig_ok(config, verifier, sig) {
            continue;
        }
        seen.insert(sig.process_id);
    }
    seen.len()
}

/// Validate a Phase1 slow proof for `decision` on `digest`.
///
/// COMMIT requires f+1 matching COMMIT votes from every involved group;
/// ABORT requires f+1 ABSTAIN/ABORT votes from any single group.
pub(super) fn validate_p1_quorum(
    config: &Config,
    verifier: &Verifier,
    decision: Decision,
    txn: &Transaction,
    digest: &TxnDigest,
    grouped_sigs: &GroupedSigs,
) -> bool {
    let quorum = config.fast_quorum();
    match decision {
        Decision::Commit => txn.involved_groups.iter().all(|group| {
            let Some(sigs) = grouped_sigs.get(group) else {
                return false;
            };
            count_matching::<CcVote>(config, verifier, *group, sigs, |vote| {
                vote.result == CcResult::Commit
                    && vote.txn_digest == *digest
                    && vote.involved_group == *group
            }) >= quorum
        }),
        Decision::Abort => grouped_sigs.iter().any(|(group, sigs)| {
            txn.involved_groups.contains(group)
                && count_matching::<CcVote>(config, verifier, *group, sigs, |vote| {
                    matches!(vote.result, CcResult::Abstain | CcResult::Abort)
                        && vote.txn_digest == *digest
                        && vote.involved_group == *group
                }) >= quorum
        }),
    }
}

/// Validate a Phase2 decision quorum: 3f+1 matching votes from the log
/// group, all in `view`.
pub(super) fn validate_p2_quorum(
    config: &Config,
    verifier: &Verifier,
    decision: Decision,
    view: u64,
    digest: &TxnDigest,
    log_group: GroupId,
    grouped_sigs: &GroupedSigs,
) -> bool {
    let Some(sigs) = grouped_sigs.get(&log_group) else {
        return false;
    };
    count_matching::<Phase2Decision>(config, verifier, log_group, sigs, |p2| {
        p2.txn_digest == *digest
            && p2.decision == decision
            && p2.view == view
            && p2.involved_group == log_group
    }) >= config.p2_quorum()
}

/// Validate a committed proof end to end.
pub(super) fn validate_committed_proof(
    config: &Config,
    verifier: &Verifier,
    proof: &CommittedProof,
) -> bool {
    let digest = proof.txn.digest(config.hash_digest);
    match &proof.sigs {
        ProofSigs::Genesis => proof.txn.timestamp == Timestamp::zero(),
        ProofSigs::Phase1(sigs) => {
            validate_p1_quorum(config, verifier, Decision::Commit, &proof.txn, &digest, sigs)
        }
        ProofSigs::Phase2 { sigs, view } => {
            let log_group = config.log_group(&digest, &proof.txn);
            validate_p2_quorum(
                config,
                verifier,
                Decision::Commit,
                *view,
                &digest,
                log_group,
                sigs,
            )
        }
    }
}

/// Validate that `conflict` both committed and actually conflicts with
/// `aborted_txn`, justifying a fast abort.
pub(super) fn validate_conflict(
    config: &Config,
    verifier: &Verifier,
    aborted_txn: &Transaction,
    conflict: &CommittedProof,
) -> bool {
    if !validate_committed_proof(config, verifier, conflict) {
        return false;
    }
    let conflict_ts = conflict.txn.timestamp;
    let aborted_ts = aborted_txn.timestamp;

    // wr: the committed write landed inside one of our read windows.
    let wr = aborted_txn.read_set.iter().any(|read| {
        conflict.txn.write_set.iter().any(|write| {
            write.key == read.key && read.read_time < conflict_ts && conflict_ts < aborted_ts
        })
    });
    // rw: our write would invalidate a read of the committed transaction.
    let rw = aborted_txn.write_set.iter().any(|write| {
        conflict.txn.read_set.iter().any(|read| {
            read.key == write.key && read.read_time < aborted_ts && aborted_ts < conflict_ts
        })
    });
    wr || rw
}

/// Validate a dependency's prepared-write proof: f+1 distinct replicas of
/// the dep's group signed read replies exposing that prepared write.
pub(super) fn validate_dependency(
    config: &Config,
    verifier: &Verifier,
    dep: &Dependency,
) -> bool {
    count_matching::<WriteRecord>(config, verifier, dep.involved_group, &dep.write_sigs, |w| {
        w.prepared_txn_digest == Some(dep.write_digest)
            && w.prepared_timestamp == Some(dep.prepared_timestamp)
    }) >= config.fast_quorum()
}

/// Validate InvokeFB view certificates: 3f+1 replicas at view >=
/// `proposed - 1`, or f+1 at view >= `proposed` in catch-up mode.
pub(super) fn validate_view_certs(
    config: &Config,
    verifier: &Verifier,
    digest: &TxnDigest,
    proposed_view: u64,
    catchup: bool,
    log_group: GroupId,
    certs: &[SignedMessage],
) -> bool {
    let (required, min_view) = if catchup {
        (config.catchup_cert_quorum(), proposed_view)
    } else {
        (config.view_cert_quorum(), proposed_view.saturating_sub(1))
    };
    count_matching::<CurrentView>(config, verifier, log_group, certs, |view| {
        view.txn_digest == *digest && view.current_view >= min_view
    }) >= required
}

/// Validate a DecisionFB's ElectFB quorum: 2f+1 distinct replicas bound to
/// exactly (digest, view, decision).
pub(super) fn validate_elect_quorum(
    config: &Config,
    verifier: &Verifier,
    digest: &TxnDigest,
    view: u64,
    decision: Decision,
    log_group: GroupId,
    sigs: &[SignedMessage],
) -> bool {
    count_matching::<ElectMessage>(config, verifier, log_group, sigs, |elect| {
        elect.txn_digest == *digest && elect.view == view && elect.decision == decision
    }) >= config.elect_quorum()
}

/// Validate f+1 matching stored-P2 replies offered as decision evidence.
pub(super) fn validate_p2_evidence(
    config: &Config,
    verifier: &Verifier,
    digest: &TxnDigest,
    decision: Decision,
    log_group: GroupId,
    sigs: &[SignedMessage],
) -> bool {
    count_matching::<Phase2Decision>(config, verifier, log_group, sigs, |p2| {
        p2.txn_digest == *digest && p2.decision == decision && p2.involved_group == log_group
    }) >= config.p2_evidence_quorum()
}
