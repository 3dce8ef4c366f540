//! Write/read conflict behavior between two clients on one key.
//!
//! Covered:
//! - Reads issued after a commit observe it, and a later write at a higher
//!   timestamp commits cleanly.
//! - A prepare whose read version predates an already-committed write
//!   aborts fast, carrying that write's commit proof as the conflict.

mod common;

use std::collections::HashMap;

use common::{finished_outcomes, Cluster, BASE_MS};
use palisade_client::TxnOutcome;
use palisade_engine::engine::{Config, Timestamp};

fn signed_config() -> Config {
    Config {
        f: 1,
        num_groups: 1,
        sign_messages: true,
        validate_proofs: true,
        verify_deps: true,
        ..Config::default()
    }
}

#[test]
fn read_after_commit_then_write_above() {
    let cluster = Cluster::new(signed_config());
    let (a_id, mut a) = cluster.client();
    let (b_id, mut b) = cluster.client();

    // A writes k=1 at ts 10 and commits.
    a.begin(Timestamp::new(BASE_MS + 10, a_id));
    a.write(b"k".to_vec(), b"1".to_vec()).unwrap();
    let a_digest = a.commit().unwrap();
    let mut clients = HashMap::from([(a_id, &mut a)]);
    let events = cluster.pump(&mut clients);
    assert!(finished_outcomes(&events)
        .iter()
        .any(|(_, d, o)| *d == a_digest && *o == TxnOutcome::Committed));
    drop(clients);

    // B reads k at ts 20 (sees 1), writes k=2 at ts 30: no conflict.
    b.begin(Timestamp::new(BASE_MS + 30, b_id));
    let _ = b.read(b"k".to_vec()).unwrap();
    let mut clients = HashMap::from([(b_id, &mut b)]);
    cluster.pump(&mut clients);
    drop(clients);
    b.write(b"k".to_vec(), b"2".to_vec()).unwrap();
    let b_digest = b.commit().unwrap();
    let mut clients = HashMap::from([(b_id, &mut b)]);
    let events = cluster.pump(&mut clients);
    assert!(finished_outcomes(&events)
        .iter()
        .any(|(_, d, o)| *d == b_digest && *o == TxnOutcome::Committed));

    let replica = cluster.replica(0, 0);
    let (_, v) = replica
        .store()
        .get(b"k", Timestamp::new(BASE_MS + 30, b_id))
        .expect("version");
    assert_eq!(v.value, b"2".to_vec());
    // At ts 10 the old version is still visible.
    let (_, v) = replica
        .store()
        .get(b"k", Timestamp::new(BASE_MS + 10, a_id))
        .expect("version");
    assert_eq!(v.value, b"1".to_vec());
}

#[test]
fn stale_read_prepare_aborts_with_commit_proof() {
    use palisade_engine::engine::{
        Address, CcResult, Message, Phase1Msg, ReadSetEntry, Transaction, WriteSetEntry,
        WritebackMsg,
    };

    let cluster = Cluster::new(signed_config());
    let (a_id, mut a) = cluster.client();

    // A commits k=1 at ts 10.
    a.begin(Timestamp::new(BASE_MS + 10, a_id));
    a.write(b"k".to_vec(), b"1".to_vec()).unwrap();
    let a_digest = a.commit().unwrap();
    let mut clients = HashMap::from([(a_id, &mut a)]);
    let events = cluster.pump(&mut clients);
    assert!(finished_outcomes(&events)
        .iter()
        .any(|(_, d, o)| *d == a_digest && *o == TxnOutcome::Committed));

    // B's transaction read k before A's commit (version 0) and prepares
    // only now, at ts 30. The committed write at ts 10 sits inside B's
    // read window: every replica must vote ABORT with A's commit proof.
    let fake_b = cluster.config.first_client_id() + 40;
    let mut b_txn = Transaction {
        client_id: fake_b,
        client_seq_num: 1,
        timestamp: Timestamp::new(BASE_MS + 30, fake_b),
        read_set: vec![ReadSetEntry {
            key: b"k".to_vec(),
            read_time: Timestamp::zero(),
        }],
        write_set: vec![WriteSetEntry {
            key: b"k".to_vec(),
            value: b"2".to_vec(),
        }],
        involved_groups: vec![0],
        deps: Vec::new(),
    };
    b_txn.canonicalize();
    let b_digest = b_txn.digest(true);
    for idx in 0..cluster.config.n() {
        cluster.inject(
            Address::Client(fake_b),
            Address::Replica { group: 0, idx },
            Message::Phase1(Phase1Msg {
                req_id: 1,
                txn: b_txn.clone(),
                replica_gossip: false,
                crash_failure: false,
            }),
        );
    }
    let mut unclaimed = Vec::new();
    cluster.pump_capturing(&mut clients, &mut unclaimed);

    let conflict = unclaimed
        .iter()
        .find_map(|(id, msg)| match msg {
            Message::Phase1Reply(r) if *id == fake_b => {
                assert_eq!(r.cc.result, CcResult::Abort);
                r.committed_conflict.clone()
            }
            _ => None,
        })
        .expect("abort vote carries the commit proof");
    assert_eq!(conflict.txn.digest(true), a_digest);

    // Any client can finish the fast abort with the self-authenticating
    // conflict; no signatures are required on the writeback itself.
    for idx in 0..cluster.config.n() {
        cluster.inject(
            Address::Client(fake_b),
            Address::Replica { group: 0, idx },
            Message::Writeback(WritebackMsg {
                decision: palisade_engine::engine::Decision::Abort,
                txn_digest: b_digest,
                txn: Some(b_txn.clone()),
                p1_sigs: None,
                p2_sigs: None,
                p2_view: None,
                conflict: Some(conflict.clone()),
            }),
        );
    }
    cluster.pump_capturing(&mut clients, &mut unclaimed);

    for replica in cluster.replicas.values() {
        assert!(replica.is_aborted(&b_digest));
        assert!(!replica.is_committed(&b_digest));
        let (_, v) = replica
            .store()
            .get(b"k", Timestamp::new(BASE_MS + 60, 0))
            .expect("version");
        assert_eq!(v.value, b"1".to_vec());
        assert!(replica.stats().cc_aborts >= 1);
    }
}
