//! Fast-path commits on a single group with f = 1, n = 6.
//!
//! Covered:
//! - Two clients with disjoint write sets both commit in one round trip.
//! - Reads of missing keys resolve without a proof; later reads observe
//!   committed values.
//! - A replica running a large signature batch coexists with per-message
//!   signers; its Merkle-path signatures verify against the same key table.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use common::{finished_outcomes, Cluster, BASE_MS};
use palisade_client::{ClientEvent, TxnOutcome};
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
fn disjoint_transactions_commit_fast() {
    let cluster = Cluster::new(signed_config());
    let (a_id, mut a) = cluster.client();
    let (b_id, mut b) = cluster.client();

    a.begin(Timestamp::new(BASE_MS + 10, a_id));
    a.write(b"k1".to_vec(), b"1".to_vec()).unwrap();
    let a_digest = a.commit().unwrap();

    b.begin(Timestamp::new(BASE_MS + 11, b_id));
    b.write(b"k2".to_vec(), b"2".to_vec()).unwrap();
    let b_digest = b.commit().unwrap();

    let mut clients = HashMap::from([(a_id, &mut a), (b_id, &mut b)]);
    let events = cluster.pump(&mut clients);
    let outcomes = finished_outcomes(&events);
    assert!(outcomes.contains(&(a_id, a_digest, TxnOutcome::Committed)));
    assert!(outcomes.contains(&(b_id, b_digest, TxnOutcome::Committed)));

    for replica in cluster.replicas.values() {
        assert!(replica.is_committed(&a_digest));
        assert!(replica.is_committed(&b_digest));
        let after = Timestamp::new(BASE_MS + 50, 0);
        let (_, v1) = replica.store().get(b"k1", after).expect("k1 committed");
        let (_, v2) = replica.store().get(b"k2", after).expect("k2 committed");
        assert_eq!(v1.value, b"1".to_vec());
        assert_eq!(v2.value, b"2".to_vec());
    }
}

#[test]
fn read_of_missing_key_then_committed_value() {
    let cluster = Cluster::new(signed_config());
    let (a_id, mut a) = cluster.client();

    // Read before any commit: no value, no proof.
    a.begin(Timestamp::new(BASE_MS + 10, a_id));
    let read_req = a.read(b"k".to_vec()).unwrap();
    let mut clients = HashMap::from([(a_id, &mut a)]);
    let events = cluster.pump(&mut clients);
    let read = events
        .iter()
        .find_map(|(_, e)| match e {
            ClientEvent::ReadCompleted { req_id, value, .. } if *req_id == read_req => {
                Some(value.clone())
            }
            _ => None,
        })
        .expect("read completes");
    assert!(read.is_none());

    // Write through the same transaction and commit.
    drop(clients);
    a.write(b"k".to_vec(), b"v".to_vec()).unwrap();
    let digest = a.commit().unwrap();
    let mut clients = HashMap::from([(a_id, &mut a)]);
    let events = cluster.pump(&mut clients);
    assert!(finished_outcomes(&events)
        .iter()
        .any(|(_, d, o)| *d == digest && *o == TxnOutcome::Committed));

    // A later read observes the committed version.
    let (b_id, mut b) = cluster.client();
    b.begin(Timestamp::new(BASE_MS + 30, b_id));
    let read_req = b.read(b"k".to_vec()).unwrap();
    let mut clients = HashMap::from([(b_id, &mut b)]);
    let events = cluster.pump(&mut clients);
    let read = events
        .iter()
        .find_map(|(_, e)| match e {
            ClientEvent::ReadCompleted { req_id, value, .. } if *req_id == read_req => {
                Some(value.clone())
            }
            _ => None,
        })
        .expect("read completes");
    let (ts, value) = read.expect("value visible");
    assert_eq!(value, b"v".to_vec());
    assert_eq!(ts, Timestamp::new(BASE_MS + 10, a_id));
}

#[test]
fn mixed_signature_batch_sizes_coexist() {
    // Replica 0 signs per message; the rest batch up to 64 signatures with
    // a short timeout. Any fast quorum here mixes plain and Merkle-path
    // signatures, so both formats must verify against the same key table.
    let cluster = Cluster::new_with(signed_config(), |_, idx, config| {
        if idx != 0 {
            config.signature_batch_size = 64;
            config.batch_timeout = Duration::from_millis(2);
        }
    });
    let (a_id, mut a) = cluster.client();
    let (b_id, mut b) = cluster.client();

    a.begin(Timestamp::new(BASE_MS + 10, a_id));
    a.write(b"x1".to_vec(), b"1".to_vec()).unwrap();
    let a_digest = a.commit().unwrap();
    b.begin(Timestamp::new(BASE_MS + 11, b_id));
    b.write(b"x2".to_vec(), b"2".to_vec()).unwrap();
    let b_digest = b.commit().unwrap();

    let mut clients = HashMap::from([(a_id, &mut a), (b_id, &mut b)]);
    let events = cluster.pump_until_quiet(&mut clients, Duration::from_secs(5));
    let outcomes = finished_outcomes(&events);
    assert!(outcomes.contains(&(a_id, a_digest, TxnOutcome::Committed)));
    assert!(outcomes.contains(&(b_id, b_digest, TxnOutcome::Committed)));
    for replica in cluster.replicas.values() {
        assert!(replica.is_committed(&a_digest));
        assert!(replica.is_committed(&b_digest));
    }
}
