//! View-change fallback under a client that equivocates Phase2 decisions.
//!
//! Test flow (f = 1, n = 6):
//! 1) Replicas 0/2/4 hold a prepared conflicting write, so Phase1 votes on
//!    the victim transaction split 3 COMMIT / 3 ABSTAIN: no fast path.
//! 2) A byzantine client sends Phase2 COMMIT to one half and ABORT to the
//!    other: the slow path deadlocks at view 0.
//! 3) An honest interested client collects state via Phase1FB, fails to
//!    find a Phase2 quorum, and invokes view 1.
//! 4) Replicas vote ElectFB to the deterministic leader; 2f+1 matching
//!    votes produce a DecisionFB; all correct replicas adopt it at view 1
//!    and the fallback client finishes the transaction with that quorum.

mod common;

use std::collections::HashMap;

use common::{Cluster, BASE_MS};
use palisade_client::ClientEvent;
use palisade_engine::engine::{
    Address, CcResult, Config, Decision, Message, MoveViewMsg, Phase1Msg, Phase2Msg, ReadSetEntry,
    Timestamp, Transaction, TxnDigest, WriteSetEntry,
};

fn fallback_config() -> Config {
    Config {
        f: 1,
        num_groups: 1,
        sign_messages: true,
        validate_proofs: false,
        verify_deps: false,
        ..Config::default()
    }
}

fn send_phase1(cluster: &Cluster, client: u64, txn: &Transaction, replicas: &[u64]) {
    for idx in replicas {
        cluster.inject(
            Address::Client(client),
            Address::Replica { group: 0, idx: *idx },
            Message::Phase1(Phase1Msg {
                req_id: 1,
                txn: txn.clone(),
                replica_gossip: false,
                crash_failure: false,
            }),
        );
    }
}

#[test]
fn equivocated_phase2_resolves_in_one_view_change() {
    let cluster = Cluster::new(fallback_config());
    let byz = cluster.config.first_client_id() + 90;

    // Conflicting prepared write on replicas 0, 2, 4 only.
    let mut blocker = Transaction {
        client_id: byz + 1,
        client_seq_num: 1,
        timestamp: Timestamp::new(BASE_MS + 10, byz + 1),
        read_set: Vec::new(),
        write_set: vec![WriteSetEntry {
            key: b"k".to_vec(),
            value: b"w".to_vec(),
        }],
        involved_groups: vec![0],
        deps: Vec::new(),
    };
    blocker.canonicalize();
    send_phase1(&cluster, byz + 1, &blocker, &[0, 2, 4]);

    // The victim transaction reads "k" below the blocker and writes "m".
    let mut victim = Transaction {
        client_id: byz,
        client_seq_num: 1,
        timestamp: Timestamp::new(BASE_MS + 20, byz),
        read_set: vec![ReadSetEntry {
            key: b"k".to_vec(),
            read_time: Timestamp::zero(),
        }],
        write_set: vec![WriteSetEntry {
            key: b"m".to_vec(),
            value: b"v".to_vec(),
        }],
        involved_groups: vec![0],
        deps: Vec::new(),
    };
    victim.canonicalize();
    let digest = victim.digest(true);
    send_phase1(&cluster, byz, &victim, &[0, 1, 2, 3, 4, 5]);

    let mut no_clients = HashMap::new();
    let mut unclaimed = Vec::new();
    cluster.pump_capturing(&mut no_clients, &mut unclaimed);
    for idx in [0u64, 2, 4] {
        assert_eq!(
            cluster.replica(0, idx).p1_decision(&digest),
            Some(CcResult::Abstain)
        );
    }
    for idx in [1u64, 3, 5] {
        assert_eq!(
            cluster.replica(0, idx).p1_decision(&digest),
            Some(CcResult::Commit)
        );
    }

    // Equivocation: COMMIT to replicas 0-2, ABORT to replicas 3-5.
    for idx in 0..cluster.config.n() {
        let decision = if idx < 3 {
            Decision::Commit
        } else {
            Decision::Abort
        };
        cluster.inject(
            Address::Client(byz),
            Address::Replica { group: 0, idx },
            Message::Phase2(Phase2Msg {
                req_id: 2,
                decision,
                txn_digest: digest,
                txn: Some(victim.clone()),
                grouped_sigs: Default::default(),
            }),
        );
    }
    cluster.pump_capturing(&mut no_clients, &mut unclaimed);
    assert_eq!(
        cluster.replica(0, 0).p2_decision(&digest),
        Some((Decision::Commit, 0))
    );
    assert_eq!(
        cluster.replica(0, 5).p2_decision(&digest),
        Some((Decision::Abort, 0))
    );

    // An honest client becomes interested and gathers state. The divergent
    // Phase2 halves cannot form a 3f+1 quorum in view 0.
    let (c_id, mut c) = cluster.client();
    let events = c.start_fallback(victim.clone());
    assert!(matches!(
        events.as_slice(),
        [ClientEvent::FallbackStarted { .. }]
    ));
    let mut clients = HashMap::from([(c_id, &mut c)]);
    let events = cluster.pump(&mut clients);
    assert!(
        events
            .iter()
            .all(|(_, e)| !matches!(e, ClientEvent::FallbackFinished { .. })),
        "view 0 must stay deadlocked"
    );
    drop(clients);

    // Invoke view 1; one ElectFB/DecisionFB round must settle everything.
    let proposed = c.invoke_fallback(&digest).expect("certificates collected");
    assert_eq!(proposed, 1);
    let mut clients = HashMap::from([(c_id, &mut c)]);
    let events = cluster.pump(&mut clients);
    let finished = events.iter().find_map(|(_, e)| match e {
        ClientEvent::FallbackFinished { txn_digest, decision } if *txn_digest == digest => {
            Some(*decision)
        }
        _ => None,
    });
    let decision = finished.expect("fallback resolves after one view change");

    for replica in cluster.replicas.values() {
        let (d, view) = replica.p2_decision(&digest).expect("decision adopted");
        assert_eq!(d, decision, "no two correct replicas diverge");
        assert_eq!(view, 1, "decision taken in view 1");
        assert!(replica.current_view(&digest) >= 1);
        match decision {
            Decision::Commit => assert!(replica.is_committed(&digest)),
            Decision::Abort => assert!(replica.is_aborted(&digest)),
        }
    }
}

#[test]
fn move_view_amplification_thresholds() {
    let cluster = Cluster::new(fallback_config());
    let digest = TxnDigest([9u8; 32]);
    let mut no_clients = HashMap::new();

    // Two proposals (f+1) make replica 0 re-broadcast; its own echo is the
    // third proposal, which reaches the 2f+1 adoption threshold locally.
    for idx in [1u64, 2] {
        cluster.inject(
            Address::Replica { group: 0, idx },
            Address::Replica { group: 0, idx: 0 },
            Message::MoveView(MoveViewMsg {
                txn_digest: digest,
                view: 3,
            }),
        );
    }
    cluster.pump(&mut no_clients);
    assert_eq!(cluster.replica(0, 0).current_view(&digest), 3);
    // Peers saw only replica 0's single re-broadcast: below both thresholds.
    assert_eq!(cluster.replica(0, 5).current_view(&digest), 0);

    // Broadcasting the same two proposals to everyone pushes every replica
    // past 2f+1 once the amplification round lands.
    for idx in [1u64, 2] {
        for target in 0..cluster.config.n() {
            cluster.inject(
                Address::Replica { group: 0, idx },
                Address::Replica {
                    group: 0,
                    idx: target,
                },
                Message::MoveView(MoveViewMsg {
                    txn_digest: digest,
                    view: 3,
                }),
            );
        }
    }
    cluster.pump(&mut no_clients);
    for replica in cluster.replicas.values() {
        assert_eq!(replica.current_view(&digest), 3);
    }
}
