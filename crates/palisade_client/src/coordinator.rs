//! Transaction coordinator: drives interactive multi-shard transactions and
//! fallback sessions across the per-group shard clients.
//!
//! A transaction is built interactively (reads create the read set and may
//! pick up dependencies on prepared writes), then committed: Phase1 to every
//! involved group, per-group aggregation into fast or slow decisions, an
//! optional Phase2 round on the log group, and a Writeback broadcast. The
//! coordinator also acts as an interested client for other clients' stalled
//! transactions, driving the view-change fallback.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use palisade_crypto::{KeyManager, ProcessId, SessionKeys, Verifier};
use palisade_engine::engine::{
    encode_payload, AbortInternal, AbortMsg, Address, Config, Decision, GroupId, GroupedSigs,
    InjectFailure, Key, Message, Network, Timestamp, Transaction, TxnDigest, Value, WriteSetEntry,
    WritebackMsg,
};

use crate::shard::{Phase1Outcome, ShardClient, ShardEvent};

/// Client-visible transaction outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed,
    AbortedUser,
    AbortedSystem,
    AbortedMaxRetries,
}

/// Events surfaced to the embedding layer.
#[derive(Clone, Debug)]
pub enum ClientEvent {
    /// Arm the phase1 decision timer for `req_id`; fire it through
    /// [`Coordinator::on_phase1_timeout`].
    StartPhase1Timer { req_id: u64 },
    ReadCompleted {
        req_id: u64,
        key: Key,
        value: Option<(Timestamp, Value)>,
    },
    Finished {
        txn_digest: TxnDigest,
        outcome: TxnOutcome,
    },
    FallbackStarted { txn_digest: TxnDigest },
    FallbackFinished {
        txn_digest: TxnDigest,
        decision: Decision,
    },
}

enum Phase {
    Phase1,
    Phase2 { req_id: u64 },
    Done,
}

struct InFlight {
    txn: Transaction,
    digest: TxnDigest,
    p1_reqs: HashMap<u64, GroupId>,
    outcomes: BTreeMap<GroupId, Phase1Outcome>,
    phase: Phase,
}

/// Per-client protocol driver.
pub struct Coordinator {
    config: Arc<Config>,
    client_id: ProcessId,
    net: Arc<dyn Network>,
    session: SessionKeys,
    shards: BTreeMap<GroupId, ShardClient>,
    next_req_id: u64,
    next_seq: u64,
    building: Option<Transaction>,
    pending_reads: HashSet<u64>,
    current: Option<InFlight>,
    /// Stalled-transaction digests this client is driving fallback for.
    fallbacks: HashMap<TxnDigest, Transaction>,
    consecutive_abstains: u64,
}

impl Coordinator {
    pub fn new(
        config: Config,
        client_id: ProcessId,
        keys: Arc<KeyManager>,
        net: Arc<dyn Network>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let verifier = Verifier::new(keys);
        let mut shards = BTreeMap::new();
        for group in 0..config.num_groups {
            shards.insert(
                group,
                ShardClient::new(
                    config.clone(),
                    group,
                    client_id,
                    verifier.clone(),
                    net.clone(),
                ),
            );
        }
        Ok(Self {
            session: SessionKeys::new(client_id, config.session_seed),
            config,
            client_id,
            net,
            shards,
            next_req_id: 1,
            next_seq: 1,
            building: None,
            pending_reads: HashSet::new(),
            current: None,
            fallbacks: HashMap::new(),
            consecutive_abstains: 0,
        })
    }

    pub fn client_id(&self) -> ProcessId {
        self.client_id
    }

    pub fn consecutive_abstains(&self) -> u64 {
        self.consecutive_abstains
    }

    fn fresh_req_id(&mut self) -> u64 {
        let id = self.next_req_id;
        self.next_req_id += 1;
        id
    }

    // ---- interactive transaction building ----

    /// Start a new transaction at `timestamp`.
    pub fn begin(&mut self, timestamp: Timestamp) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.building = Some(Transaction {
            client_id: self.client_id,
            client_seq_num: seq,
            timestamp,
            read_set: Vec::new(),
            write_set: Vec::new(),
            involved_groups: Vec::new(),
            deps: Vec::new(),
        });
    }

    /// Issue a read for the in-progress transaction.
    pub fn read(&mut self, key: Key) -> anyhow::Result<u64> {
        let timestamp = self
            .building
            .as_ref()
            .map(|t| t.timestamp)
            .ok_or_else(|| anyhow::anyhow!("no transaction in progress"))?;
        let req_id = self.fresh_req_id();
        let group = self.config.group_for_key(&key);
        let shard = self
            .shards
            .get_mut(&group)
            .expect("group for key always exists");
        shard.get(req_id, key, timestamp);
        self.pending_reads.insert(req_id);
        Ok(req_id)
    }

    /// Buffer a write into the in-progress transaction.
    pub fn write(&mut self, key: Key, value: Value) -> anyhow::Result<()> {
        let txn = self
            .building
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("no transaction in progress"))?;
        txn.write_set.push(WriteSetEntry { key, value });
        Ok(())
    }

    /// Send Phase1 to every involved group; returns the digest.
    pub fn commit(&mut self) -> anyhow::Result<TxnDigest> {
        let mut txn = self
            .building
            .take()
            .ok_or_else(|| anyhow::anyhow!("no transaction in progress"))?;
        let mut groups: Vec<GroupId> = txn
            .read_set
            .iter()
            .map(|r| self.config.group_for_key(&r.key))
            .chain(
                txn.write_set
                    .iter()
                    .map(|w| self.config.group_for_key(&w.key)),
            )
            .collect();
        groups.sort_unstable();
        groups.dedup();
        anyhow::ensure!(!groups.is_empty(), "empty transaction");
        txn.involved_groups = groups.clone();
        txn.canonicalize();
        let digest = txn.digest(self.config.hash_digest);

        let mut p1_reqs = HashMap::new();
        for group in &groups {
            let req_id = self.fresh_req_id();
            p1_reqs.insert(req_id, *group);
            self.shards
                .get_mut(group)
                .expect("involved group exists")
                .phase1(req_id, &txn);
        }
        self.current = Some(InFlight {
            txn,
            digest,
            p1_reqs,
            outcomes: BTreeMap::new(),
            phase: Phase::Phase1,
        });
        Ok(digest)
    }

    /// User-initiated abort of the in-progress transaction: clears the RTS
    /// entries this client contributed.
    ///
    /// Session MACs are pairwise, so each replica gets its own tag.
    pub fn abort(&mut self) -> Vec<ClientEvent> {
        let Some(txn) = self.building.take() else {
            return Vec::new();
        };
        let internal = AbortInternal {
            timestamp: txn.timestamp,
            read_set: txn.read_set.iter().map(|r| r.key.clone()).collect(),
        };
        let payload = encode_payload(&internal);
        let mut groups: Vec<GroupId> = txn
            .read_set
            .iter()
            .map(|r| self.config.group_for_key(&r.key))
            .collect();
        groups.sort_unstable();
        groups.dedup();
        for group in groups {
            for idx in 0..self.config.n() {
                let replica = self.config.replica_process_id(group, idx);
                let mac = self
                    .config
                    .sign_messages
                    .then(|| self.session.mac(replica, &payload));
                self.net.send(
                    Address::Replica { group, idx },
                    Message::Abort(AbortMsg {
                        client_id: self.client_id,
                        internal: internal.clone(),
                        mac,
                    }),
                );
            }
        }
        vec![ClientEvent::Finished {
            txn_digest: txn.digest(self.config.hash_digest),
            outcome: TxnOutcome::AbortedUser,
        }]
    }

    // ---- fallback entry points ----

    /// Become an interested client for someone else's transaction.
    pub fn start_fallback(&mut self, txn: Transaction) -> Vec<ClientEvent> {
        if self.config.no_fallback {
            return Vec::new();
        }
        let mut txn = txn;
        txn.canonicalize();
        let digest = txn.digest(self.config.hash_digest);
        if self.fallbacks.contains_key(&digest) {
            return Vec::new();
        }
        let log_group = self.config.log_group(&digest, &txn);
        let req_id = self.fresh_req_id();
        self.fallbacks.insert(digest, txn.clone());
        if let Some(shard) = self.shards.get_mut(&log_group) {
            shard.start_fallback(req_id, txn);
        }
        vec![ClientEvent::FallbackStarted { txn_digest: digest }]
    }

    /// Propose the next view for a stalled fallback; call after the current
    /// leader failed to produce a decision in time.
    pub fn invoke_fallback(&mut self, digest: &TxnDigest) -> Option<u64> {
        let txn = self.fallbacks.get(digest)?;
        let log_group = self.config.log_group(digest, txn);
        self.shards.get_mut(&log_group)?.invoke_fallback(digest)
    }

    // ---- inbound ----

    /// Feed one inbound message; returns the events it produced.
    pub fn handle_message(&mut self, from: Address, msg: Message) -> Vec<ClientEvent> {
        let from = match from {
            Address::Replica { group, idx } => self.config.replica_process_id(group, idx),
            Address::Client(id) => id,
        };
        let mut shard_events: Vec<ShardEvent> = Vec::new();
        match msg {
            Message::ReadReply(reply) => {
                let group = self.config.group_for_key(&reply.key);
                if let Some(shard) = self.shards.get_mut(&group) {
                    shard_events.extend(shard.on_read_reply(from, reply));
                }
            }
            Message::Phase1Reply(reply) => {
                for shard in self.shards.values_mut() {
                    shard_events.extend(shard.on_phase1_reply(from, reply.clone()));
                }
            }
            Message::Phase2Reply(reply) => {
                for shard in self.shards.values_mut() {
                    shard_events.extend(shard.on_phase2_reply(from, reply.clone()));
                }
            }
            Message::Phase1FBReply(reply) => {
                for shard in self.shards.values_mut() {
                    shard_events.extend(shard.on_phase1fb_reply(from, reply.clone()));
                }
            }
            Message::Phase2FBReply(reply) => {
                for shard in self.shards.values_mut() {
                    shard_events.extend(shard.on_phase2fb_reply(from, reply.clone()));
                }
            }
            Message::SendView(view) => {
                for shard in self.shards.values_mut() {
                    shard.on_send_view(from, view.clone());
                }
            }
            Message::ForwardWriteback(fw) => {
                for shard in self.shards.values_mut() {
                    shard_events.extend(shard.on_forward_writeback(fw.clone()));
                }
            }
            Message::RelayP1(relay) => {
                return self.start_fallback(relay.txn);
            }
            other => {
                tracing::warn!(msg = ?other, "unexpected message at client");
            }
        }

        let mut events = Vec::new();
        for shard_event in shard_events {
            events.extend(self.absorb(shard_event));
        }
        events
    }

    /// The phase1 decision timer for `req_id` fired.
    pub fn on_phase1_timeout(&mut self, req_id: u64) -> Vec<ClientEvent> {
        let mut shard_events = Vec::new();
        for shard in self.shards.values_mut() {
            shard_events.extend(shard.on_phase1_timeout(req_id));
        }
        let mut events = Vec::new();
        for shard_event in shard_events {
            events.extend(self.absorb(shard_event));
        }
        events
    }

    // ---- event absorption ----

    fn absorb(&mut self, event: ShardEvent) -> Vec<ClientEvent> {
        match event {
            ShardEvent::GetResult {
                req_id,
                key,
                value,
                dep,
            } => {
                if !self.pending_reads.remove(&req_id) {
                    return Vec::new();
                }
                if let Some(txn) = self.building.as_mut() {
                    let read_time = match &value {
                        Some((ts, _)) => *ts,
                        None => Timestamp::zero(),
                    };
                    // Reading a prepared value observes the dependency's
                    // write at its prepared timestamp.
                    let read_time = dep
                        .as_ref()
                        .map(|d| d.prepared_timestamp)
                        .unwrap_or(read_time);
                    txn.read_set.push(palisade_engine::engine::ReadSetEntry {
                        key: key.clone(),
                        read_time,
                    });
                    if let Some(dep) = dep {
                        txn.deps.push(dep);
                    }
                }
                vec![ClientEvent::ReadCompleted { req_id, key, value }]
            }
            ShardEvent::Phase1TimerNeeded { req_id } => {
                vec![ClientEvent::StartPhase1Timer { req_id }]
            }
            ShardEvent::Phase1Resolved(outcome) => self.absorb_phase1(outcome),
            ShardEvent::Phase2Resolved {
                req_id,
                txn_digest,
                decision,
                view,
                sigs,
            } => self.absorb_phase2(req_id, txn_digest, decision, view, sigs),
            ShardEvent::FallbackP1Resolved(outcome) => self.absorb_fallback_p1(outcome),
            ShardEvent::FallbackP2Resolved {
                txn_digest,
                decision,
                view,
                sigs,
            } => self.absorb_fallback_p2(txn_digest, decision, view, sigs),
            ShardEvent::Decided { txn_digest, wb } => self.absorb_decided(txn_digest, wb),
        }
    }

    fn absorb_phase1(&mut self, outcome: Phase1Outcome) -> Vec<ClientEvent> {
        // Record the group's outcome inside a scoped borrow; aggregation
        // below re-borrows as needed.
        let (digest, txn, outcomes) = {
            let Some(current) = self.current.as_mut() else {
                return Vec::new();
            };
            if outcome.txn_digest != current.digest || !matches!(current.phase, Phase::Phase1) {
                return Vec::new();
            }
            current.outcomes.insert(outcome.group, outcome);
            if current.outcomes.len() < current.txn.involved_groups.len() {
                return Vec::new();
            }
            (
                current.digest,
                current.txn.clone(),
                current.outcomes.values().cloned().collect::<Vec<_>>(),
            )
        };

        let equivocate = outcomes.iter().any(|o| o.equivocate);
        let any_abort = outcomes.iter().any(|o| o.decision == Decision::Abort);
        let all_fast = outcomes.iter().all(|o| o.fast);
        let conflict = outcomes.iter().find_map(|o| o.conflict.clone());
        let log_group = self.config.log_group(&digest, &txn);

        if self.config.inject_failure == Some(InjectFailure::ClientCrash) {
            // Crash simulation: stop before making the outcome durable.
            self.set_phase(Phase::Done);
            return Vec::new();
        }

        if equivocate {
            // Byzantine simulation: conflicting Phase2 halves, then vanish.
            let mut grouped = GroupedSigs::new();
            for o in &outcomes {
                grouped.insert(o.group, o.sigs.clone());
            }
            self.set_phase(Phase::Done);
            let req_id = self.fresh_req_id();
            if let Some(shard) = self.shards.get_mut(&log_group) {
                shard.phase2(req_id, &txn, Decision::Commit, grouped);
            }
            return Vec::new();
        }

        if any_abort {
            if conflict.is_none() {
                self.consecutive_abstains += 1;
            } else {
                self.consecutive_abstains = 0;
            }
            let fast_abortable = conflict.is_some()
                || outcomes
                    .iter()
                    .filter(|o| o.decision == Decision::Abort)
                    .all(|o| o.fast);
            let mut grouped = GroupedSigs::new();
            for o in outcomes.iter().filter(|o| o.decision == Decision::Abort) {
                grouped.insert(o.group, o.sigs.clone());
            }
            if fast_abortable {
                let wb = WritebackMsg {
                    decision: Decision::Abort,
                    txn_digest: digest,
                    txn: Some(txn.clone()),
                    p1_sigs: conflict.is_none().then_some(grouped),
                    p2_sigs: None,
                    p2_view: None,
                    conflict,
                };
                self.finish_current();
                self.broadcast_writeback(&txn, wb);
                let outcome = if self.consecutive_abstains >= self.config.consecutive_max {
                    TxnOutcome::AbortedMaxRetries
                } else {
                    TxnOutcome::AbortedSystem
                };
                return vec![ClientEvent::Finished {
                    txn_digest: digest,
                    outcome,
                }];
            }
            // Slow abort: Phase2 with the aborting group's votes.
            let req_id = self.fresh_req_id();
            self.set_phase(Phase::Phase2 { req_id });
            if let Some(shard) = self.shards.get_mut(&log_group) {
                shard.phase2(req_id, &txn, Decision::Abort, grouped);
            }
            return Vec::new();
        }

        self.consecutive_abstains = 0;
        let mut grouped = GroupedSigs::new();
        for o in &outcomes {
            grouped.insert(o.group, o.sigs.clone());
        }
        if all_fast {
            let wb = WritebackMsg {
                decision: Decision::Commit,
                txn_digest: digest,
                txn: Some(txn.clone()),
                p1_sigs: Some(grouped),
                p2_sigs: None,
                p2_view: None,
                conflict: None,
            };
            self.finish_current();
            self.broadcast_writeback(&txn, wb);
            return vec![ClientEvent::Finished {
                txn_digest: digest,
                outcome: TxnOutcome::Committed,
            }];
        }
        // Slow commit: Phase2 on the log group with every group's votes.
        let req_id = self.fresh_req_id();
        self.set_phase(Phase::Phase2 { req_id });
        if let Some(shard) = self.shards.get_mut(&log_group) {
            shard.phase2(req_id, &txn, Decision::Commit, grouped);
        }
        Vec::new()
    }

    fn set_phase(&mut self, phase: Phase) {
        if let Some(current) = self.current.as_mut() {
            current.phase = phase;
        }
    }

    fn absorb_phase2(
        &mut self,
        req_id: u64,
        digest: TxnDigest,
        decision: Decision,
        view: u64,
        sigs: Vec<palisade_crypto::SignedMessage>,
    ) -> Vec<ClientEvent> {
        let Some(current) = self.current.as_ref() else {
            return Vec::new();
        };
        let expected = matches!(current.phase, Phase::Phase2 { req_id: r } if r == req_id);
        if !expected || current.digest != digest {
            return Vec::new();
        }
        let txn = current.txn.clone();
        let log_group = self.config.log_group(&digest, &txn);
        let mut p2_sigs = GroupedSigs::new();
        p2_sigs.insert(log_group, sigs);
        let wb = WritebackMsg {
            decision,
            txn_digest: digest,
            txn: Some(txn.clone()),
            p1_sigs: None,
            p2_sigs: Some(p2_sigs),
            p2_view: Some(view),
            conflict: None,
        };
        self.finish_current();
        self.broadcast_writeback(&txn, wb);
        let outcome = match decision {
            Decision::Commit => TxnOutcome::Committed,
            Decision::Abort => TxnOutcome::AbortedSystem,
        };
        vec![ClientEvent::Finished {
            txn_digest: digest,
            outcome,
        }]
    }

    fn absorb_fallback_p1(&mut self, outcome: Phase1Outcome) -> Vec<ClientEvent> {
        let digest = outcome.txn_digest;
        let Some(txn) = self.fallbacks.get(&digest).cloned() else {
            return Vec::new();
        };
        if outcome.fast {
            let mut grouped = GroupedSigs::new();
            grouped.insert(outcome.group, outcome.sigs.clone());
            let wb = WritebackMsg {
                decision: outcome.decision,
                txn_digest: digest,
                txn: Some(txn.clone()),
                p1_sigs: outcome.conflict.is_none().then_some(grouped),
                p2_sigs: None,
                p2_view: None,
                conflict: outcome.conflict.clone(),
            };
            self.broadcast_writeback(&txn, wb);
            return self.finish_fallback(digest, outcome.decision);
        }
        let log_group = self.config.log_group(&digest, &txn);
        if let Some(shard) = self.shards.get_mut(&log_group) {
            shard.phase2fb(&digest, Some(&outcome));
        }
        Vec::new()
    }

    fn absorb_fallback_p2(
        &mut self,
        digest: TxnDigest,
        decision: Decision,
        view: u64,
        sigs: Vec<palisade_crypto::SignedMessage>,
    ) -> Vec<ClientEvent> {
        let Some(txn) = self.fallbacks.get(&digest).cloned() else {
            return Vec::new();
        };
        let log_group = self.config.log_group(&digest, &txn);
        let mut p2_sigs = GroupedSigs::new();
        p2_sigs.insert(log_group, sigs);
        let wb = WritebackMsg {
            decision,
            txn_digest: digest,
            txn: Some(txn.clone()),
            p1_sigs: None,
            p2_sigs: Some(p2_sigs),
            p2_view: Some(view),
            conflict: None,
        };
        self.broadcast_writeback(&txn, wb);
        self.finish_fallback(digest, decision)
    }

    fn absorb_decided(&mut self, digest: TxnDigest, wb: WritebackMsg) -> Vec<ClientEvent> {
        let Some(txn) = self.fallbacks.get(&digest).cloned() else {
            return Vec::new();
        };
        let decision = wb.decision;
        self.broadcast_writeback(&txn, wb);
        self.finish_fallback(digest, decision)
    }

    fn finish_fallback(&mut self, digest: TxnDigest, decision: Decision) -> Vec<ClientEvent> {
        self.fallbacks.remove(&digest);
        for shard in self.shards.values_mut() {
            shard.cancel_fallback(&digest);
        }
        vec![ClientEvent::FallbackFinished {
            txn_digest: digest,
            decision,
        }]
    }

    fn finish_current(&mut self) {
        if let Some(current) = self.current.take() {
            let req_ids: Vec<u64> = current
                .p1_reqs
                .keys()
                .copied()
                .chain(match current.phase {
                    Phase::Phase2 { req_id } => Some(req_id),
                    _ => None,
                })
                .collect();
            for shard in self.shards.values_mut() {
                for req_id in &req_ids {
                    shard.cancel(*req_id);
                }
            }
        }
    }

    fn broadcast_writeback(&mut self, txn: &Transaction, wb: WritebackMsg) {
        for group in &txn.involved_groups {
            if let Some(shard) = self.shards.get(group) {
                shard.writeback(wb.clone());
            }
        }
    }
}
