//! Per-replica transaction engine.
//!
//! Handles the five top-level client messages (Read, Phase1, Phase2,
//! Writeback, Abort) and owns the digest lifecycle: ongoing → prepared →
//! committed/aborted, with Clean as the single forget point for the record
//! and P1/P2 metadata retained for stragglers and fallback queries. The
//! fallback handlers live in `fallback.rs` as a second impl block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use palisade_crypto::{
    BatchSigner, BatchSignerConfig, KeyManager, ProcessId, SessionKeys, Verifier,
};

use super::deps;
use super::dispatch::{Affinity, Dispatcher};
use super::messages::{
    encode_payload, AbortMsg, CcVote, ForwardWriteback, Message, Phase1Msg, Phase1Reply,
    Phase2Decision, Phase2Msg, Phase2Reply, ReadMsg, ReadReply, RelayP1, WriteRecord,
    WritebackMsg,
};
use super::mvtso;
use super::proofs;
use super::state::{P2Meta, PendingRelay, ReplicaState};
use super::store::MultiVersionStore;
use super::types::{
    Address, CcResult, Clock, CommittedProof, Config, Decision, GroupId, Network, ProofSigs,
    ReplicaIdx, Timestamp, Transaction, TxnDigest, Value,
};

/// Monotonic protocol counters, snapshotted for tests and monitoring.
#[derive(Default)]
pub(super) struct Stats {
    pub(super) reads: AtomicU64,
    pub(super) cc_commits: AtomicU64,
    pub(super) cc_abstains: AtomicU64,
    pub(super) cc_aborts: AtomicU64,
    pub(super) cc_waits: AtomicU64,
    pub(super) p1_replays: AtomicU64,
    pub(super) p2_requests: AtomicU64,
    pub(super) committed_txns: AtomicU64,
    pub(super) aborted_txns: AtomicU64,
    pub(super) stale_messages: AtomicU64,
    pub(super) invalid_proofs: AtomicU64,
    pub(super) dep_missing: AtomicU64,
    pub(super) relays_sent: AtomicU64,
    pub(super) elect_votes: AtomicU64,
    pub(super) fallback_decisions: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Clone, Copy, Debug, Default)]
pub struct StatsSnapshot {
    pub reads: u64,
    pub cc_commits: u64,
    pub cc_abstains: u64,
    pub cc_aborts: u64,
    pub cc_waits: u64,
    pub p1_replays: u64,
    pub p2_requests: u64,
    pub committed_txns: u64,
    pub aborted_txns: u64,
    pub stale_messages: u64,
    pub invalid_proofs: u64,
    pub dep_missing: u64,
    pub relays_sent: u64,
    pub elect_votes: u64,
    pub fallback_decisions: u64,
}

impl Stats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            cc_commits: self.cc_commits.load(Ordering::Relaxed),
            cc_abstains: self.cc_abstains.load(Ordering::Relaxed),
            cc_aborts: self.cc_aborts.load(Ordering::Relaxed),
            cc_waits: self.cc_waits.load(Ordering::Relaxed),
            p1_replays: self.p1_replays.load(Ordering::Relaxed),
            p2_requests: self.p2_requests.load(Ordering::Relaxed),
            committed_txns: self.committed_txns.load(Ordering::Relaxed),
            aborted_txns: self.aborted_txns.load(Ordering::Relaxed),
            stale_messages: self.stale_messages.load(Ordering::Relaxed),
            invalid_proofs: self.invalid_proofs.load(Ordering::Relaxed),
            dep_missing: self.dep_missing.load(Ordering::Relaxed),
            relays_sent: self.relays_sent.load(Ordering::Relaxed),
            elect_votes: self.elect_votes.load(Ordering::Relaxed),
            fallback_decisions: self.fallback_decisions.load(Ordering::Relaxed),
        }
    }
}

/// One replica of one group.
pub struct Replica {
    pub(super) config: Arc<Config>,
    pub(super) group: GroupId,
    pub(super) idx: ReplicaIdx,
    pub(super) id: ProcessId,
    pub(super) state: ReplicaState,
    pub(super) verifier: Verifier,
    pub(super) vote_signer: Arc<BatchSigner>,
    pub(super) read_signer: Arc<BatchSigner>,
    pub(super) session: SessionKeys,
    pub(super) net: Arc<dyn Network>,
    pub(super) dispatcher: Arc<Dispatcher>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) stats: Stats,
}

impl Replica {
    pub fn new(
        config: Config,
        group: GroupId,
        idx: ReplicaIdx,
        keys: Arc<KeyManager>,
        net: Arc<dyn Network>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let id = config.replica_process_id(group, idx);
        anyhow::ensure!(
            keys.id() == id,
            "key manager identity {} does not match replica id {id}",
            keys.id()
        );
        let signer_config = BatchSignerConfig {
            batch_size: config.signature_batch_size,
            batch_timeout: config.batch_timeout,
            merkle_branch_factor: config.merkle_branch_factor,
            adjust_batch_size: config.adjust_batch_size,
            ..BatchSignerConfig::default()
        };
        let vote_signer = BatchSigner::new(keys.clone(), signer_config.clone());
        // Shared-batch mode funnels every reply pipeline through one batch;
        // otherwise read replies aggregate separately from votes.
        let read_signer = if config.shared_mem_batches {
            vote_signer.clone()
        } else {
            BatchSigner::new(keys.clone(), signer_config)
        };
        let dispatcher = Dispatcher::new(
            if config.multi_threading {
                config.worker_threads.max(1)
            } else {
                0
            },
            1024,
        );
        let session = SessionKeys::new(id, config.session_seed);
        Ok(Arc::new(Self {
            verifier: Verifier::new(keys),
            config: Arc::new(config),
            group,
            idx,
            id,
            state: ReplicaState::new(),
            vote_signer,
            read_signer,
            session,
            net,
            dispatcher,
            clock,
            stats: Stats::default(),
        }))
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn store(&self) -> &MultiVersionStore {
        &self.state.store
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_committed(&self, digest: &TxnDigest) -> bool {
        self.state.committed.contains_key(digest)
    }

    pub fn is_aborted(&self, digest: &TxnDigest) -> bool {
        self.state.aborted.contains(digest)
    }

    pub fn p1_decision(&self, digest: &TxnDigest) -> Option<CcResult> {
        self.state.p1_decisions.get(digest).map(|e| *e)
    }

    pub fn p2_decision(&self, digest: &TxnDigest) -> Option<(Decision, u64)> {
        self.state
            .p2_meta
            .get(digest)
            .map(|m| (m.decision, m.decision_view))
    }

    pub fn current_view(&self, digest: &TxnDigest) -> u64 {
        self.state.current_view(digest)
    }

    /// Install an initial value outside the protocol (startup data load).
    pub fn load(&self, key: &[u8], value: Value, ts: Timestamp) {
        let proof = Arc::new(CommittedProof {
            txn: Transaction {
                client_id: 0,
                client_seq_num: 0,
                timestamp: Timestamp::zero(),
                read_set: Vec::new(),
                write_set: Vec::new(),
                involved_groups: Vec::new(),
                deps: Vec::new(),
            },
            sigs: ProofSigs::Genesis,
        });
        self.state.store.put(key, value, proof, ts);
    }

    /// Route one inbound message.
    pub fn handle_message(self: &Arc<Self>, from: Address, msg: Message) {
        match (from, msg) {
            (Address::Client(c), Message::Read(m)) => {
                if self.config.parallel_reads && self.dispatcher.worker_count() > 0 {
                    let this = self.clone();
                    self.dispatcher
                        .submit(Affinity::AnyWorker, Box::new(move || this.handle_read(c, m)));
                } else {
                    self.handle_read(c, m);
                }
            }
            (Address::Client(c), Message::Phase1(m)) => self.handle_phase1(c, m),
            (Address::Client(c), Message::Phase2(m)) => self.handle_phase2(c, m),
            (Address::Client(c), Message::Writeback(m)) => self.handle_writeback(c, m),
            (Address::Client(c), Message::Abort(m)) => self.handle_abort(c, m),
            (Address::Client(c), Message::Phase1FB(m)) => self.handle_phase1fb(c, m),
            (Address::Client(c), Message::Phase2FB(m)) => self.handle_phase2fb(c, m),
            (Address::Client(c), Message::InvokeFB(m)) => self.handle_invoke_fb(c, m),
            (_, Message::ElectFB(m)) => self.handle_elect_fb(m),
            (_, Message::DecisionFB(m)) => self.handle_decision_fb(m),
            (from, Message::MoveView(m)) => self.handle_move_view(from, m),
            (from, msg) => {
                tracing::warn!(from = ?from, msg = ?msg, "unexpected message at replica");
            }
        }
    }

    /// Fire due relay timers; the embedding layer drives this periodically.
    pub fn tick(&self, now_ms: u64) {
        let due: Vec<PendingRelay> = {
            let mut relays = self.state.relays.lock();
            let (fire, keep): (Vec<_>, Vec<_>) =
                relays.drain(..).partition(|r| r.due_ms <= now_ms);
            *relays = keep;
            fire
        };
        for relay in due {
            if self.state.is_decided(&relay.dep_digest) {
                continue;
            }
            let Some(txn) = self
                .state
                .ongoing
                .get(&relay.dep_digest)
                .map(|e| e.value().clone())
            else {
                continue;
            };
            self.stats.relays_sent.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(dep = ?relay.dep_digest, client = relay.client, "relaying stalled dependency");
            self.net.send(
                Address::Client(relay.client),
                Message::RelayP1(RelayP1 {
                    dependent_req_id: relay.dependent_req_id,
                    txn_digest: relay.dep_digest,
                    txn: (*txn).clone(),
                }),
            );
        }
    }

    fn handle_read(&self, client: ProcessId, msg: ReadMsg) {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let ts = msg.timestamp;
        if mvtso::read_beyond_watermark(&self.config, self.clock.now_ms(), ts.ms) {
            tracing::debug!(ts = ?ts, "read timestamp beyond high watermark");
            return;
        }

        let mut write = WriteRecord {
            key: msg.key.clone(),
            ..WriteRecord::default()
        };
        let mut proof = None;
        if let Some((version, vv)) = self.state.store.get(&msg.key, ts) {
            write.committed_timestamp = Some(version);
            write.committed_value = Some(vv.value);
            if self.config.validate_proofs {
                proof = Some((*vv.proof).clone());
            }
        }

        self.state.store.advance_rts(&msg.key, ts.ms);

        // Expose the highest-timestamp prepared write so the client can read
        // it as a dependency, depth permitting.
        if self.config.max_dep_depth > -2 {
            if let Some(by_key) = self.state.writes_of_key(&msg.key) {
                let newest = {
                    let guard = by_key.read();
                    guard.iter().next_back().map(|(ts, txn)| (*ts, txn.clone()))
                };
                if let Some((prepared_ts, prepared_txn)) = newest {
                    let depth_ok = self.config.max_dep_depth == -1 || {
                        let cap = self.config.max_dep_depth as u64;
                        mvtso::dependency_depth(&self.state, &prepared_txn, cap) <= cap
                    };
                    if depth_ok {
                        let value = prepared_txn
                            .write_set
                            .iter()
                            .find(|w| w.key == msg.key)
                            .map(|w| w.value.clone());
                        write.prepared_value = value;
                        write.prepared_timestamp = Some(prepared_ts);
                        write.prepared_txn_digest =
                            Some(prepared_txn.digest(self.config.hash_digest));
                    }
                }
            }
        }

        let needs_sig = self.config.validate_proofs
            && self.config.sign_messages
            && (write.committed_value.is_some()
                || (self.config.verify_deps && write.prepared_value.is_some()));

        let mut reply = ReadReply {
            req_id: msg.req_id,
            key: msg.key,
            write: write.clone(),
            proof,
            signed_write: None,
        };
        let to = Address::Client(client);
        if !needs_sig {
            self.net.send(to, Message::ReadReply(reply));
            return;
        }

        let payload = encode_payload(&write);
        if self.config.read_reply_batch {
            let net = self.net.clone();
            self.read_signer.enqueue(
                payload,
                Box::new(move |sm| {
                    reply.signed_write = Some(sm);
                    net.send(to, Message::ReadReply(reply));
                }),
            );
        } else {
            reply.signed_write = Some(self.read_signer.sign_now(payload));
            self.net.send(to, Message::ReadReply(reply));
        }
    }

    fn handle_phase1(self: &Arc<Self>, client: ProcessId, msg: Phase1Msg) {
        let mut txn = msg.txn;
        txn.canonicalize();
        let digest = txn.digest(self.config.hash_digest);
        tracing::debug!(
            digest = %digest.short_hex(),
            client_id = txn.client_id,
            seq = txn.client_seq_num,
            "phase1"
        );

        // No-replay: a decided digest is never re-executed.
        if self.state.is_decided(&digest) {
            self.stats.stale_messages.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Replays reuse the buffered decision.
        if let Some(result) = self.p1_decision(&digest) {
            self.stats.p1_replays.fetch_add(1, Ordering::Relaxed);
            if result == CcResult::Wait {
                if let Some(mut waiting) = self.state.waiting.get_mut(&digest) {
                    waiting.original_client = true;
                    waiting.req_id = msg.req_id;
                    waiting.client = Some(client);
                }
                return;
            }
            let conflict = self.state.p1_conflicts.get(&digest).map(|e| e.value().clone());
            let abstain_conflict = self.state.p1_abstain_conflicts.get(&digest).map(|e| *e);
            self.send_phase1_reply(msg.req_id, digest, result, conflict, abstain_conflict, client);
            return;
        }

        // A concurrent evaluation owns this digest; its buffered result wins.
        if self.state.ongoing.contains_key(&digest) {
            return;
        }

        if self.config.validate_proofs && self.config.sign_messages && self.config.verify_deps {
            for dep in &txn.deps {
                if !proofs::validate_dependency(&self.config, &self.verifier, dep) {
                    tracing::warn!(digest = %digest.short_hex(), "dependency proof failed validation");
                    self.stats.invalid_proofs.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }

        let txn = Arc::new(txn);
        self.state.current_views.entry(digest).or_insert(0);
        self.state.ongoing.insert(digest, txn.clone());

        if self.config.parallel_ccc && self.dispatcher.worker_count() > 0 {
            let this = self.clone();
            let req_id = msg.req_id;
            let keyed = u64::from_be_bytes(digest.0[..8].try_into().expect("digest is 32 bytes"));
            self.dispatcher.submit(
                Affinity::Keyed(keyed),
                Box::new(move || {
                    if !this.state.ongoing.contains_key(&digest) {
                        return;
                    }
                    this.run_cc_check(req_id, client, digest, txn, false);
                }),
            );
        } else {
            self.run_cc_check(msg.req_id, client, digest, txn, false);
        }
    }

    /// Run the concurrency-control check and process its outcome. Also the
    /// entry point for fallback-driven Phase1 executions.
    pub(super) fn run_cc_check(
        &self,
        req_id: u64,
        client: ProcessId,
        digest: TxnDigest,
        txn: Arc<Transaction>,
        fallback_flow: bool,
    ) -> CcResult {
        let outcome = mvtso::occ_check(
            &self.state,
            &self.config,
            self.group,
            digest,
            &txn,
            self.clock.now_ms(),
        );
        self.process_cc_outcome(req_id, client, digest, outcome, fallback_flow)
    }

    fn process_cc_outcome(
        &self,
        req_id: u64,
        client: ProcessId,
        digest: TxnDigest,
        outcome: mvtso::CcOutcome,
        fallback_flow: bool,
    ) -> CcResult {
        let computed = outcome.result();

        // First writer into P1 metadata wins; WAIT never overwrites a
        // terminal result, a terminal result does overwrite WAIT.
        let result = {
            let mut entry = self.state.p1_decisions.entry(digest).or_insert(computed);
            if *entry.value() == CcResult::Wait && computed != CcResult::Wait {
                *entry.value_mut() = computed;
            }
            *entry.value()
        };

        if result == CcResult::Abort {
            if let Some(conflict) = outcome.conflict.clone() {
                self.state.p1_conflicts.entry(digest).or_insert(conflict);
            }
        }
        if let Some(ac) = outcome.abstain_conflict {
            self.state.p1_abstain_conflicts.entry(digest).or_insert(ac);
        }

        match result {
            CcResult::Commit => self.stats.cc_commits.fetch_add(1, Ordering::Relaxed),
            CcResult::Abstain => self.stats.cc_abstains.fetch_add(1, Ordering::Relaxed),
            CcResult::Abort => self.stats.cc_aborts.fetch_add(1, Ordering::Relaxed),
            CcResult::Wait => self.stats.cc_waits.fetch_add(1, Ordering::Relaxed),
        };

        if result == CcResult::Wait {
            let waiter = deps::Waiter {
                req_id,
                client: Some(client),
                original_client: !fallback_flow,
            };
            deps::wait(&self.state, digest, &outcome.unresolved, waiter);
            if let Some(woken) =
                deps::resolve_if_ready(&self.state, &self.config, self.group, digest)
            {
                self.finish_waiting(woken);
                return result;
            }
            if !self.config.no_fallback {
                let due_ms =
                    self.clock.now_ms() + self.config.relay_p1_timeout.as_millis() as u64;
                let mut relays = self.state.relays.lock();
                for dep in &outcome.unresolved {
                    if self.state.ongoing.contains_key(dep) {
                        relays.push(PendingRelay {
                            dep_digest: *dep,
                            dependent_req_id: req_id,
                            client,
                            due_ms,
                        });
                    }
                }
            }
            // WAIT sends no reply; the resolution path answers later.
            return result;
        }

        // The fallback flow wraps the result in a Phase1FBReply itself.
        if !fallback_flow {
            let conflict = self.state.p1_conflicts.get(&digest).map(|e| e.value().clone());
            let abstain_conflict = self.state.p1_abstain_conflicts.get(&digest).map(|e| *e);
            self.send_phase1_reply(req_id, digest, result, conflict, abstain_conflict, client);
        }
        result
    }

    /// Deliver the delayed Phase1 result of a transaction whose dependencies
    /// all resolved: buffer it, answer the original client, and fan out to
    /// interested fallback clients.
    pub(super) fn finish_waiting(&self, woken: deps::Woken) {
        self.state.p1_decisions.insert(woken.digest, woken.result);
        if woken.waiter.original_client {
            if let Some(client) = woken.waiter.client {
                self.send_phase1_reply(
                    woken.waiter.req_id,
                    woken.digest,
                    woken.result,
                    None,
                    None,
                    client,
                );
            }
        }
        self.notify_interested_p1(woken.digest, woken.result);
    }

    pub(super) fn send_phase1_reply(
        &self,
        req_id: u64,
        digest: TxnDigest,
        result: CcResult,
        conflict: Option<Arc<CommittedProof>>,
        abstain_conflict: Option<TxnDigest>,
        client: ProcessId,
    ) {
        let cc = CcVote {
            result,
            txn_digest: digest,
            involved_group: self.group,
        };
        let mut reply = Phase1Reply {
            req_id,
            cc: cc.clone(),
            signed_cc: None,
            committed_conflict: conflict.map(|p| (*p).clone()),
            abstain_conflict,
        };
        let to = Address::Client(client);
        if !self.config.sign_messages {
            self.net.send(to, Message::Phase1Reply(reply));
            return;
        }
        let payload = encode_payload(&cc);
        let net = self.net.clone();
        self.vote_signer.enqueue(
            payload,
            Box::new(move |sm| {
                reply.signed_cc = Some(sm);
                net.send(to, Message::Phase1Reply(reply));
            }),
        );
    }

    fn handle_phase2(self: &Arc<Self>, client: ProcessId, msg: Phase2Msg) {
        self.stats.p2_requests.fetch_add(1, Ordering::Relaxed);
        let digest = msg.txn_digest;
        let Some(txn) = self.resolve_txn(&digest, msg.txn.clone()) else {
            self.stats.dep_missing.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(digest = %digest.short_hex(), "phase2 without transaction body");
            return;
        };

        if !self.state.p2_meta.contains_key(&digest)
            && self.config.validate_proofs
            && self.config.sign_messages
        {
            let this = self.clone();
            let work = Box::new(move || {
                if !proofs::validate_p1_quorum(
                    &this.config,
                    &this.verifier,
                    msg.decision,
                    &txn,
                    &digest,
                    &msg.grouped_sigs,
                ) {
                    this.stats.invalid_proofs.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(digest = %digest.short_hex(), "phase2 slow proof failed validation");
                    return;
                }
                this.install_and_answer_p2(client, msg.req_id, digest, msg.decision);
            });
            if self.config.multi_threading && self.dispatcher.worker_count() > 0 {
                self.dispatcher.submit(Affinity::AnyWorker, work);
            } else {
                work();
            }
            return;
        }

        self.install_and_answer_p2(client, msg.req_id, digest, msg.decision);
    }

    fn install_and_answer_p2(
        &self,
        client: ProcessId,
        req_id: u64,
        digest: TxnDigest,
        decision: Decision,
    ) {
        let (decision, view) = {
            let mut meta = self.state.p2_meta.entry(digest).or_insert_with(|| P2Meta {
                decision,
                decision_view: 0,
                has_p2: true,
                original_client: None,
            });
            let value = meta.value_mut();
            value.has_p2 = true;
            if value.original_client.is_none() {
                value.original_client = Some((req_id, client));
            }
            (value.decision, value.decision_view)
        };
        self.state.current_views.entry(digest).or_insert(0);
        self.send_phase2_reply(req_id, digest, decision, view, client);
    }

    pub(super) fn send_phase2_reply(
        &self,
        req_id: u64,
        digest: TxnDigest,
        decision: Decision,
        view: u64,
        client: ProcessId,
    ) {
        let p2_decision = Phase2Decision {
            txn_digest: digest,
            decision,
            view,
            involved_group: self.group,
        };
        let mut reply = Phase2Reply {
            req_id,
            p2_decision: p2_decision.clone(),
            signed_p2_decision: None,
        };
        let to = Address::Client(client);
        if !self.config.sign_messages {
            self.net.send(to, Message::Phase2Reply(reply));
            return;
        }
        let payload = encode_payload(&p2_decision);
        let net = self.net.clone();
        self.vote_signer.enqueue(
            payload,
            Box::new(move |sm| {
                reply.signed_p2_decision = Some(sm);
                net.send(to, Message::Phase2Reply(reply));
            }),
        );
    }

    fn handle_writeback(self: &Arc<Self>, _client: ProcessId, msg: WritebackMsg) {
        let digest = msg.txn_digest;
        // Replaying a decided writeback is a no-op.
        if self.state.is_decided(&digest) {
            self.stats.stale_messages.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Some(txn) = self.resolve_txn(&digest, msg.txn.clone()) else {
            self.stats.dep_missing.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(digest = %digest.short_hex(), "writeback without transaction body");
            return;
        };

        if self.config.validate_proofs {
            let valid = if let Some(conflict) = &msg.conflict {
                msg.decision == Decision::Abort
                    && proofs::validate_conflict(&self.config, &self.verifier, &txn, conflict)
            } else if let Some(p1_sigs) = &msg.p1_sigs {
                proofs::validate_p1_quorum(
                    &self.config,
                    &self.verifier,
                    msg.decision,
                    &txn,
                    &digest,
                    p1_sigs,
                )
            } else if let Some(p2_sigs) = &msg.p2_sigs {
                let log_group = self.config.log_group(&digest, &txn);
                proofs::validate_p2_quorum(
                    &self.config,
                    &self.verifier,
                    msg.decision,
                    msg.p2_view.unwrap_or(0),
                    &digest,
                    log_group,
                    p2_sigs,
                )
            } else {
                false
            };
            if !valid {
                self.stats.invalid_proofs.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    digest = %digest.short_hex(),
                    decision = ?msg.decision,
                    "writeback proof failed validation"
                );
                return;
            }
        }

        match msg.decision {
            Decision::Commit => {
                let sigs = if let Some(p1) = msg.p1_sigs {
                    ProofSigs::Phase1(p1)
                } else {
                    ProofSigs::Phase2 {
                        sigs: msg.p2_sigs.unwrap_or_default(),
                        view: msg.p2_view.unwrap_or(0),
                    }
                };
                tracing::debug!(digest = %digest.short_hex(), "writeback commit");
                self.commit_txn(digest, &txn, sigs);
            }
            Decision::Abort => {
                tracing::debug!(digest = %digest.short_hex(), "writeback abort");
                // Retained so stragglers can be answered with the proof.
                self.state.writeback_log.insert(digest, msg);
                self.abort_txn(digest);
            }
        }
    }

    /// Locate the transaction body: the ongoing record, or the message's
    /// body when its digest checks out.
    pub(super) fn resolve_txn(
        &self,
        digest: &TxnDigest,
        body: Option<Transaction>,
    ) -> Option<Arc<Transaction>> {
        if let Some(entry) = self.state.ongoing.get(digest) {
            return Some(entry.value().clone());
        }
        let mut txn = body?;
        txn.canonicalize();
        if txn.digest(self.config.hash_digest) != *digest {
            tracing::warn!(digest = %digest.short_hex(), "transaction body does not match digest");
            return None;
        }
        Some(Arc::new(txn))
    }

    pub(super) fn commit_txn(&self, digest: TxnDigest, txn: &Arc<Transaction>, sigs: ProofSigs) {
        let proof = Arc::new(CommittedProof {
            txn: (**txn).clone(),
            sigs,
        });
        self.state.committed.insert(digest, proof.clone());
        self.stats.committed_txns.fetch_add(1, Ordering::Relaxed);

        let ts = txn.timestamp;
        for read in &txn.read_set {
            if self.config.group_for_key(&read.key) != self.group {
                continue;
            }
            self.state
                .store
                .record_committed_read(&read.key, ts, read.read_time, proof.clone());
        }
        for write in &txn.write_set {
            if self.config.group_for_key(&write.key) != self.group {
                continue;
            }
            self.state
                .store
                .put(&write.key, write.value.clone(), proof.clone(), ts);
        }

        self.clean(digest);
        self.wake_dependents(&digest);
        deps::clean_dependencies(&self.state, &digest);
        self.forward_writeback_multi(&digest);
    }

    pub(super) fn abort_txn(&self, digest: TxnDigest) {
        self.state.aborted.insert(digest);
        self.stats.aborted_txns.fetch_add(1, Ordering::Relaxed);
        self.clean(digest);
        self.wake_dependents(&digest);
        deps::clean_dependencies(&self.state, &digest);
        self.forward_writeback_multi(&digest);
    }

    /// Remove the digest from ongoing and the prepared indexes. P1/P2
    /// metadata survives to answer stragglers; there is no metadata GC.
    fn clean(&self, digest: TxnDigest) {
        let prepared_txn = self
            .state
            .prepared
            .get(&digest)
            .map(|e| e.value().1.clone());
        if let Some(txn) = prepared_txn {
            let guards = mvtso::lock_txn_keys(&self.state, &txn);
            self.state.remove_prepared(&digest);
            mvtso::release_keys(guards);
        }
        self.state.ongoing.remove(&digest);
        // Retire relay timers tied to this digest.
        self.state.relays.lock().retain(|r| r.dep_digest != digest);
    }

    fn wake_dependents(&self, digest: &TxnDigest) {
        for woken in deps::on_resolved(&self.state, &self.config, self.group, digest) {
            self.finish_waiting(woken);
        }
    }

    /// Answer every interested client with the final outcome.
    pub(super) fn forward_writeback_multi(&self, digest: &TxnDigest) {
        let Some((_, interested)) = self.state.interested_clients.remove(digest) else {
            return;
        };
        for client in interested {
            self.forward_writeback(client, 0, digest);
        }
    }

    /// Reply with the stored final outcome, if any. Returns true when a
    /// ForwardWriteback was sent.
    pub(super) fn forward_writeback(
        &self,
        client: ProcessId,
        req_id: u64,
        digest: &TxnDigest,
    ) -> bool {
        if let Some(proof) = self.state.committed.get(digest).map(|e| e.value().clone()) {
            let (p1_sigs, p2_sigs, p2_view) = match &proof.sigs {
                ProofSigs::Phase1(sigs) => (Some(sigs.clone()), None, None),
                ProofSigs::Phase2 { sigs, view } => (None, Some(sigs.clone()), Some(*view)),
                ProofSigs::Genesis => (None, None, None),
            };
            self.net.send(
                Address::Client(client),
                Message::ForwardWriteback(ForwardWriteback {
                    req_id,
                    txn_digest: *digest,
                    wb: WritebackMsg {
                        decision: Decision::Commit,
                        txn_digest: *digest,
                        txn: Some(proof.txn.clone()),
                        p1_sigs,
                        p2_sigs,
                        p2_view,
                        conflict: None,
                    },
                }),
            );
            return true;
        }
        if self.state.aborted.contains(digest) {
            if let Some(wb) = self.state.writeback_log.get(digest).map(|e| e.value().clone()) {
                self.net.send(
                    Address::Client(client),
                    Message::ForwardWriteback(ForwardWriteback {
                        req_id,
                        txn_digest: *digest,
                        wb,
                    }),
                );
                return true;
            }
        }
        false
    }

    /// Authenticated client cleanup of RTS entries it contributed.
    fn handle_abort(&self, client: ProcessId, msg: AbortMsg) {
        if client != msg.client_id {
            return;
        }
        if self.config.sign_messages {
            let payload = encode_payload(&msg.internal);
            let Some(mac) = msg.mac else {
                tracing::warn!(client = client, "abort message missing mac");
                return;
            };
            if !self.session.verify(client, &payload, &mac) {
                tracing::warn!(client = client, "abort message failed authentication");
                return;
            }
        }
        for key in &msg.internal.read_set {
            self.state
                .store
                .clear_rts_if(key, msg.internal.timestamp.ms);
        }
    }
}
