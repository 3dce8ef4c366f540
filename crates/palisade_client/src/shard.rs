//! Per-group client state: pending reads, Phase1/Phase2 quorum collection,
//! and the fallback driver state.
//!
//! Each in-flight request owns an entry keyed by request id (fallbacks key
//! by digest); completion erases the entry, which is also how cancellation
//! works. Replies for erased entries are stale and ignored.

use std::collections::HashMap;
use std::sync::Arc;

use palisade_crypto::{ProcessId, SignedMessage, Verifier};
use palisade_engine::engine::{
    encode_payload, Address, CcResult, CommittedProof, Config, Decision, Dependency, ForwardWriteback,
    GroupId, GroupedSigs, InjectFailure, InvokeFB, Key, Message, Network, Phase1FB, Phase1FBReply,
    Phase1Msg, Phase1Reply, Phase2FB, Phase2FBReply, Phase2Msg, Phase2Reply, ReadMsg, ReadReply,
    SendView, Timestamp, Transaction, TxnDigest, Value, WritebackMsg,
};

use crate::validator::{Phase1ValidationState, Phase1Validator};

/// Outcome of one group's Phase1 aggregation.
#[derive(Clone, Debug)]
pub struct Phase1Outcome {
    pub req_id: u64,
    pub txn_digest: TxnDigest,
    pub group: GroupId,
    pub decision: Decision,
    pub fast: bool,
    pub equivocate: bool,
    pub conflict: Option<CommittedProof>,
    /// Votes supporting `decision` (commit sigs, or abstain/abort sigs).
    pub sigs: Vec<SignedMessage>,
    /// Prepared transactions replicas abstained on, for fallback targeting.
    pub abstain_conflicts: Vec<TxnDigest>,
}

/// Events surfaced to the coordinator.
#[derive(Clone, Debug)]
pub enum ShardEvent {
    GetResult {
        req_id: u64,
        key: Key,
        value: Option<(Timestamp, Value)>,
        dep: Option<Dependency>,
    },
    /// A tentative Phase1 state needs the decision timer armed.
    Phase1TimerNeeded { req_id: u64 },
    Phase1Resolved(Phase1Outcome),
    Phase2Resolved {
        req_id: u64,
        txn_digest: TxnDigest,
        decision: Decision,
        view: u64,
        sigs: Vec<SignedMessage>,
    },
    /// Fallback-path Phase1 aggregation resolved.
    FallbackP1Resolved(Phase1Outcome),
    /// Fallback collected a full Phase2 quorum in one view.
    FallbackP2Resolved {
        txn_digest: TxnDigest,
        decision: Decision,
        view: u64,
        sigs: Vec<SignedMessage>,
    },
    /// A replica forwarded the stored final outcome.
    Decided {
        txn_digest: TxnDigest,
        wb: WritebackMsg,
    },
}

struct PendingGet {
    key: Key,
    replies: HashMap<ProcessId, ()>,
    max_committed: Option<(Timestamp, Value)>,
    prepared: HashMap<TxnDigest, PreparedCandidate>,
}

struct PreparedCandidate {
    timestamp: Timestamp,
    sigs: HashMap<ProcessId, SignedMessage>,
}

struct PendingPhase1 {
    txn_digest: TxnDigest,
    validator: Phase1Validator,
    voted: HashMap<ProcessId, ()>,
    sigs_by_result: HashMap<CcResult, Vec<SignedMessage>>,
    abstain_conflicts: Vec<TxnDigest>,
    conflict: Option<CommittedProof>,
    timer_requested: bool,
    resolved: bool,
}

impl PendingPhase1 {
    fn new(digest: TxnDigest, config: &Config, equivocating: bool) -> Self {
        Self {
            txn_digest: digest,
            validator: Phase1Validator::new(config, equivocating),
            voted: HashMap::new(),
            sigs_by_result: HashMap::new(),
            abstain_conflicts: Vec::new(),
            conflict: None,
            timer_requested: false,
            resolved: false,
        }
    }
}

struct PendingPhase2 {
    txn_digest: TxnDigest,
    sigs: HashMap<(u64, Decision), HashMap<ProcessId, SignedMessage>>,
}

struct PendingFB {
    txn: Transaction,
    p1: PendingPhase1,
    /// Full Phase2 quorums per (view, decision) from fallback replies.
    p2_by_view: HashMap<(u64, Decision), HashMap<ProcessId, SignedMessage>>,
    /// Any-view matching P2 replies, used as f+1 decision evidence.
    p2_evidence: HashMap<Decision, HashMap<ProcessId, SignedMessage>>,
    /// Per-replica signed current-view table for InvokeFB quorums.
    views: HashMap<ProcessId, (u64, Option<SignedMessage>)>,
    invoked_view: u64,
    sent_p2fb: bool,
}

/// Client-side state for one replica group.
pub struct ShardClient {
    config: Arc<Config>,
    group: GroupId,
    client_id: ProcessId,
    verifier: Verifier,
    net: Arc<dyn Network>,
    pending_gets: HashMap<u64, PendingGet>,
    pending_p1s: HashMap<u64, PendingPhase1>,
    pending_p2s: HashMap<u64, PendingPhase2>,
    pending_fbs: HashMap<TxnDigest, PendingFB>,
    fb_req_ids: HashMap<TxnDigest, u64>,
}

impl ShardClient {
    pub fn new(
        config: Arc<Config>,
        group: GroupId,
        client_id: ProcessId,
        verifier: Verifier,
        net: Arc<dyn Network>,
    ) -> Self {
        Self {
            config,
            group,
            client_id,
            verifier,
            net,
            pending_gets: HashMap::new(),
            pending_p1s: HashMap::new(),
            pending_p2s: HashMap::new(),
            pending_fbs: HashMap::new(),
            fb_req_ids: HashMap::new(),
        }
    }

    fn broadcast(&self, msg: Message) {
        self.net.broadcast_group(self.group, self.config.n(), msg);
    }

    fn replica_in_group(&self, process_id: ProcessId) -> bool {
        let n = self.config.n();
        process_id / n == self.group && process_id < self.config.num_groups * n
    }

    /// Signed envelope checks shared by every reply path: the signer must be
    /// a replica of this group and the signature must cover `payload`.
    fn signed_payload_ok(&self, sm: &SignedMessage, payload: &[u8]) -> bool {
        self.replica_in_group(sm.process_id) && sm.data == payload && self.verifier.verify(sm)
    }

    // ---- reads ----

    pub fn get(&mut self, req_id: u64, key: Key, timestamp: Timestamp) {
        self.pending_gets.insert(
            req_id,
            PendingGet {
                key: key.clone(),
                replies: HashMap::new(),
                max_committed: None,
                prepared: HashMap::new(),
            },
        );
        self.broadcast(Message::Read(ReadMsg {
            req_id,
            key,
            timestamp,
        }));
    }

    pub fn on_read_reply(&mut self, from: ProcessId, reply: ReadReply) -> Option<ShardEvent> {
        // Validate the envelope before touching pending state; the borrow
        // rules want the checks split this way anyway.
        let has_value =
            reply.write.committed_value.is_some() || reply.write.prepared_value.is_some();
        if self.config.sign_messages && self.config.validate_proofs && has_value {
            let Some(sm) = &reply.signed_write else {
                return None;
            };
            let payload = encode_payload(&reply.write);
            if sm.process_id != from || !self.signed_payload_ok(sm, &payload) {
                tracing::warn!(from = from, "read reply signature rejected");
                return None;
            }
        }

        let pending = self.pending_gets.get_mut(&reply.req_id)?;
        if pending.key != reply.key || pending.replies.contains_key(&from) {
            return None;
        }
        pending.replies.insert(from, ());

        if let (Some(value), Some(ts)) = (
            reply.write.committed_value.clone(),
            reply.write.committed_timestamp,
        ) {
            if pending.max_committed.as_ref().map(|(t, _)| *t < ts).unwrap_or(true) {
                pending.max_committed = Some((ts, value));
            }
        }
        if let (Some(_), Some(pts), Some(digest)) = (
            reply.write.prepared_value.as_ref(),
            reply.write.prepared_timestamp,
            reply.write.prepared_txn_digest,
        ) {
            let candidate = pending
                .prepared
                .entry(digest)
                .or_insert_with(|| PreparedCandidate {
                    timestamp: pts,
                    sigs: HashMap::new(),
                });
            if let Some(sm) = reply.signed_write.clone() {
                candidate.sigs.insert(from, sm);
            }
        }

        if pending.replies.len() < self.config.fast_quorum() {
            return None;
        }
        let pending = self.pending_gets.remove(&reply.req_id)?;

        // Prefer a prepared value above the committed one when enough
        // replicas vouch for it; reading it creates a dependency.
        let committed_ts = pending.max_committed.as_ref().map(|(t, _)| *t);
        let dep = pending
            .prepared
            .iter()
            .filter(|(_, c)| {
                (!self.config.verify_deps || c.sigs.len() >= self.config.fast_quorum())
                    && committed_ts.map(|ct| c.timestamp > ct).unwrap_or(true)
            })
            .max_by_key(|(_, c)| c.timestamp)
            .map(|(digest, c)| Dependency {
                write_digest: *digest,
                prepared_timestamp: c.timestamp,
                involved_group: self.group,
                write_sigs: c.sigs.values().cloned().collect(),
            });

        Some(ShardEvent::GetResult {
            req_id: reply.req_id,
            key: pending.key,
            value: pending.max_committed,
            dep,
        })
    }

    // ---- phase1 ----

    pub fn phase1(&mut self, req_id: u64, txn: &Transaction) {
        let digest = txn.digest(self.config.hash_digest);
        let equivocating =
            self.config.inject_failure == Some(InjectFailure::ClientEquivocate);
        self.pending_p1s
            .insert(req_id, PendingPhase1::new(digest, &self.config, equivocating));
        let msg = Message::Phase1(Phase1Msg {
            req_id,
            txn: txn.clone(),
            replica_gossip: false,
            crash_failure: self.config.inject_failure == Some(InjectFailure::ClientCrash),
        });
        if self.config.inject_failure == Some(InjectFailure::ClientSendPartialP1) {
            // Byzantine simulation: starve all but a bare quorum.
            for idx in 0..self.config.fast_quorum() as u64 {
                self.net.send(
                    Address::Replica {
                        group: self.group,
                        idx,
                    },
                    msg.clone(),
                );
            }
        } else {
            self.broadcast(msg);
        }
    }

    pub fn on_phase1_reply(&mut self, from: ProcessId, reply: Phase1Reply) -> Option<ShardEvent> {
        let group = self.group;
        let sign = self.config.sign_messages;
        let payload = encode_payload(&reply.cc);
        let signature_ok = |sm: &Option<SignedMessage>, verifier: &Verifier| match sm {
            Some(sm) => sm.process_id == from && sm.data == payload && verifier.verify(sm),
            None => false,
        };
        let pending = self.pending_p1s.get_mut(&reply.req_id)?;
        if reply.cc.involved_group != group || reply.cc.txn_digest != pending.txn_digest {
            return None;
        }
        if pending.voted.contains_key(&from) {
            return None;
        }
        if sign && !signature_ok(&reply.signed_cc, &self.verifier) {
            tracing::warn!(from = from, "phase1 vote signature rejected");
            return None;
        }
        pending.voted.insert(from, ());

        if let Some(sm) = reply.signed_cc.clone() {
            pending
                .sigs_by_result
                .entry(reply.cc.result)
                .or_default()
                .push(sm);
        }
        if let Some(ac) = reply.abstain_conflict {
            pending.abstain_conflicts.push(ac);
        }
        let has_conflict = reply.committed_conflict.is_some();
        if has_conflict && pending.conflict.is_none() {
            pending.conflict = reply.committed_conflict.clone();
        }

        let state = pending.validator.process_vote(reply.cc.result, has_conflict);
        let event = Self::phase1_state_event(reply.req_id, self.group, state, pending);
        if matches!(event, Some(ShardEvent::Phase1Resolved(_))) {
            self.pending_p1s.remove(&reply.req_id);
        }
        event
    }

    /// The decision timer fired: commit to the tentative slow decision.
    pub fn on_phase1_timeout(&mut self, req_id: u64) -> Option<ShardEvent> {
        let pending = self.pending_p1s.get_mut(&req_id)?;
        let decision = if pending.validator.tentative_decision() {
            Decision::Commit
        } else {
            Decision::Abort
        };
        let outcome = Self::build_outcome(req_id, self.group, pending, decision, false, false);
        self.pending_p1s.remove(&req_id);
        Some(ShardEvent::Phase1Resolved(outcome))
    }

    fn phase1_state_event(
        req_id: u64,
        group: GroupId,
        state: Phase1ValidationState,
        pending: &mut PendingPhase1,
    ) -> Option<ShardEvent> {
        use Phase1ValidationState::*;
        if pending.resolved {
            return None;
        }
        let (decision, fast, equivocate) = match state {
            FastCommit => (Decision::Commit, true, false),
            FastAbort | FastAbstain => (Decision::Abort, true, false),
            SlowCommitFinal => (Decision::Commit, false, false),
            SlowAbortFinal => (Decision::Abort, false, false),
            Equivocate => (Decision::Commit, false, true),
            SlowCommitTentative | SlowAbortTentative => {
                if !pending.timer_requested {
                    pending.timer_requested = true;
                    return Some(ShardEvent::Phase1TimerNeeded { req_id });
                }
                return None;
            }
            NotEnough => return None,
        };
        pending.resolved = true;
        Some(ShardEvent::Phase1Resolved(Self::build_outcome(
            req_id, group, pending, decision, fast, equivocate,
        )))
    }

    fn build_outcome(
        req_id: u64,
        group: GroupId,
        pending: &PendingPhase1,
        decision: Decision,
        fast: bool,
        equivocate: bool,
    ) -> Phase1Outcome {
        let sigs = match decision {
            Decision::Commit => pending
                .sigs_by_result
                .get(&CcResult::Commit)
                .cloned()
                .unwrap_or_default(),
            Decision::Abort => {
                let mut sigs = pending
                    .sigs_by_result
                    .get(&CcResult::Abstain)
                    .cloned()
                    .unwrap_or_default();
                sigs.extend(
                    pending
                        .sigs_by_result
                        .get(&CcResult::Abort)
                        .cloned()
                        .unwrap_or_default(),
                );
                sigs
            }
        };
        Phase1Outcome {
            req_id,
            txn_digest: pending.txn_digest,
            group,
            decision,
            fast,
            equivocate,
            conflict: pending.conflict.clone(),
            sigs,
            abstain_conflicts: pending.abstain_conflicts.clone(),
        }
    }

    // ---- phase2 ----

    pub fn phase2(
        &mut self,
        req_id: u64,
        txn: &Transaction,
        decision: Decision,
        grouped_sigs: GroupedSigs,
    ) {
        let digest = txn.digest(self.config.hash_digest);
        self.pending_p2s.insert(
            req_id,
            PendingPhase2 {
                txn_digest: digest,
                sigs: HashMap::new(),
            },
        );
        let msg = |decision| {
            Message::Phase2(Phase2Msg {
                req_id,
                decision,
                txn_digest: digest,
                txn: Some(txn.clone()),
                grouped_sigs: grouped_sigs.clone(),
            })
        };
        if self.config.inject_failure == Some(InjectFailure::ClientEquivocate) {
            // Conflicting decisions to disjoint halves, to exercise fallback.
            let n = self.config.n();
            let flipped = match decision {
                Decision::Commit => Decision::Abort,
                Decision::Abort => Decision::Commit,
            };
            for idx in 0..n {
                let d = if idx < n / 2 { decision } else { flipped };
                self.net.send(
                    Address::Replica {
                        group: self.group,
                        idx,
                    },
                    msg(d),
                );
            }
        } else {
            self.broadcast(msg(decision));
        }
    }

    pub fn on_phase2_reply(&mut self, from: ProcessId, reply: Phase2Reply) -> Option<ShardEvent> {
        let payload = encode_payload(&reply.p2_decision);
        let pending = self.pending_p2s.get_mut(&reply.req_id)?;
        if reply.p2_decision.txn_digest != pending.txn_digest {
            return None;
        }
        if self.config.sign_messages {
            let ok = match &reply.signed_p2_decision {
                Some(sm) => {
                    sm.process_id == from
                        && sm.data == payload
                        && self.verifier.verify(sm)
                }
                None => false,
            };
            if !ok {
                tracing::warn!(from = from, "phase2 vote signature rejected");
                return None;
            }
        }
        let entry = pending
            .sigs
            .entry((reply.p2_decision.view, reply.p2_decision.decision))
            .or_default();
        if let Some(sm) = reply.signed_p2_decision.clone() {
            entry.insert(from, sm);
        } else {
            entry.insert(from, unsigned_marker(from, &payload));
        }
        if entry.len() < self.config.p2_quorum() {
            return None;
        }
        let sigs = entry.values().cloned().collect();
        let (view, decision) = (reply.p2_decision.view, reply.p2_decision.decision);
        let digest = pending.txn_digest;
        self.pending_p2s.remove(&reply.req_id);
        Some(ShardEvent::Phase2Resolved {
            req_id: reply.req_id,
            txn_digest: digest,
            decision,
            view,
            sigs,
        })
    }

    // ---- writeback and cancellation ----

    pub fn writeback(&self, wb: WritebackMsg) {
        self.broadcast(Message::Writeback(wb));
    }

    /// Erase per-request state; replies arriving later are stale.
    pub fn cancel(&mut self, req_id: u64) {
        self.pending_gets.remove(&req_id);
        self.pending_p1s.remove(&req_id);
        self.pending_p2s.remove(&req_id);
    }

    pub fn cancel_fallback(&mut self, digest: &TxnDigest) {
        self.pending_fbs.remove(digest);
        self.fb_req_ids.remove(digest);
    }

    // ---- fallback ----

    /// Begin driving someone else's stalled transaction.
    pub fn start_fallback(&mut self, req_id: u64, txn: Transaction) {
        let digest = txn.digest(self.config.hash_digest);
        if self.pending_fbs.contains_key(&digest) {
            return;
        }
        tracing::debug!(digest = %digest.short_hex(), "starting fallback");
        self.fb_req_ids.insert(digest, req_id);
        self.pending_fbs.insert(
            digest,
            PendingFB {
                txn: txn.clone(),
                p1: PendingPhase1::new(digest, &self.config, false),
                p2_by_view: HashMap::new(),
                p2_evidence: HashMap::new(),
                views: HashMap::new(),
                invoked_view: 0,
                sent_p2fb: false,
            },
        );
        self.broadcast(Message::Phase1FB(Phase1FB { req_id, txn }));
    }

    pub fn fallback_txn(&self, digest: &TxnDigest) -> Option<&Transaction> {
        self.pending_fbs.get(digest).map(|fb| &fb.txn)
    }

    fn record_view(&mut self, digest: &TxnDigest, from: ProcessId, view: u64, sig: Option<SignedMessage>) {
        let Some(fb) = self.pending_fbs.get_mut(digest) else {
            return;
        };
        let entry = fb.views.entry(from).or_insert((view, sig.clone()));
        if view >= entry.0 {
            *entry = (view, sig);
        }
    }

    pub fn on_send_view(&mut self, from: ProcessId, msg: SendView) {
        let view = msg.attached_view.current_view.current_view;
        if msg.attached_view.current_view.replica_id != from {
            return;
        }
        self.record_view(
            &msg.txn_digest,
            from,
            view,
            msg.attached_view.signed_current_view,
        );
    }

    pub fn on_phase1fb_reply(
        &mut self,
        from: ProcessId,
        reply: Phase1FBReply,
    ) -> Vec<ShardEvent> {
        let digest = reply.txn_digest;
        if !self.pending_fbs.contains_key(&digest) {
            return Vec::new();
        }
        let mut events = Vec::new();

        if reply.attached_view.current_view.replica_id == from {
            self.record_view(
                &digest,
                from,
                reply.attached_view.current_view.current_view,
                reply.attached_view.signed_current_view.clone(),
            );
        }

        if let Some(wb) = reply.wb {
            events.push(ShardEvent::Decided {
                txn_digest: digest,
                wb,
            });
            return events;
        }

        if let Some(p2r) = reply.p2r {
            if let Some(event) = self.feed_fb_p2(from, digest, &p2r) {
                events.push(event);
                return events;
            }
        }

        if let Some(p1r) = reply.p1r {
            if let Some(event) = self.feed_fb_p1(from, digest, p1r) {
                events.push(event);
            }
        }
        events
    }

    pub fn on_phase2fb_reply(
        &mut self,
        from: ProcessId,
        reply: Phase2FBReply,
    ) -> Option<ShardEvent> {
        let digest = reply.txn_digest;
        if !self.pending_fbs.contains_key(&digest) {
            return None;
        }
        if reply.attached_view.current_view.replica_id == from {
            self.record_view(
                &digest,
                from,
                reply.attached_view.current_view.current_view,
                reply.attached_view.signed_current_view.clone(),
            );
        }
        self.feed_fb_p2(from, digest, &reply.p2r)
    }

    pub fn on_forward_writeback(&mut self, msg: ForwardWriteback) -> Option<ShardEvent> {
        if !self.pending_fbs.contains_key(&msg.txn_digest) {
            return None;
        }
        Some(ShardEvent::Decided {
            txn_digest: msg.txn_digest,
            wb: msg.wb,
        })
    }

    fn feed_fb_p1(
        &mut self,
        from: ProcessId,
        digest: TxnDigest,
        reply: Phase1Reply,
    ) -> Option<ShardEvent> {
        let group = self.group;
        let sign = self.config.sign_messages;
        let payload = encode_payload(&reply.cc);
        let verifier = self.verifier.clone();
        let fb = self.pending_fbs.get_mut(&digest)?;
        let pending = &mut fb.p1;
        if reply.cc.involved_group != group
            || reply.cc.txn_digest != digest
            || pending.voted.contains_key(&from)
        {
            return None;
        }
        if sign {
            let ok = match &reply.signed_cc {
                Some(sm) => sm.process_id == from && sm.data == payload && verifier.verify(sm),
                None => false,
            };
            if !ok {
                return None;
            }
        }
        pending.voted.insert(from, ());
        if let Some(sm) = reply.signed_cc.clone() {
            pending
                .sigs_by_result
                .entry(reply.cc.result)
                .or_default()
                .push(sm);
        }
        let has_conflict = reply.committed_conflict.is_some();
        if has_conflict && pending.conflict.is_none() {
            pending.conflict = reply.committed_conflict.clone();
        }
        let state = pending.validator.process_vote(reply.cc.result, has_conflict);
        if !state.is_terminal() || pending.resolved {
            return None;
        }
        use Phase1ValidationState::*;
        let (decision, fast) = match state {
            FastCommit => (Decision::Commit, true),
            FastAbort | FastAbstain => (Decision::Abort, true),
            SlowCommitFinal => (Decision::Commit, false),
            SlowAbortFinal => (Decision::Abort, false),
            _ => return None,
        };
        pending.resolved = true;
        let req_id = self.fb_req_ids.get(&digest).copied().unwrap_or(0);
        let outcome = Self::build_outcome(req_id, group, pending, decision, fast, false);
        Some(ShardEvent::FallbackP1Resolved(outcome))
    }

    fn feed_fb_p2(
        &mut self,
        from: ProcessId,
        digest: TxnDigest,
        reply: &Phase2Reply,
    ) -> Option<ShardEvent> {
        let payload = encode_payload(&reply.p2_decision);
        if self.config.sign_messages {
            let ok = match &reply.signed_p2_decision {
                Some(sm) => sm.process_id == from && sm.data == payload && self.verifier.verify(sm),
                None => false,
            };
            if !ok {
                return None;
            }
        }
        let p2_quorum = self.config.p2_quorum();
        let fb = self.pending_fbs.get_mut(&digest)?;
        if reply.p2_decision.txn_digest != digest {
            return None;
        }
        let sm = reply
            .signed_p2_decision
            .clone()
            .unwrap_or_else(|| unsigned_marker(from, &payload));
        fb.p2_evidence
            .entry(reply.p2_decision.decision)
            .or_default()
            .insert(from, sm.clone());
        let entry = fb
            .p2_by_view
            .entry((reply.p2_decision.view, reply.p2_decision.decision))
            .or_default();
        entry.insert(from, sm);
        if entry.len() >= p2_quorum {
            let sigs = entry.values().cloned().collect();
            return Some(ShardEvent::FallbackP2Resolved {
                txn_digest: digest,
                decision: reply.p2_decision.decision,
                view: reply.p2_decision.view,
                sigs,
            });
        }
        None
    }

    /// Send a Phase2FB carrying the strongest decision evidence we hold.
    /// Returns false when no evidence is available yet.
    pub fn phase2fb(&mut self, digest: &TxnDigest, p1: Option<&Phase1Outcome>) -> bool {
        let req_id = self.fb_req_ids.get(digest).copied().unwrap_or(0);
        let evidence_quorum = self.config.p2_evidence_quorum();
        let Some(fb) = self.pending_fbs.get_mut(digest) else {
            return false;
        };
        if fb.sent_p2fb {
            return true;
        }

        let (decision, p1_sigs, p2_replies) = if let Some(outcome) = p1 {
            let mut grouped = GroupedSigs::new();
            grouped.insert(self.group, outcome.sigs.clone());
            (outcome.decision, Some(grouped), None)
        } else if let Some((decision, sigs)) = fb
            .p2_evidence
            .iter()
            .find(|(_, sigs)| sigs.len() >= evidence_quorum)
            .map(|(d, sigs)| (*d, sigs.values().cloned().collect::<Vec<_>>()))
        {
            (decision, None, Some(sigs))
        } else {
            return false;
        };

        fb.sent_p2fb = true;
        let msg = Message::Phase2FB(Phase2FB {
            req_id,
            txn_digest: *digest,
            txn: Some(fb.txn.clone()),
            decision,
            p1_sigs,
            p2_replies,
        });
        self.broadcast(msg);
        true
    }

    /// Propose the next view. Returns the proposed view, or None when the
    /// certificate table cannot justify a proposal yet.
    pub fn invoke_fallback(&mut self, digest: &TxnDigest) -> Option<u64> {
        let req_id = self.fb_req_ids.get(digest).copied().unwrap_or(0);
        let evidence_quorum = self.config.p2_evidence_quorum();
        let cert_quorum = self.config.view_cert_quorum();
        let catchup_quorum = self.config.catchup_cert_quorum();
        let fb = self.pending_fbs.get_mut(digest)?;

        let max_view = fb.views.values().map(|(v, _)| *v).max().unwrap_or(0);
        let proposed = max_view.max(fb.invoked_view) + 1;

        let certs_at = |min_view: u64| -> Vec<SignedMessage> {
            fb.views
                .values()
                .filter(|(v, sig)| *v >= min_view && sig.is_some())
                .map(|(_, sig)| sig.clone().expect("filtered"))
                .collect()
        };
        let normal = certs_at(proposed.saturating_sub(1));
        let catchup = certs_at(proposed);
        let (view_signed, catchup_flag) = if normal.len() >= cert_quorum {
            (normal, false)
        } else if catchup.len() >= catchup_quorum {
            (catchup, true)
        } else {
            return None;
        };

        // Replicas without a decision adopt one from the embedded Phase2FB.
        let p2fb = fb
            .p2_evidence
            .iter()
            .find(|(_, sigs)| sigs.len() >= evidence_quorum)
            .map(|(decision, sigs)| Phase2FB {
                req_id,
                txn_digest: *digest,
                txn: Some(fb.txn.clone()),
                decision: *decision,
                p1_sigs: None,
                p2_replies: Some(sigs.values().cloned().collect()),
            });

        fb.invoked_view = proposed;
        let msg = Message::InvokeFB(InvokeFB {
            req_id,
            txn_digest: *digest,
            p2fb,
            proposed_view: proposed,
            view_signed,
            catchup: catchup_flag,
        });
        tracing::debug!(digest = %digest.short_hex(), view = proposed, "invoking fallback");
        self.broadcast(msg);
        Some(proposed)
    }

    pub fn client_id(&self) -> ProcessId {
        self.client_id
    }

    pub fn group(&self) -> GroupId {
        self.group
    }
}

/// Placeholder signature entry for unsigned configurations, where quorums
/// are counted but not cryptographically checked.
fn unsigned_marker(from: ProcessId, payload: &[u8]) -> SignedMessage {
    SignedMessage {
        process_id: from,
        data: payload.to_vec(),
        sig: palisade_crypto::Sig::Plain(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use ed25519_dalek::SigningKey;
    use palisade_crypto::KeyManager;
    use palisade_engine::engine::{CcVote, Transaction, WriteSetEntry};
    use rand::rngs::OsRng;

    use super::*;

    struct NullNet;

    impl Network for NullNet {
        fn send(&self, _to: Address, _msg: Message) {}
    }

    fn shard() -> ShardClient {
        let config = Arc::new(Config {
            sign_messages: false,
            validate_proofs: false,
            verify_deps: false,
            ..Config::default()
        });
        let sk = SigningKey::generate(&mut OsRng);
        let keys = Arc::new(KeyManager::new(0, sk, StdHashMap::new()));
        ShardClient::new(
            config.clone(),
            0,
            config.first_client_id(),
            Verifier::new(keys),
            Arc::new(NullNet),
        )
    }

    fn txn() -> Transaction {
        let mut t = Transaction {
            client_id: 99,
            client_seq_num: 1,
            timestamp: Timestamp::new(10, 99),
            read_set: Vec::new(),
            write_set: vec![WriteSetEntry {
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            }],
            involved_groups: vec![0],
            deps: Vec::new(),
        };
        t.canonicalize();
        t
    }

    fn vote(req_id: u64, digest: TxnDigest, result: CcResult) -> Phase1Reply {
        Phase1Reply {
            req_id,
            cc: CcVote {
                result,
                txn_digest: digest,
                involved_group: 0,
            },
            signed_cc: None,
            committed_conflict: None,
            abstain_conflict: None,
        }
    }

    #[test]
    fn tentative_phase1_requests_timer_then_timeout_resolves_slow() {
        let mut shard = shard();
        let txn = txn();
        let digest = txn.digest(true);
        shard.phase1(7, &txn);

        assert!(shard.on_phase1_reply(0, vote(7, digest, CcResult::Abstain)).is_none());
        assert!(shard.on_phase1_reply(1, vote(7, digest, CcResult::Commit)).is_none());
        let event = shard.on_phase1_reply(2, vote(7, digest, CcResult::Commit));
        assert!(matches!(
            event,
            Some(ShardEvent::Phase1TimerNeeded { req_id: 7 })
        ));

        let event = shard.on_phase1_timeout(7).expect("timeout resolves");
        match event {
            ShardEvent::Phase1Resolved(outcome) => {
                assert_eq!(outcome.decision, Decision::Commit);
                assert!(!outcome.fast);
                assert_eq!(outcome.txn_digest, digest);
            }
            other => panic!("unexpected event {other:?}"),
        }
        // The entry is erased: later replies are stale.
        assert!(shard.on_phase1_reply(3, vote(7, digest, CcResult::Commit)).is_none());
    }

    #[test]
    fn duplicate_votes_from_one_replica_are_ignored() {
        let mut shard = shard();
        let txn = txn();
        let digest = txn.digest(true);
        shard.phase1(9, &txn);
        assert!(shard.on_phase1_reply(0, vote(9, digest, CcResult::Commit)).is_none());
        // Replaying replica 0's vote must not complete the fast quorum.
        assert!(shard.on_phase1_reply(0, vote(9, digest, CcResult::Commit)).is_none());
        let event = shard.on_phase1_reply(1, vote(9, digest, CcResult::Commit));
        assert!(matches!(event, Some(ShardEvent::Phase1Resolved(_))));
    }
}
