//! Client-driven view-change fallback.
//!
//! Any interested client can drive a stalled transaction to a decision: it
//! collects replica state with Phase1FB/Phase2FB, proposes view v+1 with
//! InvokeFB carrying signed current-view certificates, replicas vote ElectFB
//! to the deterministic leader of the proposed view, and the leader's
//! DecisionFB (2f+1 matching votes) installs the decision at that view.
//! MoveView amplification keeps correct replicas' views converging.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use palisade_crypto::ProcessId;

use super::messages::{
    decode_payload, encode_payload, AttachedView, CcVote, CurrentView, DecisionFB, ElectFB,
    ElectMessage, InvokeFB, Message, MoveViewMsg, Phase1FB, Phase1FBReply, Phase1Reply, Phase2FB,
    Phase2FBReply, Phase2Reply, SendView,
};
use super::proofs;
use super::replica::Replica;
use super::state::P2Meta;
use super::types::{Address, CcResult, CommittedProof, Decision, TxnDigest};

impl Replica {
    /// Signed statement of this replica's current view on `digest`.
    pub(super) fn make_attached_view(&self, digest: &TxnDigest) -> AttachedView {
        let current_view = CurrentView {
            txn_digest: *digest,
            current_view: self.state.current_view(digest),
            replica_id: self.id,
        };
        let signed_current_view = self
            .config
            .sign_messages
            .then(|| self.vote_signer.sign_now(encode_payload(&current_view)));
        AttachedView {
            current_view,
            signed_current_view,
        }
    }

    /// Build a signed Phase1 reply for fallback envelopes. Fallback replies
    /// are signed synchronously; they are rare and latency-bound.
    fn build_p1_reply(
        &self,
        req_id: u64,
        digest: &TxnDigest,
        result: CcResult,
        conflict: Option<Arc<CommittedProof>>,
        abstain_conflict: Option<TxnDigest>,
    ) -> Phase1Reply {
        let cc = CcVote {
            result,
            txn_digest: *digest,
            involved_group: self.group,
        };
        let signed_cc = self
            .config
            .sign_messages
            .then(|| self.vote_signer.sign_now(encode_payload(&cc)));
        Phase1Reply {
            req_id,
            cc,
            signed_cc,
            committed_conflict: conflict.map(|p| (*p).clone()),
            abstain_conflict,
        }
    }

    fn build_p2_reply(
        &self,
        req_id: u64,
        digest: &TxnDigest,
        decision: Decision,
        view: u64,
    ) -> Phase2Reply {
        let p2_decision = super::messages::Phase2Decision {
            txn_digest: *digest,
            decision,
            view,
            involved_group: self.group,
        };
        let signed_p2_decision = self
            .config
            .sign_messages
            .then(|| self.vote_signer.sign_now(encode_payload(&p2_decision)));
        Phase2Reply {
            req_id,
            p2_decision,
            signed_p2_decision,
        }
    }

    fn stored_p1_components(
        &self,
        digest: &TxnDigest,
    ) -> (
        Option<CcResult>,
        Option<Arc<CommittedProof>>,
        Option<TxnDigest>,
    ) {
        let result = self.state.p1_decisions.get(digest).map(|e| *e);
        let conflict = self.state.p1_conflicts.get(digest).map(|e| e.value().clone());
        let abstain = self.state.p1_abstain_conflicts.get(digest).map(|e| *e);
        (result, conflict, abstain)
    }

    /// Push a delayed Phase1 result to every interested fallback client.
    pub(super) fn notify_interested_p1(&self, digest: TxnDigest, result: CcResult) {
        let interested: Vec<ProcessId> = match self.state.interested_clients.get(&digest) {
            Some(entry) => entry.iter().copied().collect(),
            None => return,
        };
        if interested.is_empty() {
            return;
        }
        if self.state.is_decided(&digest) {
            self.forward_writeback_multi(&digest);
            return;
        }
        let (_, conflict, abstain) = self.stored_p1_components(&digest);
        for client in interested {
            let reply = Phase1FBReply {
                req_id: 0,
                txn_digest: digest,
                wb: None,
                p1r: Some(self.build_p1_reply(0, &digest, result, conflict.clone(), abstain)),
                p2r: self
                    .state
                    .p2_meta
                    .get(&digest)
                    .map(|m| self.build_p2_reply(0, &digest, m.decision, m.decision_view)),
                attached_view: self.make_attached_view(&digest),
            };
            self.net
                .send(Address::Client(client), Message::Phase1FBReply(reply));
        }
    }

    /// "Tell me what you know about this transaction."
    pub(super) fn handle_phase1fb(self: &Arc<Self>, client: ProcessId, msg: Phase1FB) {
        let mut txn = msg.txn;
        txn.canonicalize();
        let digest = txn.digest(self.config.hash_digest);
        tracing::debug!(digest = %digest.short_hex(), client = client, "phase1fb");

        // Decided: the stored writeback answers everything.
        if self.forward_writeback(client, msg.req_id, &digest) {
            return;
        }

        self.state
            .interested_clients
            .entry(digest)
            .or_default()
            .insert(client);

        let (p1, conflict, abstain) = self.stored_p1_components(&digest);
        let p2 = self
            .state
            .p2_meta
            .get(&digest)
            .map(|m| (m.decision, m.decision_view));

        match (p1, p2) {
            (Some(p1), Some((decision, view))) => {
                let p1r = (p1 != CcResult::Wait)
                    .then(|| self.build_p1_reply(msg.req_id, &digest, p1, conflict, abstain));
                let reply = Phase1FBReply {
                    req_id: msg.req_id,
                    txn_digest: digest,
                    wb: None,
                    p1r,
                    p2r: Some(self.build_p2_reply(msg.req_id, &digest, decision, view)),
                    attached_view: self.make_attached_view(&digest),
                };
                self.net
                    .send(Address::Client(client), Message::Phase1FBReply(reply));
            }
            (Some(p1), None) => {
                if p1 == CcResult::Wait {
                    // Nothing to report yet; the dependency resolution path
                    // will notify this now-interested client.
                    return;
                }
                let reply = Phase1FBReply {
                    req_id: msg.req_id,
                    txn_digest: digest,
                    wb: None,
                    p1r: Some(self.build_p1_reply(msg.req_id, &digest, p1, conflict, abstain)),
                    p2r: None,
                    attached_view: self.make_attached_view(&digest),
                };
                self.net
                    .send(Address::Client(client), Message::Phase1FBReply(reply));
            }
            (None, Some((decision, view))) => {
                let reply = Phase1FBReply {
                    req_id: msg.req_id,
                    txn_digest: digest,
                    wb: None,
                    p1r: None,
                    p2r: Some(self.build_p2_reply(msg.req_id, &digest, decision, view)),
                    attached_view: self.make_attached_view(&digest),
                };
                self.net
                    .send(Address::Client(client), Message::Phase1FBReply(reply));
            }
            (None, None) => {
                // No state: execute Phase1 ourselves on the fallback flow.
                if self.config.validate_proofs
                    && self.config.sign_messages
                    && self.config.verify_deps
                {
                    for dep in &txn.deps {
                        if !proofs::validate_dependency(&self.config, &self.verifier, dep) {
                            self.stats.invalid_proofs.fetch_add(1, Ordering::Relaxed);
                            return;
                        }
                    }
                }
                let txn = Arc::new(txn);
                self.state.current_views.entry(digest).or_insert(0);
                self.state.ongoing.entry(digest).or_insert_with(|| txn.clone());
                let result = self.run_cc_check(msg.req_id, client, digest, txn, true);
                if result == CcResult::Wait {
                    // Depth-bounded chains make this rare; the dependency
                    // resolver will fan out to interested clients.
                    return;
                }
                let (_, conflict, abstain) = self.stored_p1_components(&digest);
                let reply = Phase1FBReply {
                    req_id: msg.req_id,
                    txn_digest: digest,
                    wb: None,
                    p1r: Some(self.build_p1_reply(msg.req_id, &digest, result, conflict, abstain)),
                    p2r: None,
                    attached_view: self.make_attached_view(&digest),
                };
                self.net
                    .send(Address::Client(client), Message::Phase1FBReply(reply));
            }
        }
    }

    /// Adopt or report a Phase2 decision on behalf of a fallback client.
    pub(super) fn handle_phase2fb(self: &Arc<Self>, client: ProcessId, msg: Phase2FB) {
        let digest = msg.txn_digest;
        if self.forward_writeback(client, msg.req_id, &digest) {
            return;
        }
        self.state
            .interested_clients
            .entry(digest)
            .or_default()
            .insert(client);

        if let Some((decision, view)) = self
            .state
            .p2_meta
            .get(&digest)
            .map(|m| (m.decision, m.decision_view))
        {
            let reply = Phase2FBReply {
                req_id: msg.req_id,
                txn_digest: digest,
                p2r: self.build_p2_reply(msg.req_id, &digest, decision, view),
                attached_view: self.make_attached_view(&digest),
            };
            self.net
                .send(Address::Client(client), Message::Phase2FBReply(reply));
            return;
        }

        let Some(txn) = self.resolve_txn(&digest, msg.txn.clone()) else {
            self.stats.dep_missing.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let log_group = self.config.log_group(&digest, &txn);
        if log_group != self.group {
            return;
        }

        if self.config.validate_proofs {
            let valid = if let Some(p2_replies) = &msg.p2_replies {
                proofs::validate_p2_evidence(
                    &self.config,
                    &self.verifier,
                    &digest,
                    msg.decision,
                    log_group,
                    p2_replies,
                )
            } else if let Some(p1_sigs) = &msg.p1_sigs {
                proofs::validate_p1_quorum(
                    &self.config,
                    &self.verifier,
                    msg.decision,
                    &txn,
                    &digest,
                    p1_sigs,
                )
            } else {
                false
            };
            if !valid {
                self.stats.invalid_proofs.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(digest = %digest.short_hex(), "phase2fb evidence failed validation");
                return;
            }
        }

        self.state.p2_meta.entry(digest).or_insert_with(|| P2Meta {
            decision: msg.decision,
            decision_view: 0,
            has_p2: true,
            original_client: None,
        });
        self.state.current_views.entry(digest).or_insert(0);
        let (decision, view) = self
            .state
            .p2_meta
            .get(&digest)
            .map(|m| (m.decision, m.decision_view))
            .expect("just installed");
        let reply = Phase2FBReply {
            req_id: msg.req_id,
            txn_digest: digest,
            p2r: self.build_p2_reply(msg.req_id, &digest, decision, view),
            attached_view: self.make_attached_view(&digest),
        };
        self.net
            .send(Address::Client(client), Message::Phase2FBReply(reply));
    }

    /// Vote for a proposed view if the certificates justify it.
    pub(super) fn handle_invoke_fb(self: &Arc<Self>, client: ProcessId, msg: InvokeFB) {
        if self.config.no_fallback {
            return;
        }
        let digest = msg.txn_digest;
        let current = self.state.current_view(&digest);
        if msg.proposed_view <= current {
            // Obsolete proposal; help the client rebuild its certificate set.
            self.net.send(
                Address::Client(client),
                Message::SendView(SendView {
                    txn_digest: digest,
                    attached_view: self.make_attached_view(&digest),
                }),
            );
            return;
        }

        let body = msg.p2fb.as_ref().and_then(|p| p.txn.clone());
        let Some(txn) = self.resolve_txn(&digest, body) else {
            // Never seen this transaction and the message carries no body.
            return;
        };
        let log_group = self.config.log_group(&digest, &txn);
        if log_group != self.group {
            return;
        }

        // A decision is a precondition for electing: adopt one from the
        // embedded Phase2FB if we have none.
        if !self.state.p2_meta.contains_key(&digest) {
            if let Some(p2fb) = msg.p2fb.clone() {
                self.handle_phase2fb(client, p2fb);
            }
            if !self.state.p2_meta.contains_key(&digest) {
                return;
            }
        }

        if self.state.current_view(&digest) >= msg.proposed_view {
            return;
        }

        if !proofs::validate_view_certs(
            &self.config,
            &self.verifier,
            &digest,
            msg.proposed_view,
            msg.catchup,
            log_group,
            &msg.view_signed,
        ) {
            self.stats.invalid_proofs.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(digest = %digest.short_hex(), "invokefb view certificates failed validation");
            return;
        }

        // Vote at most once per view: adopting the proposed view here makes
        // a second vote in it impossible.
        self.state.current_views.insert(digest, msg.proposed_view);

        let decision = self
            .state
            .p2_meta
            .get(&digest)
            .map(|m| m.decision)
            .expect("decision checked above");
        let elect = ElectMessage {
            req_id: msg.req_id,
            txn_digest: digest,
            decision,
            view: msg.proposed_view,
        };
        let signed = self.vote_signer.sign_now(encode_payload(&elect));
        let leader = self.config.leader_for(msg.proposed_view, &digest);
        self.stats.elect_votes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            digest = %digest.short_hex(),
            view = msg.proposed_view,
            leader = leader,
            decision = ?decision,
            "electfb vote"
        );
        self.net.send(
            Address::Replica {
                group: log_group,
                idx: leader,
            },
            Message::ElectFB(ElectFB {
                signed_elect_fb: signed,
            }),
        );

        if self.config.all_to_all_fb {
            self.net.broadcast_group(
                self.group,
                self.config.n(),
                Message::MoveView(MoveViewMsg {
                    txn_digest: digest,
                    view: msg.proposed_view,
                }),
            );
        }
    }

    /// Leader-side ElectFB collection; emits a DecisionFB at 2f+1 matching
    /// (view, decision) votes, once per view.
    pub(super) fn handle_elect_fb(self: &Arc<Self>, msg: ElectFB) {
        let Some(elect) = decode_payload::<ElectMessage>(&msg.signed_elect_fb.data) else {
            return;
        };
        let digest = elect.txn_digest;
        if self.idx != self.config.leader_for(elect.view, &digest) {
            return;
        }
        if proofs::replica_group_of(&self.config, msg.signed_elect_fb.process_id)
            != Some(self.group)
        {
            return;
        }
        if self.config.sign_messages && !self.verifier.verify(&msg.signed_elect_fb) {
            self.stats.invalid_proofs.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let emit = {
            let mut entry = self.state.elect.entry(digest).or_default();
            let st = entry.value_mut();
            if st.view > elect.view {
                return;
            }
            if st.view < elect.view {
                st.view = elect.view;
                st.voted.clear();
                st.commit_sigs.clear();
                st.abort_sigs.clear();
            }
            if !st.voted.insert(msg.signed_elect_fb.process_id) {
                return;
            }
            match elect.decision {
                Decision::Commit => st.commit_sigs.push(msg.signed_elect_fb.clone()),
                Decision::Abort => st.abort_sigs.push(msg.signed_elect_fb.clone()),
            }
            if st.emitted_views.contains(&elect.view) {
                return;
            }
            let quorum = self.config.elect_quorum();
            let chosen = if st.commit_sigs.len() >= quorum {
                Some((Decision::Commit, st.commit_sigs.clone()))
            } else if st.abort_sigs.len() >= quorum {
                Some((Decision::Abort, st.abort_sigs.clone()))
            } else {
                None
            };
            if chosen.is_some() {
                st.emitted_views.insert(elect.view);
            }
            chosen
        };

        let Some((decision, elect_sigs)) = emit else {
            return;
        };
        self.stats.fallback_decisions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            digest = %digest.short_hex(),
            view = elect.view,
            decision = ?decision,
            "decisionfb emitted"
        );
        self.net.broadcast_group(
            self.group,
            self.config.n(),
            Message::DecisionFB(DecisionFB {
                req_id: elect.req_id,
                txn_digest: digest,
                decision,
                view: elect.view,
                elect_sigs,
            }),
        );
    }

    /// Adopt a leader's decision when its ElectFB quorum checks out.
    pub(super) fn handle_decision_fb(self: &Arc<Self>, msg: DecisionFB) {
        let digest = msg.txn_digest;
        if self.state.current_view(&digest) > msg.view {
            self.stats.stale_messages.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if !proofs::validate_elect_quorum(
            &self.config,
            &self.verifier,
            &digest,
            msg.view,
            msg.decision,
            self.group,
            &msg.elect_sigs,
        ) {
            self.stats.invalid_proofs.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(digest = %digest.short_hex(), "decisionfb quorum failed validation");
            return;
        }

        {
            let mut meta = self.state.p2_meta.entry(digest).or_insert_with(|| P2Meta {
                decision: msg.decision,
                decision_view: msg.view,
                has_p2: true,
                original_client: None,
            });
            let value = meta.value_mut();
            // The decision may only change when the view strictly increases.
            if value.decision_view < msg.view || !value.has_p2 {
                value.decision = msg.decision;
                value.decision_view = msg.view;
                value.has_p2 = true;
            }
        }
        {
            let mut cv = self.state.current_views.entry(digest).or_insert(0);
            if *cv < msg.view {
                *cv = msg.view;
            }
        }

        let (decision, view) = self
            .state
            .p2_meta
            .get(&digest)
            .map(|m| (m.decision, m.decision_view))
            .expect("just installed");
        let interested: Vec<ProcessId> = self
            .state
            .interested_clients
            .get(&digest)
            .map(|e| e.iter().copied().collect())
            .unwrap_or_default();
        for client in interested {
            let reply = Phase2FBReply {
                req_id: msg.req_id,
                txn_digest: digest,
                p2r: self.build_p2_reply(msg.req_id, &digest, decision, view),
                attached_view: self.make_attached_view(&digest),
            };
            self.net
                .send(Address::Client(client), Message::Phase2FBReply(reply));
        }
    }

    /// All-to-all view amplification: f+1 proposals re-broadcast, 2f+1 adopt.
    pub(super) fn handle_move_view(self: &Arc<Self>, from: Address, msg: MoveViewMsg) {
        let from_pid = match from {
            Address::Replica { group, idx } if group == self.group => {
                self.config.replica_process_id(group, idx)
            }
            _ => return,
        };
        let digest = msg.txn_digest;
        let (count, rebroadcast) = {
            let mut entry = self
                .state
                .move_views
                .entry((digest, msg.view))
                .or_default();
            let st = entry.value_mut();
            if !st.proposers.insert(from_pid) {
                return;
            }
            let count = st.proposers.len();
            let rebroadcast = count >= self.config.move_view_broadcast() && !st.broadcast;
            if rebroadcast {
                st.broadcast = true;
            }
            (count, rebroadcast)
        };
        if rebroadcast {
            self.net.broadcast_group(
                self.group,
                self.config.n(),
                Message::MoveView(MoveViewMsg {
                    txn_digest: digest,
                    view: msg.view,
                }),
            );
        }
        if count >= self.config.move_view_adopt() {
            let mut cv = self.state.current_views.entry(digest).or_insert(0);
            if *cv < msg.view {
                *cv = msg.view;
            }
        }
    }
}
