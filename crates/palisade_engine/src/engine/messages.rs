//! Wire records for the transaction protocol.
//!
//! Serialization and framing are external collaborators; these are the
//! payload shapes. Signed fields carry [`SignedMessage`] envelopes whose
//! `data` is the bincode encoding of the corresponding payload record, so
//! verification never depends on the outer message framing.

use palisade_crypto::SignedMessage;
use serde::{Deserialize, Serialize};

use super::types::{
    CcResult, CommittedProof, Decision, GroupId, GroupedSigs, Key, Timestamp, Transaction,
    TxnDigest, Value,
};

/// Client read of one key at a chosen timestamp.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadMsg {
    pub req_id: u64,
    pub key: Key,
    pub timestamp: Timestamp,
}

/// Committed and optional prepared version returned by a read.
///
/// This record is the signing payload for read replies; dependency proofs
/// embed the same signed bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRecord {
    pub key: Key,
    pub committed_value: Option<Value>,
    pub committed_timestamp: Option<Timestamp>,
    pub prepared_value: Option<Value>,
    pub prepared_timestamp: Option<Timestamp>,
    pub prepared_txn_digest: Option<TxnDigest>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadReply {
    pub req_id: u64,
    pub key: Key,
    pub write: WriteRecord,
    pub proof: Option<CommittedProof>,
    pub signed_write: Option<SignedMessage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Phase1Msg {
    pub req_id: u64,
    pub txn: Transaction,
    pub replica_gossip: bool,
    pub crash_failure: bool,
}

/// Phase1 vote; the signing payload excludes the conflict because a
/// committed conflict is self-authenticating.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CcVote {
    pub result: CcResult,
    pub txn_digest: TxnDigest,
    pub involved_group: GroupId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Phase1Reply {
    pub req_id: u64,
    pub cc: CcVote,
    pub signed_cc: Option<SignedMessage>,
    pub committed_conflict: Option<CommittedProof>,
    /// Digest of a prepared write the check abstained on, for diagnostics
    /// and fallback targeting.
    pub abstain_conflict: Option<TxnDigest>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Phase2Msg {
    pub req_id: u64,
    pub decision: Decision,
    pub txn_digest: TxnDigest,
    pub txn: Option<Transaction>,
    /// f+1 matching Phase1 votes per involved group (the slow proof).
    pub grouped_sigs: GroupedSigs,
}

/// Phase2 vote payload signed by each replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase2Decision {
    pub txn_digest: TxnDigest,
    pub decision: Decision,
    pub view: u64,
    pub involved_group: GroupId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Phase2Reply {
    pub req_id: u64,
    pub p2_decision: Phase2Decision,
    pub signed_p2_decision: Option<SignedMessage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WritebackMsg {
    pub decision: Decision,
    pub txn_digest: TxnDigest,
    pub txn: Option<Transaction>,
    pub p1_sigs: Option<GroupedSigs>,
    pub p2_sigs: Option<GroupedSigs>,
    pub p2_view: Option<u64>,
    /// Committed conflict justifying a fast abort.
    pub conflict: Option<CommittedProof>,
}

/// MAC'd payload of a client stale-read cleanup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AbortInternal {
    pub timestamp: Timestamp,
    pub read_set: Vec<Key>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AbortMsg {
    pub client_id: u64,
    pub internal: AbortInternal,
    pub mac: Option<[u8; 32]>,
}

/// Server → stuck client: the stalled dependency's full record so the
/// client can drive fallback on it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayP1 {
    /// Request id of the dependent transaction that is waiting.
    pub dependent_req_id: u64,
    pub txn_digest: TxnDigest,
    pub txn: Transaction,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Phase1FB {
    pub req_id: u64,
    pub txn: Transaction,
}

/// Signed view statement attached to fallback replies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentView {
    pub txn_digest: TxnDigest,
    pub current_view: u64,
    pub replica_id: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttachedView {
    pub current_view: CurrentView,
    pub signed_current_view: Option<SignedMessage>,
}

/// Everything a replica knows about a digest, for fallback catch-up.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Phase1FBReply {
    pub req_id: u64,
    pub txn_digest: TxnDigest,
    pub wb: Option<WritebackMsg>,
    pub p1r: Option<Phase1Reply>,
    pub p2r: Option<Phase2Reply>,
    pub attached_view: AttachedView,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Phase2FB {
    pub req_id: u64,
    pub txn_digest: TxnDigest,
    pub txn: Option<Transaction>,
    pub decision: Decision,
    /// Phase1 slow proof, if the fallback client assembled one.
    pub p1_sigs: Option<GroupedSigs>,
    /// f+1 matching stored-P2 replies proving a decision exists.
    pub p2_replies: Option<Vec<SignedMessage>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Phase2FBReply {
    pub req_id: u64,
    pub txn_digest: TxnDigest,
    pub p2r: Phase2Reply,
    pub attached_view: AttachedView,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvokeFB {
    pub req_id: u64,
    pub txn_digest: TxnDigest,
    pub p2fb: Option<Phase2FB>,
    pub proposed_view: u64,
    /// Signed current-view certificates: 3f+1, or f+1 with `catchup`.
    pub view_signed: Vec<SignedMessage>,
    pub catchup: bool,
}

/// Payload of an ElectFB vote; binds (digest, view, decision) together.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectMessage {
    pub req_id: u64,
    pub txn_digest: TxnDigest,
    pub decision: Decision,
    pub view: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElectFB {
    pub signed_elect_fb: SignedMessage,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DecisionFB {
    pub req_id: u64,
    pub txn_digest: TxnDigest,
    pub decision: Decision,
    pub view: u64,
    /// 2f+1 ElectFB signatures for (view, decision).
    pub elect_sigs: Vec<SignedMessage>,
}

/// Replica → client: current view on a digest, for InvokeFB quorums.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SendView {
    pub txn_digest: TxnDigest,
    pub attached_view: AttachedView,
}

/// Replica → replica view amplification.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MoveViewMsg {
    pub txn_digest: TxnDigest,
    pub view: u64,
}

/// Stored final outcome replayed to stragglers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardWriteback {
    pub req_id: u64,
    pub txn_digest: TxnDigest,
    pub wb: WritebackMsg,
}

/// Every protocol message, as routed by the transport layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    Read(ReadMsg),
    ReadReply(ReadReply),
    Phase1(Phase1Msg),
    Phase1Reply(Phase1Reply),
    Phase2(Phase2Msg),
    Phase2Reply(Phase2Reply),
    Writeback(WritebackMsg),
    Abort(AbortMsg),
    RelayP1(RelayP1),
    Phase1FB(Phase1FB),
    Phase1FBReply(Phase1FBReply),
    Phase2FB(Phase2FB),
    Phase2FBReply(Phase2FBReply),
    InvokeFB(InvokeFB),
    ElectFB(ElectFB),
    DecisionFB(DecisionFB),
    SendView(SendView),
    MoveView(MoveViewMsg),
    ForwardWriteback(ForwardWriteback),
}

/// Canonical signing payload helpers.
pub fn encode_payload<T: Serialize>(payload: &T) -> Vec<u8> {
    bincode::serialize(payload).expect("payload records always serialize")
}

pub fn decode_payload<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Option<T> {
    bincode::deserialize(bytes).ok()
}
