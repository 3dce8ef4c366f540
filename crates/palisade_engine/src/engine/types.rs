//! Shared data model and configuration for the transaction engine.
//!
//! These types are used by the replica engine, the shard client, and the
//! proof validation paths, so they stay dependency-light: serde records,
//! the digest computation, and the quorum arithmetic.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use palisade_crypto::{ProcessId, SignedMessage};
use serde::{Deserialize, Serialize};

use super::messages::Message;

/// Logical identifier for a replica group (shard).
pub type GroupId = u64;
/// Replica index within a group, in `0..n`.
pub type ReplicaIdx = u64;
pub type Key = Vec<u8>;
pub type Value = Vec<u8>;

/// Logical transaction timestamp: wall-clock milliseconds tie-broken by
/// client id. Ordering is lexicographic.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub ms: u64,
    pub id: u64,
}

impl Timestamp {
    pub const fn new(ms: u64, id: u64) -> Self {
        Self { ms, id }
    }

    pub const fn zero() -> Self {
        Self { ms: 0, id: 0 }
    }
}

/// 256-bit transaction digest; the unique identity of a transaction.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnDigest(pub [u8; 32]);

impl TxnDigest {
    /// First digest byte, used for deterministic leader rotation.
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }

    pub fn short_hex(&self) -> String {
        self.0[..8].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for TxnDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxnDigest({})", self.short_hex())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadSetEntry {
    pub key: Key,
    /// Version (commit timestamp) the read observed.
    pub read_time: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSetEntry {
    pub key: Key,
    pub value: Value,
}

/// A read of a prepared (not yet committed) write from another transaction.
///
/// `write_sigs` carries f+1 signed read-reply write records from the dep's
/// group proving the value was really prepared there.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dependency {
    pub write_digest: TxnDigest,
    pub prepared_timestamp: Timestamp,
    pub involved_group: GroupId,
    pub write_sigs: Vec<SignedMessage>,
}

/// Interactive transaction record as submitted at Phase1.
///
/// Multiset fields are kept sorted so the canonical encoding (and therefore
/// the digest) is stable under client-side reordering.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub client_id: u64,
    pub client_seq_num: u64,
    pub timestamp: Timestamp,
    pub read_set: Vec<ReadSetEntry>,
    pub write_set: Vec<WriteSetEntry>,
    pub involved_groups: Vec<GroupId>,
    pub deps: Vec<Dependency>,
}

impl Transaction {
    /// Sort the multiset fields into canonical order.
    pub fn canonicalize(&mut self) {
        self.read_set.sort_by(|a, b| a.key.cmp(&b.key));
        self.write_set.sort_by(|a, b| a.key.cmp(&b.key));
        self.involved_groups.sort_unstable();
        self.involved_groups.dedup();
        self.deps.sort_by(|a, b| a.write_digest.cmp(&b.write_digest));
    }

    /// Compute the transaction digest.
    ///
    /// With `hash_digest` the canonical field concatenation is hashed with a
    /// fixed 256-bit hash; otherwise a structural identity (client id and
    /// sequence number) is packed directly, which is cheaper but only unique
    /// per honest client.
    pub fn digest(&self, hash_digest: bool) -> TxnDigest {
        if !hash_digest {
            let mut out = [0u8; 32];
            out[..8].copy_from_slice(&self.client_id.to_be_bytes());
            out[8..16].copy_from_slice(&self.client_seq_num.to_be_bytes());
            return TxnDigest(out);
        }
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.client_id.to_be_bytes());
        hasher.update(&self.client_seq_num.to_be_bytes());
        hasher.update(&self.timestamp.ms.to_be_bytes());
        hasher.update(&self.timestamp.id.to_be_bytes());
        let mut reads: Vec<_> = self
            .read_set
            .iter()
            .map(|r| (r.key.clone(), r.read_time))
            .collect();
        reads.sort();
        for (key, rt) in reads {
            hasher.update(&key);
            hasher.update(&rt.ms.to_be_bytes());
            hasher.update(&rt.id.to_be_bytes());
        }
        let mut writes: Vec<_> = self
            .write_set
            .iter()
            .map(|w| (w.key.clone(), w.value.clone()))
            .collect();
        writes.sort();
        for (key, value) in writes {
            hasher.update(&key);
            hasher.update(&value);
        }
        let mut groups = self.involved_groups.clone();
        groups.sort_unstable();
        for g in groups {
            hasher.update(&g.to_be_bytes());
        }
        let mut deps: Vec<_> = self
            .deps
            .iter()
            .map(|d| (d.write_digest, d.prepared_timestamp))
            .collect();
        deps.sort();
        for (digest, ts) in deps {
            hasher.update(&digest.0);
            hasher.update(&ts.ms.to_be_bytes());
            hasher.update(&ts.id.to_be_bytes());
        }
        TxnDigest(*hasher.finalize().as_bytes())
    }

    pub fn has_key_in_read_set(&self, key: &[u8]) -> Option<Timestamp> {
        self.read_set
            .iter()
            .find(|r| r.key == key)
            .map(|r| r.read_time)
    }

    pub fn depends_on(&self, digest: &TxnDigest) -> bool {
        self.deps.iter().any(|d| &d.write_digest == digest)
    }
}

/// Outcome of a concurrency-control check; also the vote carried in Phase1
/// replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CcResult {
    Commit,
    Abstain,
    Abort,
    Wait,
}

/// Final commit decision carried by Phase2 and Writeback.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    Commit,
    Abort,
}

/// Signatures grouped by the replica group that produced them.
pub type GroupedSigs = BTreeMap<GroupId, Vec<SignedMessage>>;

/// Self-authenticating commit proof attached to every committed version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommittedProof {
    pub txn: Transaction,
    pub sigs: ProofSigs,
}

/// Quorum evidence inside a committed proof: f+1 matching Phase1 votes per
/// involved group (fast path), 3f+1 Phase2 votes from one view (slow path),
/// or none for values loaded at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ProofSigs {
    Phase1(GroupedSigs),
    Phase2 { sigs: GroupedSigs, view: u64 },
    Genesis,
}

/// Concurrency-control flavor; unknown values are a boot-time fatal error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OccType {
    Mvtso,
    Tapir,
}

impl OccType {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "mvtso" => Ok(Self::Mvtso),
            "tapir" => Ok(Self::Tapir),
            other => anyhow::bail!("unknown occ type {other:?}"),
        }
    }
}

/// Client-side failure injection used to exercise the fallback protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InjectFailure {
    ClientCrash,
    ClientEquivocate,
    ClientSendPartialP1,
}

/// Engine configuration. `f` implies n = 5f+1 replicas per group.
#[derive(Clone, Debug)]
pub struct Config {
    pub f: u64,
    pub num_groups: u64,
    pub occ_type: OccType,
    /// Enables signatures on all votes and proofs.
    pub sign_messages: bool,
    /// Enables proof verification on Phase2/Writeback.
    pub validate_proofs: bool,
    /// Enables per-dependency signature verification at Phase1.
    pub verify_deps: bool,
    /// Hash canonicalization for the digest; structural identity otherwise.
    pub hash_digest: bool,
    pub signature_batch_size: usize,
    pub batch_timeout: Duration,
    pub adjust_batch_size: bool,
    pub merkle_branch_factor: usize,
    /// One batcher instance shared by every reply pipeline of the replica.
    pub shared_mem_batches: bool,
    /// Accepted for deployment-config compatibility; batch verification in
    /// this engine is in-process, so the flag has no further effect.
    pub shared_mem_verify: bool,
    /// Bound on dependency chain length; -1 is unbounded, -2 disables
    /// dependency tracking entirely.
    pub max_dep_depth: i64,
    pub phase1_decision_timeout: Duration,
    pub relay_p1_timeout: Duration,
    /// Abstains in a row before a client escalates to fallback.
    pub consecutive_max: u64,
    pub parallel_ccc: bool,
    pub parallel_reads: bool,
    pub multi_threading: bool,
    /// The inbound transport loop is the engine's main thread; this flag
    /// records whether the embedding dispatches receives onto it.
    pub main_thread_dispatching: bool,
    pub all_to_all_fb: bool,
    pub no_fallback: bool,
    pub read_reply_batch: bool,
    pub inject_failure: Option<InjectFailure>,
    /// Watermark slack added to the local clock.
    pub time_delta_ms: u64,
    pub worker_threads: usize,
    /// Deployment secret for client session MACs.
    pub session_seed: [u8; 32],
}

impl Default for Config {
    fn default() -> Self {
        Self {
            f: 1,
            num_groups: 1,
            occ_type: OccType::Mvtso,
            sign_messages: true,
            validate_proofs: true,
            verify_deps: true,
            hash_digest: true,
            signature_batch_size: 1,
            batch_timeout: Duration::from_micros(500),
            adjust_batch_size: false,
            merkle_branch_factor: 2,
            shared_mem_batches: false,
            shared_mem_verify: false,
            max_dep_depth: 4,
            phase1_decision_timeout: Duration::from_millis(50),
            relay_p1_timeout: Duration::from_millis(20),
            consecutive_max: 8,
            parallel_ccc: false,
            parallel_reads: false,
            multi_threading: false,
            main_thread_dispatching: true,
            all_to_all_fb: false,
            no_fallback: false,
            read_reply_batch: false,
            inject_failure: None,
            time_delta_ms: 100,
            worker_threads: 0,
            session_seed: [0u8; 32],
        }
    }
}

impl Config {
    /// Replicas per group.
    pub fn n(&self) -> u64 {
        5 * self.f + 1
    }

    /// Matching Phase1 COMMIT votes per involved group for a fast commit;
    /// also the slow-proof quorum carried into Phase2.
    pub fn fast_quorum(&self) -> usize {
        (self.f + 1) as usize
    }

    /// Matching Phase2 votes in a single view for a slow decision.
    pub fn p2_quorum(&self) -> usize {
        (3 * self.f + 1) as usize
    }

    /// ElectFB votes binding (view, decision) required for a DecisionFB.
    pub fn elect_quorum(&self) -> usize {
        (2 * self.f + 1) as usize
    }

    /// Signed current-view certificates required by InvokeFB.
    pub fn view_cert_quorum(&self) -> usize {
        (3 * self.f + 1) as usize
    }

    /// Relaxed certificate quorum for InvokeFB catch-up.
    pub fn catchup_cert_quorum(&self) -> usize {
        (self.f + 1) as usize
    }

    /// MoveView proposals that trigger re-broadcast.
    pub fn move_view_broadcast(&self) -> usize {
        (self.f + 1) as usize
    }

    /// MoveView proposals that cause view adoption.
    pub fn move_view_adopt(&self) -> usize {
        (2 * self.f + 1) as usize
    }

    /// Stored-P2 replies accepted by Phase2FB as decision evidence.
    pub fn p2_evidence_quorum(&self) -> usize {
        (self.f + 1) as usize
    }

    /// Deterministic fallback coordinator for `view` on `digest`.
    pub fn leader_for(&self, view: u64, digest: &TxnDigest) -> ReplicaIdx {
        (view + u64::from(digest.first_byte())) % self.n()
    }

    /// The group whose replicas own `key`.
    pub fn group_for_key(&self, key: &[u8]) -> GroupId {
        if self.num_groups <= 1 {
            return 0;
        }
        let hash = blake3::hash(key);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_be_bytes(bytes) % self.num_groups
    }

    /// The group responsible for logging fallback decisions on `txn`.
    pub fn log_group(&self, digest: &TxnDigest, txn: &Transaction) -> GroupId {
        let idx = usize::from(digest.first_byte()) % txn.involved_groups.len().max(1);
        txn.involved_groups.get(idx).copied().unwrap_or(0)
    }

    /// Global process id of a replica; client ids start above all replicas.
    pub fn replica_process_id(&self, group: GroupId, idx: ReplicaIdx) -> ProcessId {
        group * self.n() + idx
    }

    pub fn first_client_id(&self) -> ProcessId {
        self.num_groups * self.n()
    }

    /// Fatal boot-time validation of quorum composition and knobs.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_groups == 0 {
            anyhow::bail!("at least one replica group is required");
        }
        if self.signature_batch_size == 0 {
            anyhow::bail!("signature batch size must be at least 1");
        }
        if self.merkle_branch_factor < 2 {
            anyhow::bail!("merkle branch factor must be at least 2");
        }
        if self.max_dep_depth < -2 {
            anyhow::bail!("max dep depth must be >= -2");
        }
        usize::try_from(self.n()).context("replica count overflows usize")?;
        Ok(())
    }
}

/// Wall-clock seam so tests can pin the watermark.
pub trait Clock: Send + Sync + 'static {
    fn now_ms(&self) -> u64;
}

/// Default clock backed by the system time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
            .min(u128::from(u64::MAX)) as u64
    }
}

/// Manually advanced clock for tests.
pub struct ManualClock(pub std::sync::atomic::AtomicU64);

impl ManualClock {
    pub fn new(ms: u64) -> Self {
        Self(std::sync::atomic::AtomicU64::new(ms))
    }

    pub fn set(&self, ms: u64) {
        self.0.store(ms, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Destination of an outbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Address {
    Client(ProcessId),
    Replica { group: GroupId, idx: ReplicaIdx },
}

/// Outbound channel used by the engine and the shard client.
///
/// Transport and framing are external collaborators; implementations are
/// assumed to provide ordered point-to-point delivery.
pub trait Network: Send + Sync + 'static {
    fn send(&self, to: Address, msg: Message);

    fn broadcast_group(&self, group: GroupId, n: u64, msg: Message) {
        for idx in 0..n {
            self.send(Address::Replica { group, idx }, msg.clone());
        }
    }
}
