//! Engine module wiring.
//!
//! `types` defines the shared data model and configuration, `messages` the
//! wire records, `store` the multi-version storage, `mvtso` the
//! concurrency-control checks, `deps` the dependency tracker, `proofs` the
//! quorum/proof validation, `dispatch` the worker-pool abstraction, and
//! `replica`/`fallback` the per-replica protocol handlers.

mod deps;
mod dispatch;
mod fallback;
mod messages;
mod mvtso;
mod proofs;
mod replica;
mod state;
mod store;
mod types;

pub use dispatch::{Affinity, Dispatcher};
pub use messages::{
    decode_payload, encode_payload, AbortInternal, AbortMsg, AttachedView, CcVote, CurrentView,
    DecisionFB, ElectFB, ElectMessage, ForwardWriteback, InvokeFB, Message, MoveViewMsg, Phase1FB,
    Phase1FBReply, Phase1Msg, Phase1Reply, Phase2Decision, Phase2FB, Phase2FBReply, Phase2Msg,
    Phase2Reply, ReadMsg, ReadReply, RelayP1, SendView, WriteRecord, WritebackMsg,
};
pub use replica::{Replica, StatsSnapshot};
pub use store::{MultiVersionStore, VersionedValue};
pub use types::{
    Address, CcResult, Clock, CommittedProof, Config, Decision, Dependency, GroupId, GroupedSigs,
    InjectFailure, Key, ManualClock, Network, OccType, ProofSigs, ReadSetEntry, ReplicaIdx,
    SystemClock, Timestamp, Transaction, TxnDigest, Value, WriteSetEntry,
};
