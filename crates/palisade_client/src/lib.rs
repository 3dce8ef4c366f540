//! Client side of the palisade transaction protocol.
//!
//! `Phase1Validator` folds incoming votes into a fast/slow decision state,
//! `ShardClient` tracks per-request pending state for one replica group, and
//! `Coordinator` drives whole transactions (and fallbacks on other clients'
//! stalled transactions) across groups. Everything is a synchronous state
//! machine: the embedding transport loop feeds messages in and fires the
//! phase1 decision timer through explicit entry points.

mod coordinator;
mod shard;
mod validator;

pub use coordinator::{ClientEvent, Coordinator, TxnOutcome};
pub use shard::{Phase1Outcome, ShardClient, ShardEvent};
pub use validator::{Phase1ValidationState, Phase1Validator};
