//! Signing and verification pipeline for the palisade replica engine.
//!
//! The crate is runtime-free: batching runs on a dedicated OS thread with a
//! producer/consumer queue, and verification is plain function calls so the
//! engine can dispatch them onto whichever worker it likes. Higher layers
//! supply payload bytes; everything here is agnostic to message semantics.

mod keys;
mod merkle;
mod signer;
mod verifier;

pub use keys::{KeyManager, ProcessId, SessionKeys};
pub use merkle::{MerklePath, MerkleTree};
pub use signer::{sign_message, BatchSigner, BatchSignerConfig, Sig, SignedMessage};
pub use verifier::Verifier;
