//! Replica-side transaction engine for the palisade store.
//!
//! This crate implements the Byzantine-fault-tolerant transaction protocol:
//! the multi-version store, the MVTSO concurrency-control check, the
//! dependency tracker, the Phase1/Phase2/Writeback state machine, and the
//! client-driven view-change fallback. Higher layers supply a `Network` and
//! key material, then feed inbound messages through `Replica::handle_message`.

pub mod engine;
