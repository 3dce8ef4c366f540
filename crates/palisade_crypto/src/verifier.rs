//! Signature verification with format autodetect.
//!
//! The verifier accepts both plain and Merkle-batched signatures from the
//! same signer identity: a batch-size-1 replica and a batch-size-64 replica
//! in the same group verify through the same path. Verification is a plain
//! function call; callers that want it off the hot thread dispatch the call
//! themselves and consume the boolean in a completion callback.

use std::sync::Arc;

use ed25519_dalek::{Signature, Verifier as _, VerifyingKey};

use crate::keys::{KeyManager, ProcessId};
use crate::signer::{Sig, SignedMessage};

/// Stateless verifier bound to a key table.
#[derive(Clone)]
pub struct Verifier {
    keys: Arc<KeyManager>,
}

impl Verifier {
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self { keys }
    }

    /// Verify `msg` against the signer's registered key.
    ///
    /// Unknown signers and malformed signatures verify as false; byzantine
    /// senders are ignored, never errored on.
    pub fn verify(&self, msg: &SignedMessage) -> bool {
        let Some(key) = self.keys.verifying_key(msg.process_id) else {
            tracing::warn!(process_id = msg.process_id, "signature from unknown process");
            return false;
        };
        Self::verify_with(key, msg)
    }

    /// Verify `msg`, asserting it was produced by `expected` specifically.
    pub fn verify_from(&self, expected: ProcessId, msg: &SignedMessage) -> bool {
        msg.process_id == expected && self.verify(msg)
    }

    pub fn verify_with(key: &VerifyingKey, msg: &SignedMessage) -> bool {
        match &msg.sig {
            Sig::Plain(bytes) => {
                let Ok(sig) = Signature::from_slice(bytes) else {
                    return false;
                };
                key.verify(&msg.data, &sig).is_ok()
            }
            Sig::Batched { root_sig, path } => {
                let Ok(sig) = Signature::from_slice(root_sig) else {
                    return false;
                };
                let root = path.root_for(&msg.data);
                key.verify(&root, &sig).is_ok()
            }
        }
    }
}
