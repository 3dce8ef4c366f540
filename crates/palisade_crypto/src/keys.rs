//! Key management: replica signing identities and client session MACs.

use std::collections::HashMap;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Process identifier shared by replicas and clients. Replica ids occupy the
/// low range; client ids start after all replica ids.
pub type ProcessId = u64;

type HmacSha256 = Hmac<Sha256>;

/// Maps process id to verifying key and holds this process's signing key.
///
/// The fallback orchestrator and every proof validation path resolve peer
/// keys through this table; there is no other key distribution channel.
pub struct KeyManager {
    id: ProcessId,
    signing_key: SigningKey,
    verifying_keys: HashMap<ProcessId, VerifyingKey>,
}

impl KeyManager {
    pub fn new(
        id: ProcessId,
        signing_key: SigningKey,
        verifying_keys: HashMap<ProcessId, VerifyingKey>,
    ) -> Self {
        Self {
            id,
            signing_key,
            verifying_keys,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn sign(&self, data: &[u8]) -> ed25519_dalek::Signature {
        self.signing_key.sign(data)
    }

    pub fn verifying_key(&self, id: ProcessId) -> Option<&VerifyingKey> {
        self.verifying_keys.get(&id)
    }
}

/// Instance-scoped MAC table used to authenticate client control messages
/// (stale-read Abort cleanup). One session key per peer, derived from a
/// deployment secret so both ends agree without an exchange round.
pub struct SessionKeys {
    local: ProcessId,
    seed: [u8; 32],
}

impl SessionKeys {
    pub fn new(local: ProcessId, seed: [u8; 32]) -> Self {
        Self { local, seed }
    }

    fn session_key(&self, peer: ProcessId) -> [u8; 32] {
        let (lo, hi) = if self.local < peer {
            (self.local, peer)
        } else {
            (peer, self.local)
        };
        let mut mac =
            HmacSha256::new_from_slice(&self.seed).expect("hmac accepts any key length");
        mac.update(&lo.to_be_bytes());
        mac.update(&hi.to_be_bytes());
        mac.finalize().into_bytes().into()
    }

    /// MAC `data` for the channel between this process and `peer`.
    pub fn mac(&self, peer: ProcessId, data: &[u8]) -> [u8; 32] {
        let key = self.session_key(peer);
        let mut mac = HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// Check a MAC produced by `peer` over `data`.
    pub fn verify(&self, peer: ProcessId, data: &[u8], tag: &[u8; 32]) -> bool {
        let key = self.session_key(peer);
        let mut mac = HmacSha256::new_from_slice(&key).expect("hmac accepts any key length");
        mac.update(data);
        mac.verify_slice(tag).is_ok()
    }
}
