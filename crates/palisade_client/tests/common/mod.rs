//! Shared helpers for integration tests: an in-process loopback cluster.
//!
//! All replicas of all groups run in one process, wired through a shared
//! message queue. Tests pump the queue to deliver messages and drive client
//! coordinators explicitly, so every scenario is deterministic.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ed25519_dalek::SigningKey;
use palisade_client::{ClientEvent, Coordinator};
use palisade_crypto::{KeyManager, ProcessId};
use palisade_engine::engine::{Address, Config, ManualClock, Message, Network, Replica};
use rand::rngs::OsRng;

/// Fixed test epoch; transaction timestamps sit shortly above it.
pub const BASE_MS: u64 = 50_000;

pub struct SharedNet {
    queue: Mutex<VecDeque<(Address, Address, Message)>>,
}

impl SharedNet {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
        })
    }

    pub fn push(&self, from: Address, to: Address, msg: Message) {
        self.queue.lock().unwrap().push_back((from, to, msg));
    }

    fn pop(&self) -> Option<(Address, Address, Message)> {
        self.queue.lock().unwrap().pop_front()
    }
}

/// Per-participant handle stamping outbound messages with a sender address.
struct NetHandle {
    from: Address,
    shared: Arc<SharedNet>,
}

impl Network for NetHandle {
    fn send(&self, to: Address, msg: Message) {
        self.shared.push(self.from, to, msg);
    }
}

pub struct Cluster {
    pub config: Config,
    pub shared: Arc<SharedNet>,
    pub clock: Arc<ManualClock>,
    pub replicas: HashMap<(u64, u64), Arc<Replica>>,
    replica_table: HashMap<ProcessId, ed25519_dalek::VerifyingKey>,
    next_client: std::cell::Cell<ProcessId>,
}

impl Cluster {
    pub fn new(config: Config) -> Self {
        Self::new_with(config, |_, _, _| {})
    }

    /// Build a cluster, letting `tweak` adjust each replica's config (used
    /// for mixed batching setups).
    pub fn new_with(config: Config, tweak: impl Fn(u64, u64, &mut Config)) -> Self {
        let shared = SharedNet::new();
        let clock = Arc::new(ManualClock::new(BASE_MS));
        let n = config.n();

        let mut signing: HashMap<ProcessId, SigningKey> = HashMap::new();
        let mut table = HashMap::new();
        for group in 0..config.num_groups {
            for idx in 0..n {
                let pid = config.replica_process_id(group, idx);
                let sk = SigningKey::generate(&mut OsRng);
                table.insert(pid, sk.verifying_key());
                signing.insert(pid, sk);
            }
        }

        let mut replicas = HashMap::new();
        for group in 0..config.num_groups {
            for idx in 0..n {
                let pid = config.replica_process_id(group, idx);
                let mut replica_config = config.clone();
                tweak(group, idx, &mut replica_config);
                let keys = Arc::new(KeyManager::new(
                    pid,
                    signing.remove(&pid).expect("key generated above"),
                    table.clone(),
                ));
                let net = Arc::new(NetHandle {
                    from: Address::Replica { group, idx },
                    shared: shared.clone(),
                });
                let replica = Replica::new(
                    replica_config,
                    group,
                    idx,
                    keys,
                    net,
                    clock.clone(),
                )
                .expect("replica construction");
                replicas.insert((group, idx), replica);
            }
        }

        Self {
            next_client: std::cell::Cell::new(config.first_client_id()),
            config,
            shared,
            clock,
            replicas,
            replica_table: table,
        }
    }

    pub fn replica(&self, group: u64, idx: u64) -> &Arc<Replica> {
        self.replicas.get(&(group, idx)).expect("replica exists")
    }

    /// Build a coordinator with its own identity and the cluster key table.
    pub fn client(&self) -> (ProcessId, Coordinator) {
        self.client_with_config(self.config.clone())
    }

    pub fn client_with_config(&self, config: Config) -> (ProcessId, Coordinator) {
        let id = self.next_client.get();
        self.next_client.set(id + 1);
        let sk = SigningKey::generate(&mut OsRng);
        let mut table = self.replica_table.clone();
        table.insert(id, sk.verifying_key());
        let keys = Arc::new(KeyManager::new(id, sk, table));
        let net = Arc::new(NetHandle {
            from: Address::Client(id),
            shared: self.shared.clone(),
        });
        let coordinator = Coordinator::new(config, id, keys, net).expect("client construction");
        (id, coordinator)
    }

    /// Inject a raw message, e.g. to simulate a byzantine sender.
    pub fn inject(&self, from: Address, to: Address, msg: Message) {
        self.shared.push(from, to, msg);
    }

    /// Deliver queued messages until the queue drains; returns client events.
    pub fn pump(
        &self,
        clients: &mut HashMap<ProcessId, &mut Coordinator>,
    ) -> Vec<(ProcessId, ClientEvent)> {
        let mut unclaimed = Vec::new();
        self.pump_capturing(clients, &mut unclaimed)
    }

    /// Like [`Cluster::pump`], but messages addressed to clients without a
    /// coordinator are captured instead of dropped. Used by tests that play
    /// a client by hand.
    pub fn pump_capturing(
        &self,
        clients: &mut HashMap<ProcessId, &mut Coordinator>,
        unclaimed: &mut Vec<(ProcessId, Message)>,
    ) -> Vec<(ProcessId, ClientEvent)> {
        let mut events = Vec::new();
        while let Some((from, to, msg)) = self.shared.pop() {
            match to {
                Address::Replica { group, idx } => {
                    if let Some(replica) = self.replicas.get(&(group, idx)) {
                        replica.handle_message(from, msg);
                    }
                }
                Address::Client(id) => {
                    if let Some(client) = clients.get_mut(&id) {
                        for event in client.handle_message(from, msg) {
                            events.push((id, event));
                        }
                    } else {
                        unclaimed.push((id, msg));
                    }
                }
            }
        }
        events
    }

    /// Pump with patience for messages produced on signer worker threads.
    pub fn pump_until_quiet(
        &self,
        clients: &mut HashMap<ProcessId, &mut Coordinator>,
        patience: Duration,
    ) -> Vec<(ProcessId, ClientEvent)> {
        let mut events = Vec::new();
        let deadline = Instant::now() + patience;
        let mut idle_rounds = 0;
        while Instant::now() < deadline {
            let before = events.len();
            events.extend(self.pump(clients));
            let produced = events.len() > before;
            let queue_empty = self.shared.queue.lock().unwrap().is_empty();
            if !produced && queue_empty {
                idle_rounds += 1;
                if idle_rounds >= 3 {
                    break;
                }
                std::thread::sleep(Duration::from_millis(5));
            } else {
                idle_rounds = 0;
            }
        }
        events
    }

    /// Advance the shared clock and fire replica relay timers.
    pub fn tick_all(&self, now_ms: u64) {
        self.clock.set(now_ms);
        for replica in self.replicas.values() {
            replica.tick(now_ms);
        }
    }
}

/// Collect `Finished` outcomes from an event batch.
pub fn finished_outcomes(
    events: &[(ProcessId, ClientEvent)],
) -> Vec<(ProcessId, palisade_engine::engine::TxnDigest, palisade_client::TxnOutcome)> {
    events
        .iter()
        .filter_map(|(id, event)| match event {
            ClientEvent::Finished {
                txn_digest,
                outcome,
            } => Some((*id, *txn_digest, *outcome)),
            _ => None,
        })
        .collect()
}
