//! Worker-pool dispatcher.
//!
//! One abstraction covers the engine's three dispatch modes: no dispatch
//! (zero workers, everything runs on the caller), main-thread offload, and a
//! preemptive OS-thread pool. `Keyed` affinity pins work for one digest to a
//! fixed worker so parallel per-digest Phase1 never interleaves across
//! digests. Queues are bounded; a saturated queue runs the work on the
//! caller instead of growing without bound.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where a piece of work must run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Affinity {
    /// The caller's event loop; multi-map mutations stay serialized here.
    Main,
    AnyWorker,
    /// Hash-pinned worker; the same key always lands on the same queue.
    Keyed(u64),
}

/// Bounded worker pool with digest-keyed routing.
pub struct Dispatcher {
    workers: Vec<std_mpsc::SyncSender<Job>>,
    next: std::sync::atomic::AtomicUsize,
}

impl Dispatcher {
    /// Spawn `worker_threads` workers with `queue_cap` pending jobs each.
    /// Zero workers yields inline execution for every affinity.
    pub fn new(worker_threads: usize, queue_cap: usize) -> Arc<Self> {
        let mut workers = Vec::with_capacity(worker_threads);
        for i in 0..worker_threads {
            let (tx, rx) = std_mpsc::sync_channel::<Job>(queue_cap.max(1));
            std::thread::Builder::new()
                .name(format!("engine-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("spawn engine worker");
            workers.push(tx);
        }
        Arc::new(Self {
            workers,
            next: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    /// Run `job` under `affinity`. `Main` always executes on the caller:
    /// the inbound network loop is the engine's main thread.
    pub fn submit(&self, affinity: Affinity, job: Job) {
        match affinity {
            Affinity::Main => job(),
            Affinity::AnyWorker => {
                if self.workers.is_empty() {
                    job();
                    return;
                }
                let idx = self
                    .next
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                    % self.workers.len();
                self.offload(idx, job);
            }
            Affinity::Keyed(key) => {
                if self.workers.is_empty() {
                    job();
                    return;
                }
                let idx = (key as usize) % self.workers.len();
                self.offload(idx, job);
            }
        }
    }

    fn offload(&self, idx: usize, job: Job) {
        match self.workers[idx].try_send(job) {
            Ok(()) => {}
            Err(std_mpsc::TrySendError::Full(job)) => {
                // Saturated: reject new queueing, run on the caller.
                job();
            }
            Err(std_mpsc::TrySendError::Disconnected(job)) => {
                tracing::warn!(worker = idx, "worker queue disconnected");
                job();
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}
