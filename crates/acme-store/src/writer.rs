//! Background persistence of the store state
//!
//! Mutations enqueue a request carrying a shared reference to the live state.
//! A single worker drains the queue in order and writes whatever the state
//! holds at dequeue time, so several mutations made in quick succession may
//! land in one physical write. Failed writes are logged and dropped; the
//! next mutation carries the latest state forward.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{Secret, SecretBackend};
use crate::codec;
use crate::error::StoreResult;
use crate::types::StoredData;

/// Key of the secret field holding the encoded state
pub const STORAGE_KEY: &str = "acme";

/// State shared between accessors and the writer
pub(crate) type SharedState = Arc<Mutex<StoredData>>;

/// Location of the storage secret
#[derive(Debug, Clone)]
pub(crate) struct SecretTarget {
    pub namespace: String,
    pub name: String,
}

struct WriteRequest {
    seq: u64,
    state: SharedState,
}

struct Queue {
    sender: Option<mpsc::UnboundedSender<WriteRequest>>,
    last_seq: u64,
}

#[derive(Debug, Default)]
struct Counters {
    written: AtomicU64,
    failed: AtomicU64,
}

/// Persistence writer statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Requests accepted by the queue
    pub submitted: u64,
    /// Requests the worker has finished with
    pub processed: u64,
    /// Successful writes
    pub written: u64,
    /// Failed writes
    pub failed: u64,
}

/// Single-worker, in-order persistence queue.
pub(crate) struct PersistenceWriter {
    queue: Mutex<Queue>,
    progress: watch::Receiver<u64>,
    counters: Arc<Counters>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceWriter {
    /// Spawn the worker on the current Tokio runtime.
    pub fn spawn(backend: Arc<dyn SecretBackend>, target: SecretTarget) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = watch::channel(0);
        let counters = Arc::new(Counters::default());

        debug!(
            namespace = %target.namespace,
            name = %target.name,
            "Starting persistence writer"
        );

        let worker = tokio::spawn(run(
            receiver,
            backend,
            target,
            progress_tx,
            Arc::clone(&counters),
        ));

        Self {
            queue: Mutex::new(Queue {
                sender: Some(sender),
                last_seq: 0,
            }),
            progress: progress_rx,
            counters,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue a write of the current state. Never blocks on I/O.
    pub fn enqueue(&self, state: &SharedState) {
        let mut queue = self.queue.lock();
        let Some(sender) = queue.sender.as_ref() else {
            warn!("Persistence writer is shut down, mutation will not be persisted");
            return;
        };

        let seq = queue.last_seq + 1;
        let request = WriteRequest {
            seq,
            state: Arc::clone(state),
        };
        if sender.send(request).is_err() {
            error!("Persistence worker has stopped, mutation will not be persisted");
            return;
        }
        queue.last_seq = seq;
    }

    /// Wait until every request queued so far has been processed.
    pub async fn flush(&self) {
        let target = self.queue.lock().last_seq;
        let mut progress = self.progress.clone();
        if progress.wait_for(|done| *done >= target).await.is_err() {
            warn!(target_seq = target, "Persistence worker stopped before flush completed");
        }
    }

    /// Close the queue, drain pending requests and join the worker.
    pub async fn shutdown(&self) {
        self.queue.lock().sender.take();
        let worker = self.worker.lock().take();

        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "Persistence worker terminated abnormally");
            }
        }
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            submitted: self.queue.lock().last_seq,
            processed: *self.progress.borrow(),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

async fn run(
    mut receiver: mpsc::UnboundedReceiver<WriteRequest>,
    backend: Arc<dyn SecretBackend>,
    target: SecretTarget,
    progress: watch::Sender<u64>,
    counters: Arc<Counters>,
) {
    while let Some(request) = receiver.recv().await {
        match persist(backend.as_ref(), &target, &request.state).await {
            Ok(()) => {
                counters.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    namespace = %target.namespace,
                    name = %target.name,
                    seq = request.seq,
                    error = %e,
                    "Failed to persist ACME state"
                );
            }
        }
        progress.send_replace(request.seq);
    }

    debug!(namespace = %target.namespace, "Persistence writer stopped");
}

fn encode_state(state: &SharedState) -> StoreResult<Vec<u8>> {
    let data = state.lock();
    codec::encode(&data)
}

async fn persist(
    backend: &dyn SecretBackend,
    target: &SecretTarget,
    state: &SharedState,
) -> StoreResult<()> {
    let payload = encode_state(state)?;
    let secret = Secret::opaque(&target.namespace, &target.name, STORAGE_KEY, payload);

    if backend.exists(&target.namespace, &target.name).await? {
        backend.update(&secret).await?;
        debug!(namespace = %target.namespace, name = %target.name, "Updated ACME storage secret");
    } else {
        backend.create(&secret).await?;
        info!(namespace = %target.namespace, name = %target.name, "Created ACME storage secret");
    }
    Ok(())
}
