//! Durable snapshots of query data.
//!
//! The client keeps an in-memory mirror of every snapshot, keyed by
//! [`QueryHash`]. When a [`Persister`] is configured, one background task
//! first loads everything the persister holds into the mirror, then writes
//! changed snapshots back in the order they were made. Persistence is a
//! best-effort cache: backend failures are logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use papaya::{Compute, Operation};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};

use crate::cell::StateCell;
use crate::key::QueryHash;
use crate::state::Timestamp;

/// Storage contract for persisted snapshots.
///
/// Values are opaque strings produced by the client; a backend only has to
/// give them back unchanged.
#[async_trait]
pub trait Persister: Send + Sync + 'static {
    /// Read one value.
    async fn get_item(&self, hash: &str) -> anyhow::Result<Option<String>>;

    /// Store one value, replacing any previous one.
    async fn set_item(&self, hash: &str, value: String) -> anyhow::Result<()>;

    /// Delete one value.
    async fn remove_item(&self, hash: &str) -> anyhow::Result<()>;

    /// Read every stored value.
    async fn get_all(&self) -> anyhow::Result<HashMap<String, String>>;

    /// Delete every stored value.
    async fn remove_all(&self) -> anyhow::Result<()>;
}

/// A [`Persister`] that keeps values in process memory.
#[derive(Debug, Default)]
pub struct MemoryPersister {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryPersister {
    /// Create an empty persister.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[async_trait]
impl Persister for MemoryPersister {
    async fn get_item(&self, hash: &str) -> anyhow::Result<Option<String>> {
        Ok(self.items.lock().get(hash).cloned())
    }

    async fn set_item(&self, hash: &str, value: String) -> anyhow::Result<()> {
        self.items.lock().insert(hash.to_owned(), value);
        Ok(())
    }

    async fn remove_item(&self, hash: &str) -> anyhow::Result<()> {
        self.items.lock().remove(hash);
        Ok(())
    }

    async fn get_all(&self) -> anyhow::Result<HashMap<String, String>> {
        Ok(self.items.lock().clone())
    }

    async fn remove_all(&self) -> anyhow::Result<()> {
        self.items.lock().clear();
        Ok(())
    }
}

/// The persisted part of a query: its data and when it was fetched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Time of the last successful fetch, in epoch seconds.
    pub updated_at: Timestamp,
    /// The fetched data, or `None` if there is none.
    pub data: Option<serde_json::Value>,
}

impl Snapshot {
    /// Decode a value produced by [`Snapshot::encode`].
    pub fn decode(value: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(value)
    }

    /// Encode for a [`Persister`].
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

type Mirror = papaya::HashMap<QueryHash, Snapshot, ahash::RandomState>;

enum Command {
    Write { hash: QueryHash, snapshot: Snapshot },
    Flush(oneshot::Sender<()>),
}

/// In-memory mirror of the persister plus the channel to its writer task.
pub(crate) struct SnapshotStore {
    mirror: Arc<Mirror>,
    writer: Option<mpsc::UnboundedSender<Command>>,
    restored: Arc<StateCell<bool>>,
}

impl SnapshotStore {
    /// Create the store and, if there is a persister, spawn its worker.
    ///
    /// Returns immediately; the bulk load runs in the background.
    pub fn start(persister: Option<Arc<dyn Persister>>, runtime: &Handle) -> Self {
        let mirror = Arc::new(Mirror::with_hasher(ahash::RandomState::new()));
        let Some(persister) = persister else {
            return Self {
                mirror,
                writer: None,
                restored: Arc::new(StateCell::new(true)),
            };
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let restored = Arc::new(StateCell::new(false));
        runtime.spawn(run_worker(persister, mirror.clone(), restored.clone(), rx));
        Self {
            mirror,
            writer: Some(tx),
            restored,
        }
    }

    /// Current mirror entry for `hash`.
    pub fn get(&self, hash: &QueryHash) -> Option<Snapshot> {
        self.mirror.pin().get(hash).cloned()
    }

    /// Return the entry for `hash`, inserting an empty one if there is none.
    pub fn ensure(&self, hash: &QueryHash) -> Snapshot {
        let pinned = self.mirror.pin();
        let result = pinned.compute(hash.clone(), |entry| match entry {
            Some((_, snapshot)) => Operation::Abort(snapshot.clone()),
            None => Operation::Insert(Snapshot::default()),
        });
        match result {
            Compute::Inserted(_, snapshot) => snapshot.clone(),
            Compute::Aborted(snapshot) => snapshot,
            Compute::Updated { .. } | Compute::Removed(_, _) => unreachable!(),
        }
    }

    /// Apply `update` to the entry for `hash` and queue the result for writing.
    pub fn update(&self, hash: &QueryHash, update: impl Fn(&mut Snapshot)) {
        let pinned = self.mirror.pin();
        let result = pinned.compute(hash.clone(), |entry| {
            let mut snapshot = entry.map(|(_, s)| s.clone()).unwrap_or_default();
            update(&mut snapshot);
            Operation::Insert::<_, ()>(snapshot)
        });
        let snapshot = match result {
            Compute::Inserted(_, snapshot) => snapshot.clone(),
            Compute::Updated { new: (_, snapshot), .. } => snapshot.clone(),
            Compute::Removed(_, _) | Compute::Aborted(_) => unreachable!(),
        };
        if let Some(writer) = &self.writer {
            // The worker only stops once the store is gone.
            let _ = writer.send(Command::Write {
                hash: hash.clone(),
                snapshot,
            });
        }
    }

    /// Wait until every write queued so far was handed to the persister.
    pub async fn flush(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        if writer.send(Command::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn restored(&self) -> watch::Receiver<bool> {
        self.restored.subscribe()
    }

    pub fn writer_for(self: &Arc<Self>, hash: QueryHash) -> SnapshotWriter {
        SnapshotWriter {
            hash,
            store: self.clone(),
        }
    }
}

async fn run_worker(
    persister: Arc<dyn Persister>,
    mirror: Arc<Mirror>,
    restored: Arc<StateCell<bool>>,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    match persister.get_all().await {
        Ok(items) => {
            let pinned = mirror.pin();
            let mut loaded = 0usize;
            for (hash, value) in items {
                match Snapshot::decode(&value) {
                    Ok(snapshot) => {
                        // Entries a query already wrote are newer than the
                        // persisted ones.
                        pinned.compute(QueryHash::from_raw(hash), |entry| match entry {
                            Some((_, current)) if *current != Snapshot::default() => {
                                Operation::Abort(())
                            }
                            _ => Operation::Insert(snapshot.clone()),
                        });
                        loaded += 1;
                    }
                    Err(e) => tracing::warn!(%hash, error = %e, "skipping undecodable snapshot"),
                }
            }
            tracing::debug!(loaded, "restored persisted snapshots");
        }
        Err(e) => tracing::warn!(error = %e, "failed to load persisted snapshots"),
    }
    restored.set(true);

    while let Some(command) = rx.recv().await {
        match command {
            Command::Write { hash, snapshot } => {
                let value = match snapshot.encode() {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(%hash, error = %e, "failed to encode snapshot");
                        continue;
                    }
                };
                if let Err(e) = persister.set_item(hash.as_str(), value).await {
                    tracing::warn!(%hash, error = %e, "failed to persist snapshot");
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Mirrors one query's data and timestamp into the store.
pub(crate) struct SnapshotWriter {
    hash: QueryHash,
    store: Arc<SnapshotStore>,
}

impl SnapshotWriter {
    pub fn data_changed<D: Serialize>(&self, data: Option<&D>) {
        let value = match data.map(serde_json::to_value).transpose() {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(hash = %self.hash, error = %e, "failed to serialize query data");
                return;
            }
        };
        self.store
            .update(&self.hash, |snapshot| snapshot.data = value.clone());
    }

    pub fn updated_at_changed(&self, updated_at: Timestamp) {
        self.store
            .update(&self.hash, |snapshot| snapshot.updated_at = updated_at);
    }
}
