use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use patchbay_api::v1 as proto;
use patchbay_controller_core::{Exporter, Selector};
use patchbay_controller_store::{Event, Store};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dial pushes queued per Listen stream before the exporter is considered
/// too slow to receive.
const DISPATCH_BUFFER: usize = 16;

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
#[error("exporter {0:?} is already listening")]
pub struct AlreadyListening(pub String);

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("exporter {0:?} is not connected")]
    NotRegistered(String),

    #[error("exporter {0:?} is not consuming its listen stream")]
    Busy(String),
}

/// The in-process index of currently-connected exporters, keyed by exporter
/// name. Reads (Dial dispatch) vastly outnumber writes, hence the
/// read-write lock.
#[derive(Clone, Debug, Default)]
pub struct Registry {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    ids: Arc<AtomicU64>,
}

#[derive(Debug)]
struct Entry {
    id: u64,
    tx: mpsc::Sender<proto::ListenResponse>,
    cancel: CancellationToken,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a Listen stream for the exporter. Rejected while a live
    /// stream exists; the exporter must cancel it (Bye, disconnect, or
    /// eviction) before re-registering.
    pub fn register(&self, name: &str) -> Result<Registration, AlreadyListening> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(name) {
            if !existing.cancel.is_cancelled() {
                return Err(AlreadyListening(name.to_string()));
            }
            entries.remove(name);
        }

        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(DISPATCH_BUFFER);
        let cancel = CancellationToken::new();
        entries.insert(
            name.to_string(),
            Entry {
                id,
                tx,
                cancel: cancel.clone(),
            },
        );
        debug!(exporter = %name, "listen registered");
        Ok(Registration {
            name: name.to_string(),
            id,
            rx,
            cancel,
            registry: self.clone(),
        })
    }

    /// Pushes a frame into the exporter's Listen stream.
    pub fn dispatch(
        &self,
        name: &str,
        msg: proto::ListenResponse,
    ) -> Result<(), DispatchError> {
        let entries = self.entries.read();
        let entry = entries
            .get(name)
            .filter(|e| !e.cancel.is_cancelled())
            .ok_or_else(|| DispatchError::NotRegistered(name.to_string()))?;
        entry.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::Busy(name.to_string()),
            mpsc::error::TrySendError::Closed(_) => DispatchError::NotRegistered(name.to_string()),
        })
    }

    pub fn is_listening(&self, name: &str) -> bool {
        self.entries
            .read()
            .get(name)
            .is_some_and(|e| !e.cancel.is_cancelled())
    }

    /// Cancels and drops the exporter's stream, if any. Idempotent.
    pub fn evict(&self, name: &str) {
        if let Some(entry) = self.entries.write().remove(name) {
            entry.cancel.cancel();
            info!(exporter = %name, "listen evicted");
        }
    }

    /// Removes the entry only if it still belongs to the given
    /// registration, so a stale stream's cleanup cannot evict a newer one.
    fn unregister(&self, name: &str, id: u64) {
        let mut entries = self.entries.write();
        if entries.get(name).is_some_and(|e| e.id == id) {
            if let Some(entry) = entries.remove(name) {
                entry.cancel.cancel();
                debug!(exporter = %name, "listen unregistered");
            }
        }
    }

    /// Evicts Listen streams when their exporter resource is deleted, so a
    /// deleted exporter loses its stream within a bounded interval.
    pub async fn evict_deleted(self, exporters: Store<Exporter>, drain: drain::Watch) {
        let (_, mut watch) = exporters.list_and_watch(Selector::default());

        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = (&mut shutdown) => return,
                event = watch.next() => match event {
                    Ok(Event::Deleted(exporter)) => self.evict(&exporter.metadata.name),
                    Ok(_) => {}
                    Err(error) => {
                        warn!(%error, "exporter watch expired, restarting");
                        let (exporters_now, restarted) =
                            exporters.list_and_watch(Selector::default());
                        // Anything registered but no longer stored was
                        // deleted while we were behind.
                        let live = exporters_now
                            .iter()
                            .map(|e| e.metadata.name.as_str())
                            .collect::<Vec<_>>();
                        let registered = self
                            .entries
                            .read()
                            .keys()
                            .cloned()
                            .collect::<Vec<_>>();
                        for name in registered {
                            if !live.contains(&name.as_str()) {
                                self.evict(&name);
                            }
                        }
                        watch = restarted;
                    }
                },
            }
        }
    }
}

/// A live Listen registration. Dropping it (the stream ended) removes the
/// registry entry.
#[derive(Debug)]
pub struct Registration {
    name: String,
    id: u64,
    rx: mpsc::Receiver<proto::ListenResponse>,
    cancel: CancellationToken,
    registry: Registry,
}

impl Registration {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next dispatched frame; `None` once the registration
    /// has been cancelled or evicted.
    pub async fn next(&mut self) -> Option<proto::ListenResponse> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            msg = self.rx.recv() => msg,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.name, self.id);
    }
}
