use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use patchbay_api::v1 as proto;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::{Status, Streaming};

/// A half-connected stream waiting for its peer. Entries are never mutated
/// after insertion, only removed: either by the second arrival (which
/// consumes the entry and starts forwarding) or by the expiry watchdog.
pub(crate) struct Waiter {
    pub(crate) nonce: u64,
    pub(crate) inbound: Streaming<proto::StreamFrame>,
    pub(crate) tx: mpsc::Sender<Result<proto::StreamFrame, Status>>,
    pub(crate) cancel: CancellationToken,
}

pub(crate) enum Arrival {
    /// This side arrived first and was parked.
    First,
    /// The peer was already parked; forwarding can begin.
    Second {
        own: Box<Waiter>,
        peer: Box<Waiter>,
    },
}

/// The in-memory index of half-connected pairs, keyed by stream id.
#[derive(Clone, Default)]
pub(crate) struct PendingMap {
    entries: Arc<Mutex<HashMap<String, Waiter>>>,
    nonces: Arc<AtomicU64>,
}

impl PendingMap {
    pub(crate) fn next_nonce(&self) -> u64 {
        self.nonces.fetch_add(1, Ordering::Relaxed)
    }

    /// Atomic take-or-insert: a single map operation decides whether this
    /// side is the waiter or the forwarder, so two arrivals racing on the
    /// same token cannot both park.
    pub(crate) fn take_or_insert(&self, stream_id: &str, waiter: Waiter) -> Arrival {
        let mut entries = self.entries.lock();
        match entries.remove(stream_id) {
            Some(peer) => Arrival::Second {
                own: Box::new(waiter),
                peer: Box::new(peer),
            },
            None => {
                entries.insert(stream_id.to_string(), waiter);
                Arrival::First
            }
        }
    }

    /// Removes the entry only if it is still the one the watchdog armed
    /// for; a later arrival reusing the id is left alone.
    pub(crate) fn remove_expired(&self, stream_id: &str, nonce: u64) -> Option<Waiter> {
        let mut entries = self.entries.lock();
        if entries.get(stream_id).is_some_and(|w| w.nonce == nonce) {
            return entries.remove(stream_id);
        }
        None
    }

    #[cfg(test)]
    #[allow(dead_code)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
