#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! An embedded, watch-capable resource store.
//!
//! Storage is in-memory and scoped to a single namespace. Every write bumps
//! a per-kind monotonic revision; spec and status are independently
//! versioned so that a status writer is not invalidated by a concurrent
//! spec write (and vice versa). Watches replay from a bounded event window
//! and fail loudly when asked to resume from before it.

mod store;
mod watch;

#[cfg(test)]
mod tests;

pub use self::{
    store::Store,
    watch::{Event, Watcher},
};

use patchbay_controller_core::{Client, Exporter, Kind, Lease, Secret};

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: Kind, name: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: Kind, name: String },

    #[error("conflict writing {kind} {name:?}: observed revision {observed}, current {current}")]
    Conflict {
        kind: Kind,
        name: String,
        observed: u64,
        current: u64,
    },

    #[error("invalid {kind}: {reason}")]
    Invalid { kind: Kind, reason: String },

    #[error("watch resume revision {since} is older than the retained window (oldest {oldest})")]
    WindowExpired { since: u64, oldest: u64 },
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// The full resource surface of one namespace.
#[derive(Clone, Debug)]
pub struct Stores {
    exporters: Store<Exporter>,
    clients: Store<Client>,
    leases: Store<Lease>,
    secrets: Store<Secret>,
}

impl Stores {
    pub fn new(namespace: &str) -> Self {
        Self {
            exporters: Store::new(namespace),
            clients: Store::new(namespace),
            leases: Store::new(namespace),
            secrets: Store::new(namespace),
        }
    }

    pub fn namespace(&self) -> &str {
        self.exporters.namespace()
    }

    pub fn exporters(&self) -> &Store<Exporter> {
        &self.exporters
    }

    pub fn clients(&self) -> &Store<Client> {
        &self.clients
    }

    pub fn leases(&self) -> &Store<Lease> {
        &self.leases
    }

    pub fn secrets(&self) -> &Store<Secret> {
        &self.secrets
    }
}
