#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Reconcilers over the resource store.
//!
//! The lease arbiter matches lease requests to available exporters,
//! enforces one-exporter-per-active-lease, and expires leases; the identity
//! reconciler keeps every exporter and client resource provisioned with an
//! issued credential. Both are event-driven over store watches and rely on
//! the store's optimistic concurrency, retrying from the latest revision
//! when a write loses a race.

mod identity;
mod lease;
mod metrics;

#[cfg(test)]
mod tests;

pub use self::{
    identity::IdentityReconciler,
    lease::{Arbiter, LeaseLimits},
    metrics::ArbiterMetrics,
};
