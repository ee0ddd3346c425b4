#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The controller's public gRPC surface, the in-memory registry of
//! connected exporters, and the router directory.

mod directory;
mod metrics;
mod registry;
mod server;


pub use self::{
    directory::{Directory, RouterEntry, AFFINITY_PREFIX},
    metrics::ControllerMetrics,
    registry::{AlreadyListening, DispatchError, Registration, Registry},
    server::ControllerServer,
};

use patchbay_controller_store as store;

pub(crate) fn status_from_store(error: store::Error) -> tonic::Status {
    match &error {
        store::Error::NotFound { .. } => tonic::Status::not_found(error.to_string()),
        store::Error::AlreadyExists { .. } => tonic::Status::already_exists(error.to_string()),
        store::Error::Conflict { .. } => tonic::Status::aborted(error.to_string()),
        store::Error::Invalid { .. } => tonic::Status::invalid_argument(error.to_string()),
        store::Error::WindowExpired { .. } => tonic::Status::internal(error.to_string()),
    }
}
