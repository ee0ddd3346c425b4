#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Controller process assembly: configuration, logging, the admin/OIDC
//! HTTP server, and the wiring of stores, signers, reconcilers, and the
//! gRPC surface into one runnable unit.

mod admin;
mod args;
mod config;

pub use self::{
    args::Args,
    config::{AuthConfig, Config, KeepaliveConfig, LeaseLimitsConfig, OidcConfig, RouterConfig},
};
