#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Request authentication and authorization.
//!
//! Every call's bearer token is tried against an ordered list of
//! verifiers: the internal identity-token verifier first, then any
//! configured external OIDC verifiers. A successful verification yields a
//! subject string, which the authorizer maps back onto an exporter or
//! client resource.

mod authenticate;
mod authorize;
mod bearer;

pub use self::{
    authenticate::{Authenticator, OidcVerifier, Verify},
    authorize::{Authorizer, Identity},
    bearer::bearer,
};

pub(crate) use patchbay_controller_token as token;

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("unauthenticated: {0}")]
    Unauthenticated(#[source] token::Error),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid authorization metadata: {0}")]
    InvalidArgument(&'static str),
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        match &error {
            Error::Unauthenticated(_) => tonic::Status::unauthenticated(error.to_string()),
            Error::PermissionDenied(_) => tonic::Status::permission_denied(error.to_string()),
            Error::InvalidArgument(_) => tonic::Status::invalid_argument(error.to_string()),
        }
    }
}
