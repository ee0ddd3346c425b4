#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Token issuance and verification.
//!
//! Two token families are minted here: long-lived identity tokens proving
//! an exporter's or client's identity to the controller, and short-lived
//! one-time stream tokens authorizing a single pairing on the router. Both
//! derive their key material from one process-wide seed so that tokens
//! survive controller restarts.

mod identity;
mod oidc;
mod seed;
mod stream;

pub use self::{
    identity::IdentitySigner,
    oidc::discovery_document,
    seed::Seed,
    stream::{StreamClaims, StreamSigner, StreamTokens},
};

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("token expired")]
    Expired,

    #[error("wrong issuer")]
    WrongIssuer,

    #[error("wrong audience")]
    WrongAudience,

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("bad signature")]
    BadSignature,

    #[error("key material unavailable: {0}")]
    Key(String),
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(error: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match error.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidIssuer => Self::WrongIssuer,
            ErrorKind::InvalidAudience => Self::WrongAudience,
            ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidAlgorithmName
            | ErrorKind::ImmatureSignature => Self::BadSignature,
            _ => Self::Malformed(error.to_string()),
        }
    }
}
