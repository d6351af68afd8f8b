//! Error kinds shared across the codec, transport, and session layers.
//!
//! Mirrors the five error kinds from the wire-protocol design: parse,
//! transport, auth, resource, and fatal-setup. Propagation policy lives in
//! each caller (client/server/worker), not here.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyfwdError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Errno(#[from] nix::errno::Errno),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("fatal setup error: {0}")]
    FatalSetup(String),
}

pub type Result<T> = std::result::Result<T, PtyfwdError>;
