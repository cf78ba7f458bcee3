//! # reposrv - chunked file-repository backend over a pub/sub message bus
//!
//! A pool of workers consumes operation requests published by backup clients,
//! executes them against a local filesystem-backed repository rooted at a
//! per-tenant bucket, and publishes structured replies. Request and reply
//! bodies that exceed the bus's per-message payload cap are transparently
//! fragmented and reassembled by the chunking codec in [`protocol::chunk`].

use thiserror::Error;

pub mod backend;
pub mod bus;
pub mod config;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod worker;
pub mod pool;

pub use config::Config;
pub use runtime::Runtime;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for every fallible operation in this crate.
#[derive(Error, Debug)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation canceled")]
    Canceled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("encode/decode error: {0}")]
    Codec(#[from] Box<bincode::ErrorKind>),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for the subset of errors that should surface to the wire as
    /// `ok: false` rather than being swallowed with no reply at all.
    pub fn is_reply_worthy(&self) -> bool {
        !matches!(self, Error::Timeout | Error::Canceled)
    }
}
