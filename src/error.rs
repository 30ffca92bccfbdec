//! Unified error type.

use std::path::PathBuf;

/// The error type returned by weft's fallible operations.
///
/// Application-level errors (404, 429, etc.) are expressed as
/// [`Outcome`](crate::Outcome) values, not as `Error`s. This type surfaces
/// infrastructure failures: resolving or binding the listen address,
/// accepting a connection, opening the log destination.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid listen address `{addr}`")]
    InvalidAddr { addr: String },

    #[error("could not bind `{addr}`: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not open log output `{}`: {source}", path.display())]
    LogOutput {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
