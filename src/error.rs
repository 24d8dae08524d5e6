//! Error taxonomy and process exit codes.
//!
//! Transient conditions (no data or connection pending) and peer-initiated
//! closes never reach this type; they are handled inside the event loops.
//! What remains is either an operator mistake (`Config`) or an OS resource
//! failure that terminates the calling process (`Os`).

use crate::config::ConfigError;
use std::io;

/// Successful or interrupted shutdown.
pub const EX_OK: i32 = 0;
/// Invalid command line or configuration input.
pub const EX_USAGE: i32 = 64;
/// Unexpected operating system failure.
pub const EX_OSERR: i32 = 71;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An OS call failed; `context` names the failing operation.
    #[error("{context}: {source}")]
    Os {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Exit code the process should terminate with for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Os { .. } => EX_OSERR,
            Error::Config(_) => EX_USAGE,
        }
    }
}

/// Attach the name of the failing OS operation to an `io::Result`.
pub trait OsContext<T> {
    fn os_context(self, context: &'static str) -> Result<T, Error>;
}

impl<T> OsContext<T> for io::Result<T> {
    fn os_context(self, context: &'static str) -> Result<T, Error> {
        self.map_err(|source| Error::Os { context, source })
    }
}
