//! Call-status reporting for runtime operations.
//!
//! Every fallible operation returns [`Status`] (or `Result<T, Error>` when it
//! carries a value). The kinds mirror what callers actually branch on:
//! `NotFound` is the universal "that handle no longer names a live service",
//! and `Interrupt` is how a cooperative primitive reports that its wait was
//! ended by something other than the event it asked for.

use thiserror::Error;

/// The error taxonomy of the runtime.
///
/// `Eof` and `Again` are never produced by the runtime itself; they are
/// reserved for I/O collaborators layered on top and are forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    /// The handle refers to a service that does not exist, has died, or is
    /// not yet accepting messages.
    #[error("service not found")]
    NotFound,
    #[error("{0}")]
    Failed(String),
    /// A blocking primitive was woken by `Stop`, `Interrupt`, or another
    /// event outside its requested class.
    #[error("interrupted")]
    Interrupt,
    #[error("end of file")]
    Eof,
    #[error("resource temporarily unavailable")]
    Again,
}

impl Error {
    pub(crate) fn failed(msg: impl Into<String>) -> Error {
        Error::Failed(msg.into())
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self, Error::Interrupt)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

/// Result of an operation that carries no value.
pub type Status = Result<(), Error>;
