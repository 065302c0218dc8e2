//! Service handles.

use std::fmt;

/// An opaque name for a service.
///
/// Handles are cheap to copy and compare and carry no ownership: the service
/// behind a handle may already be dead, in which case lookups report
/// [`Error::NotFound`](crate::Error::NotFound). Indices are allocated
/// monotonically and never reused within a run, so a stale handle can never
/// alias a newer service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle(i64);

impl ServiceHandle {
    /// Indices below this are reserved (index 1 names the per-worker idle
    /// role and is never entered into the service table).
    pub(crate) const FIRST_INDEX: i64 = 16;

    pub(crate) fn from_index(index: i64) -> ServiceHandle {
        ServiceHandle(index)
    }

    /// The raw 63-bit index. Also the payload this handle travels as through
    /// the kernel event multiplexer.
    pub fn index(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
