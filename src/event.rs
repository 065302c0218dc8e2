//! The per-service event word.
//!
//! Wake reasons aggregate into a bitmask: arrival order is not preserved, but
//! every set bit is observed by the next completed wait whose mask includes
//! it. A wake that arrives before the matching wait is remembered.

use bitflags::bitflags;

bitflags! {
    /// Reasons a service can be woken, and the masks it waits on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Events: u32 {
        /// Initial wake of a freshly launched user thread.
        const START = 1;
        /// Posted by [`Runtime::signal`](crate::Runtime::signal).
        const SIGNAL = 1 << 1;
        /// Cooperative interruption of an interruptible wait.
        const INTERRUPT = 1 << 2;
        /// A message was enqueued to the mailbox.
        const MESSAGE = 1 << 3;
        /// A method call completed and its reply is available.
        const RESPONSE = 1 << 4;
        /// A file descriptor this service parked on became ready.
        const IO = 1 << 5;
        /// A sleep timer expired.
        const SLEEP = 1 << 6;
        /// A deadline expired.
        const TIMEOUT = 1 << 7;
        /// The service has been asked to stop; one-way.
        const STOP = 1 << 8;
    }
}
