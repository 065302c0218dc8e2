//! Messages and their completion closures.
//!
//! A message names a destination service and carries a payload plus an
//! optional completion closure. The closure fires exactly once: with the
//! dispatch status when the destination handles the message, or with
//! [`Error::Interrupt`](crate::Error::Interrupt) if the destination retires
//! with the message still queued. Messages enqueued by one sender are
//! delivered in enqueue order.

use std::any::Any;
use std::fmt;

use crate::handle::ServiceHandle;
use crate::scope::Scope;
use crate::status::Status;

/// Completion closure attached to a message.
pub type DoneFn = Box<dyn FnOnce(Status) + Send + 'static>;

pub(crate) type CallFn = Box<dyn FnOnce(&mut dyn Any, &Scope<'_>) -> Status + Send + 'static>;

/// A type-erased method invocation.
///
/// Built by [`Runtime::call`](crate::Runtime::call) and friends; when
/// dispatched it downcasts the destination to the concrete service type and
/// re-enters the typed method.
pub struct MethodInvocation {
    f: CallFn,
}

impl MethodInvocation {
    pub(crate) fn new(
        f: impl FnOnce(&mut dyn Any, &Scope<'_>) -> Status + Send + 'static,
    ) -> MethodInvocation {
        MethodInvocation { f: Box::new(f) }
    }

    pub(crate) fn invoke(self, target: &mut dyn Any, scope: &Scope<'_>) -> Status {
        (self.f)(target, scope)
    }
}

impl fmt::Debug for MethodInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MethodInvocation")
    }
}

/// What a message carries.
#[derive(Debug)]
pub enum Payload {
    /// A plain text message.
    Text(String),
    /// A method invocation against the destination service.
    Call(MethodInvocation),
}

/// An asynchronous message to a service.
pub struct Message {
    pub(crate) source: Option<ServiceHandle>,
    pub(crate) dest: ServiceHandle,
    pub(crate) payload: Payload,
    pub(crate) done: Option<DoneFn>,
}

impl Message {
    /// A text message to `dest`. The source is stamped by
    /// [`Runtime::send_text`](crate::Runtime::send_text) when sent from
    /// inside a service; messages built directly carry no source.
    pub fn text(dest: ServiceHandle, text: impl Into<String>) -> Message {
        Message {
            source: None,
            dest,
            payload: Payload::Text(text.into()),
            done: None,
        }
    }

    pub(crate) fn call(dest: ServiceHandle, invocation: MethodInvocation) -> Message {
        Message {
            source: None,
            dest,
            payload: Payload::Call(invocation),
            done: None,
        }
    }

    /// Attach a completion closure. It fires when the destination reports
    /// completion, or with [`Error::Interrupt`](crate::Error::Interrupt) if
    /// the destination retires first.
    pub fn with_done(mut self, f: impl FnOnce(Status) + Send + 'static) -> Message {
        self.done = Some(Box::new(f));
        self
    }

    pub fn source(&self) -> Option<ServiceHandle> {
        self.source
    }

    pub fn dest(&self) -> ServiceHandle {
        self.dest
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The text payload, if this is a text message.
    pub fn text_payload(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(s) => Some(s.as_str()),
            Payload::Call(_) => None,
        }
    }

    /// Report completion to the sender. Only the first call has any effect.
    pub fn done(&mut self, status: Status) {
        if let Some(f) = self.done.take() {
            f(status);
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("source", &self.source)
            .field("dest", &self.dest)
            .field("payload", &self.payload)
            .field("done", &self.done.is_some())
            .finish()
    }
}
