//! The surface a service sees while it runs.
//!
//! Every service callback receives a [`Scope`]: the service's own handle and
//! name, the blocking primitives, and a way back to the [`Runtime`] for
//! launching, messaging, and calling other services. Services hold no
//! back-pointers of their own; the scope lives on the service's stack from
//! first activation to retirement.

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::context::ServiceContext;
use crate::handle::ServiceHandle;
use crate::runtime::Runtime;
use crate::status::Status;

pub struct Scope<'a> {
    runtime: &'a Runtime,
    ctx: &'a Arc<ServiceContext>,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(runtime: &'a Runtime, ctx: &'a Arc<ServiceContext>) -> Scope<'a> {
        Scope { runtime, ctx }
    }

    pub fn runtime(&self) -> &Runtime {
        self.runtime
    }

    pub fn handle(&self) -> ServiceHandle {
        self.ctx.handle
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    /// True once this service has been asked to stop. Long-running bodies
    /// should check this at their natural suspension points.
    pub fn is_stopping(&self) -> bool {
        self.ctx.is_stopping()
    }

    /// Ask this service to stop.
    pub fn stop(&self) {
        self.runtime.core.stop_service_ctx(self.ctx);
    }

    /// Suspend for roughly `ms` milliseconds.
    ///
    /// Returns `Ok` when the timer expired, [`Error::Interrupt`] when the
    /// sleep was ended early by a stop or an interrupt. `sleep(0)` returns
    /// `Ok` immediately without switching.
    ///
    /// [`Error::Interrupt`]: crate::Error::Interrupt
    pub fn sleep(&self, ms: u32) -> Status {
        self.runtime.core.sleep_on(self.ctx, ms)
    }

    /// Block until [`Runtime::signal`] is posted to this service. A signal
    /// that arrived before the wait is remembered and returns immediately.
    pub fn wait_signal(&self) -> Status {
        self.runtime.core.wait_signal_on(self.ctx)
    }

    /// Park this service until `fd` is readable. Edge-triggered and
    /// one-shot: re-issue the wait for further readiness. The fd must stay
    /// open until the wait returns.
    pub fn wait_input(&self, fd: RawFd) -> Status {
        self.runtime.core.wait_input_on(self.ctx, fd)
    }

    /// Park this service until `fd` is writable. Same contract as
    /// [`wait_input`](Scope::wait_input).
    pub fn wait_output(&self, fd: RawFd) -> Status {
        self.runtime.core.wait_output_on(self.ctx, fd)
    }

    /// Give up the worker: requeue this service at the back of the ready
    /// queue and switch to the next ready service, if any.
    pub fn yield_now(&self) {
        self.runtime.core.yield_on(self.ctx);
    }
}
