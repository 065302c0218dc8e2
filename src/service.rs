//! Service variants.
//!
//! A service is one of three kinds, selected at launch:
//!
//! * a *user thread* runs a body on its own stack and may call the blocking
//!   primitives on [`Scope`];
//! * a *message service* has its handler invoked once per mailbox message;
//! * a *method service* is a message service whose messages are typed method
//!   invocations, dispatched by downcast.
//!
//! The kind is a tag on [`ServiceBody`]; the scheduler picks the matching
//! trampoline with a match on that tag.

use std::any::Any;

use log::warn;

use crate::message::Message;
use crate::scope::Scope;
use crate::status::Error;

/// A service that runs a body to completion on its own stack.
///
/// The body may suspend cooperatively (sleep, wait for I/O, signals, or
/// replies). Long-running bodies should observe
/// [`Scope::is_stopping`] at their natural suspension points.
pub trait UserService: Send + 'static {
    fn on_start(&mut self, _scope: &Scope<'_>) {}
    fn run(&mut self, scope: &Scope<'_>);
    fn on_stop(&mut self, _scope: &Scope<'_>) {}
}

/// A service driven by its mailbox: the handler runs once per message.
///
/// The mailbox wait is not interruptible; only a stop takes the service off
/// it. A stopping service exits after the message in hand.
pub trait MessageService: Send + 'static {
    fn on_start(&mut self, _scope: &Scope<'_>) {}
    fn handle(&mut self, scope: &Scope<'_>, msg: Message);
    fn on_stop(&mut self, _scope: &Scope<'_>) {}
}

/// A message service whose mailbox carries typed method invocations.
///
/// Calls are made with [`Runtime::call`](crate::Runtime::call) or
/// [`Runtime::call_async`](crate::Runtime::call_async); the runtime dispatches
/// each one to the concrete type and reports completion to the caller.
pub trait MethodService: Send + 'static {
    fn on_start(&mut self, _scope: &Scope<'_>) {}
    fn on_stop(&mut self, _scope: &Scope<'_>) {}

    /// Fallback for messages that are not method invocations.
    fn on_message(&mut self, _scope: &Scope<'_>, mut msg: Message) {
        warn!("method service received a non-call message");
        msg.done(Err(Error::failed("destination does not accept messages")));
    }
}

/// Object-safe bridge from `dyn` method services to `Any` for dispatch.
pub(crate) trait DynMethodService: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn on_start(&mut self, scope: &Scope<'_>);
    fn on_stop(&mut self, scope: &Scope<'_>);
    fn on_message(&mut self, scope: &Scope<'_>, msg: Message);
}

impl<T: MethodService> DynMethodService for T {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn on_start(&mut self, scope: &Scope<'_>) {
        MethodService::on_start(self, scope);
    }

    fn on_stop(&mut self, scope: &Scope<'_>) {
        MethodService::on_stop(self, scope);
    }

    fn on_message(&mut self, scope: &Scope<'_>, msg: Message) {
        MethodService::on_message(self, scope, msg);
    }
}

pub(crate) enum Body {
    Thread(Box<dyn UserService>),
    Message(Box<dyn MessageService>),
    Method(Box<dyn DynMethodService>),
}

/// A service ready to be launched: the implementation plus its kind tag.
pub struct ServiceBody(pub(crate) Body);

impl ServiceBody {
    pub fn thread(svc: impl UserService) -> ServiceBody {
        ServiceBody(Body::Thread(Box::new(svc)))
    }

    pub fn message(svc: impl MessageService) -> ServiceBody {
        ServiceBody(Body::Message(Box::new(svc)))
    }

    pub fn method(svc: impl MethodService) -> ServiceBody {
        ServiceBody(Body::Method(Box::new(svc)))
    }

    /// A user thread from a bare closure.
    pub fn thread_fn(f: impl FnOnce(&Scope<'_>) + Send + 'static) -> ServiceBody {
        struct FnService<F>(Option<F>);

        impl<F: FnOnce(&Scope<'_>) + Send + 'static> UserService for FnService<F> {
            fn run(&mut self, scope: &Scope<'_>) {
                if let Some(f) = self.0.take() {
                    f(scope);
                }
            }
        }

        ServiceBody::thread(FnService(Some(f)))
    }
}
