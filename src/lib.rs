/*!
A cooperative service runtime: a large population of lightweight *services*
multiplexed over a small pool of worker threads.

A service is a unit of computation with its own stack (or a message handler)
and a mailbox, named by a cheap copyable [`ServiceHandle`]. Services talk by
asynchronous messages and typed method calls, and suspend cooperatively on
timers, fd readiness, signals, and replies. There is no preemption: a service
runs until it calls a primitive that may suspend.

## Design

Three tightly-coupled pieces share one wait/wake protocol:

* **The scheduler.** Each worker thread pulls from a single process-wide
  FIFO of ready services and resumes the chosen service's stackful
  coroutine. A suspending service switches back to its worker, which
  requeues it if a wake arrived during the switch window. Wake reasons
  aggregate into a per-service bitmask ([`Events`]); a wake that arrives
  before the matching wait is remembered, so wakeups are never lost.
* **The reactor.** An epoll loop parks services on file descriptors.
  Registration is edge-triggered and one-shot in effect: readiness is
  delivered once, together with the kernel-reported mask, and the service
  re-issues the wait if it wants more.
* **The timing wheel.** A five-level hierarchical wheel with a 10 ms tick
  gives O(1) insertion and cancellation for tens of thousands of timers,
  driving sleeps, timeouts, and the blocked-deadline watchdog.

Stopping is cooperative too: [`Runtime::stop_service`] latches a one-way
flag and the service terminates at its next suspension point;
[`Runtime::interrupt`] unblocks interruptible waits, which report
[`Error::Interrupt`] instead of success.

## Usage

```
use coro_pool::Runtime;

let rt = Runtime::start(2).unwrap();

let (tx, rx) = std::sync::mpsc::channel();
rt.launch_fn("greeter", move |scope| {
    scope.sleep(20).unwrap();
    tx.send(format!("hello from {}", scope.name())).unwrap();
})
.unwrap();

println!("{}", rx.recv().unwrap());
rt.stop();
```

Message-driven services implement [`MessageService`] (one handler call per
mailbox message) or [`MethodService`] (each message is a typed method
invocation, made with [`Runtime::call`]):

```
use coro_pool::{MethodService, Runtime, ServiceBody, StackSize};

struct Adder {
    total: i64,
}

impl MethodService for Adder {}

impl Adder {
    fn add(&mut self, n: i64) -> i64 {
        self.total += n;
        self.total
    }
}

let rt = Runtime::start(2).unwrap();
let h = rt
    .launch("adder", StackSize::Small, ServiceBody::method(Adder { total: 0 }))
    .unwrap();

let total = rt.call(h, |a: &mut Adder, _: &coro_pool::Scope| a.add(42)).unwrap();
assert_eq!(total, 42);
rt.stop();
```

## Portability

This crate is Linux-only due to its use of epoll and eventfds.
*/

mod context;
mod event;
mod handle;
mod message;
mod reactor;
mod runtime;
mod scope;
mod service;
mod status;
mod watchdog;
mod wheel;

pub use context::StackSize;
pub use event::Events;
pub use handle::ServiceHandle;
pub use message::{DoneFn, Message, MethodInvocation, Payload};
pub use runtime::{Builder, Runtime};
pub use scope::Scope;
pub use service::{MessageService, MethodService, ServiceBody, UserService};
pub use status::{Error, Status};
pub use wheel::TimerHandle;
