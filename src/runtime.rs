//! The scheduler core and the runtime façade.
//!
//! Workers pull services from one process-wide FIFO ready queue and resume
//! their coroutines; a running service suspends back to its worker, which
//! performs the hand-over bookkeeping and picks the next ready service. All
//! wake paths — messages, timers, I/O readiness, signals, stop — converge on
//! one wakeup protocol against the per-service event word.
//!
//! The lost-wakeup race is closed in two places: a wake that lands before
//! the wait is remembered in the event word and consumed by the wait's fast
//! path; a wake that lands during the switch window (after the service
//! decided to block, before it is off the worker) sets the sticky
//! `wakeup_signal`, and the worker's suspend sweep requeues the service.

use std::any::Any;
use std::collections::HashMap;
use std::mem;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult};
use log::{error, info, trace, warn};
use nix::sys::epoll::EpollFlags;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::context::{ContextInner, SendCo, ServiceContext, ServiceStatus, StackSize, YielderRef};
use crate::event::Events;
use crate::handle::ServiceHandle;
use crate::message::{DoneFn, Message, MethodInvocation, Payload};
use crate::reactor::Reactor;
use crate::scope::Scope;
use crate::service::{Body, MethodService, ServiceBody};
use crate::status::{Error, Status};
use crate::watchdog::Watchdog;
use crate::wheel::{TimerHandle, TimingWheel, TICK_MS};

std::thread_local! {
    /// The service executing on this worker, if any. Library entry points
    /// consult this to decide whether the caller can wait cooperatively.
    static CURRENT: std::cell::RefCell<Option<Arc<ServiceContext>>> =
        const { std::cell::RefCell::new(None) };
}

fn current_service() -> Option<Arc<ServiceContext>> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Configures and starts a [`Runtime`].
#[derive(Debug, Clone)]
pub struct Builder {
    workers: usize,
    watchdog_interval_ms: u32,
    watchdog_floor_ms: u32,
}

impl Default for Builder {
    fn default() -> Builder {
        Builder {
            workers: 0,
            watchdog_interval_ms: 30_000,
            watchdog_floor_ms: 100,
        }
    }
}

impl Builder {
    /// Number of worker threads. Zero means the default of two.
    pub fn workers(mut self, n: usize) -> Builder {
        self.workers = n;
        self
    }

    /// Baseline polling interval of the blocked-deadline watchdog.
    pub fn watchdog_interval(mut self, ms: u32) -> Builder {
        self.watchdog_interval_ms = ms;
        self
    }

    /// Shortest deadline the watchdog will accept.
    pub fn watchdog_floor(mut self, ms: u32) -> Builder {
        self.watchdog_floor_ms = ms;
        self
    }

    /// Start the runtime: the clock thread, the reactor thread, the workers,
    /// and the watchdog service.
    pub fn start(self) -> Result<Runtime, Error> {
        let workers = if self.workers == 0 { 2 } else { self.workers };
        info!("runtime start, {} workers", workers);

        let reactor = Reactor::new()?;
        let core = Arc::new(Core {
            ready: ReadyQueue::new(),
            table: RwLock::new(HashMap::new()),
            next_index: AtomicI64::new(ServiceHandle::FIRST_INDEX),
            stopped: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            stop_cond: Condvar::new(),
            threads: Mutex::new(Vec::new()),
            worker_init: AtomicUsize::new(0),
            wheel: TimingWheel::new(),
            reactor,
            watchdog: Mutex::new(None),
            watchdog_interval_ms: self.watchdog_interval_ms,
            watchdog_floor_ms: self.watchdog_floor_ms,
        });

        {
            let mut threads = core.threads.lock();

            let clock = core.clone();
            threads.push(spawn_named("coro-pool-timer", move || {
                clock.wheel.run(&clock.stopped);
            })?);

            let poller = core.clone();
            threads.push(spawn_named("coro-pool-reactor", move || {
                poller.reactor.run(&poller);
            })?);

            for i in 0..workers {
                let worker = core.clone();
                threads.push(spawn_named(&format!("coro-pool-worker-{}", i), move || {
                    worker.worker_main(i as i32);
                })?);
            }
        }

        while core.worker_init.load(Ordering::Acquire) != workers {
            std::thread::yield_now();
        }

        let runtime = Runtime { core };
        match runtime.start_builtin_services() {
            Ok(()) => Ok(runtime),
            Err(e) => {
                warn!("builtin services failed to start: {}", e);
                runtime.stop();
                Err(e)
            }
        }
    }
}

fn spawn_named(
    name: &str,
    f: impl FnOnce() + Send + 'static,
) -> Result<std::thread::JoinHandle<()>, Error> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| Error::failed(format!("spawn {} failed: {}", name, e)))
}

/// A handle to a running runtime.
///
/// Cheap to clone; all clones name the same runtime. Stopping is explicit
/// ([`Runtime::stop`]) and idempotent. A runtime is a normal value: several
/// independent runtimes can coexist in one process.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) core: Arc<Core>,
}

impl Runtime {
    /// Start a runtime with `workers` worker threads (zero for the default).
    pub fn start(workers: usize) -> Result<Runtime, Error> {
        Builder::default().workers(workers).start()
    }

    pub fn builder() -> Builder {
        Builder::default()
    }

    pub(crate) fn from_core(core: Arc<Core>) -> Runtime {
        Runtime { core }
    }

    /// Stop the runtime: stop every service, unblock the reactor, and join
    /// all threads. Idempotent. Must not be called from inside a service.
    pub fn stop(&self) {
        self.core.stop();
    }

    /// Block until [`stop`](Runtime::stop) has completed.
    pub fn wait_stop(&self) {
        self.core.wait_stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.core.is_stopped()
    }

    /// Launch a service. Returns its handle; the service starts blocked and
    /// is scheduled when its first wake (start or message) arrives.
    pub fn launch(
        &self,
        name: impl Into<String>,
        stack: StackSize,
        body: ServiceBody,
    ) -> Result<ServiceHandle, Error> {
        self.core.launch(name.into(), stack, body.0)
    }

    /// Launch a user thread with the default stack.
    pub fn launch_fn(
        &self,
        name: impl Into<String>,
        f: impl FnOnce(&Scope<'_>) + Send + 'static,
    ) -> Result<ServiceHandle, Error> {
        self.launch(name, StackSize::default(), ServiceBody::thread_fn(f))
    }

    /// Send a message to its destination's mailbox, waking the destination
    /// if it is waiting for mail. Does not block.
    pub fn send(&self, msg: Message) -> Status {
        self.core.send(msg)
    }

    /// Send a text message, stamping the calling service as the source when
    /// invoked from inside one. `done` fires with the handler's completion
    /// status, or with [`Error::Interrupt`] if the destination retires
    /// before handling it.
    pub fn send_text(
        &self,
        dest: ServiceHandle,
        text: impl Into<String>,
        done: impl FnOnce(Status) + Send + 'static,
    ) -> Status {
        let mut msg = Message::text(dest, text).with_done(done);
        msg.source = current_service().map(|c| c.handle);
        self.core.send(msg)
    }

    /// Invoke a method on a method service and wait for its result.
    ///
    /// From inside a service the wait is cooperative; from outside the
    /// runtime the calling thread blocks on a condition variable. Calling a
    /// service's own methods from its own body deadlocks — the mailbox can
    /// only drain when the body returns.
    pub fn call<S, R, F>(&self, dest: ServiceHandle, f: F) -> Result<R, Error>
    where
        S: MethodService,
        R: Send + 'static,
        F: FnOnce(&mut S, &Scope<'_>) -> R + Send + 'static,
    {
        self.core.call(dest, f)
    }

    /// Invoke a method without waiting. `done`, when given, fires with the
    /// dispatch status. If the send itself fails, `done` does not fire and
    /// the caller handles the returned status.
    pub fn call_async<S, F>(&self, dest: ServiceHandle, f: F, done: Option<DoneFn>) -> Status
    where
        S: MethodService,
        F: FnOnce(&mut S, &Scope<'_>) + Send + 'static,
    {
        self.core.call_async(dest, f, done)
    }

    /// Ask a service to stop. One-way: the service terminates at its next
    /// suspension point. Returns false if the handle names no live service.
    pub fn stop_service(&self, h: ServiceHandle) -> bool {
        match self.core.find_service(h) {
            Some(ctx) => {
                self.core.stop_service_ctx(&ctx);
                true
            }
            None => false,
        }
    }

    /// Interrupt a service blocked in an interruptible wait. A no-op if the
    /// service is running or its current wait is not interruptible; the
    /// event is not remembered in that case.
    pub fn interrupt(&self, h: ServiceHandle) {
        self.core.interrupt(h);
    }

    /// Post a signal. Remembered if the service is not currently waiting:
    /// a later [`Scope::wait_signal`] returns immediately.
    pub fn signal(&self, h: ServiceHandle) {
        self.core.signal(h);
    }

    /// Register `cb` to fire once after roughly `ms` milliseconds.
    pub fn add_timer(&self, ms: u32, cb: impl FnOnce() + Send + 'static) -> TimerHandle {
        self.core.wheel.add_timer(ms, cb)
    }

    /// Cancel a timer. Returns false if it already fired.
    pub fn remove_timer(&self, h: &TimerHandle) -> bool {
        self.core.wheel.remove_timer(h)
    }

    /// Register a blocked-time deadline with the watchdog: if `h` stays
    /// blocked longer than `max_ms`, it is interrupted.
    pub fn interrupt_if_blocked(&self, h: ServiceHandle, max_ms: u32) -> Status {
        self.core.interrupt_if_blocked(h, max_ms)
    }

    /// How long a service has been blocked, in milliseconds; zero while it
    /// runs. `None` if the handle names no live service.
    pub fn blocked_ms(&self, h: ServiceHandle) -> Option<u64> {
        let ctx = self.core.find_service(h)?;
        Some(self.core.service_blocked_ms(&ctx))
    }

    /// [`Scope::sleep`] for the calling service. Fails with `Failed` when
    /// the caller is not a service.
    pub fn sleep(&self, ms: u32) -> Status {
        let ctx = current_service().ok_or_else(not_a_service)?;
        self.core.sleep_on(&ctx, ms)
    }

    /// [`Scope::wait_signal`] for the calling service.
    pub fn wait_signal(&self) -> Status {
        let ctx = current_service().ok_or_else(not_a_service)?;
        self.core.wait_signal_on(&ctx)
    }

    /// [`Scope::wait_input`] for the calling service.
    pub fn wait_input(&self, fd: RawFd) -> Status {
        let ctx = current_service().ok_or_else(not_a_service)?;
        self.core.wait_input_on(&ctx, fd)
    }

    /// [`Scope::wait_output`] for the calling service.
    pub fn wait_output(&self, fd: RawFd) -> Status {
        let ctx = current_service().ok_or_else(not_a_service)?;
        self.core.wait_output_on(&ctx, fd)
    }

    /// Yield the worker to the next ready service. Outside a service this
    /// yields the OS thread.
    pub fn yield_now(&self) {
        match current_service() {
            Some(ctx) => self.core.yield_on(&ctx),
            None => std::thread::yield_now(),
        }
    }

    fn start_builtin_services(&self) -> Result<(), Error> {
        let watchdog = Watchdog::new(
            &self.core,
            self.core.watchdog_interval_ms,
            self.core.watchdog_floor_ms,
        );
        let h = self.launch("watchdog", StackSize::Small, ServiceBody::method(watchdog))?;
        *self.core.watchdog.lock() = Some(h);
        self.call(h, |w: &mut Watchdog, scope: &Scope<'_>| w.start(scope))
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("stopped", &self.core.is_stopped())
            .finish()
    }
}

fn not_a_service() -> Error {
    Error::failed("the calling thread is not running a service")
}

/// The process-wide FIFO of ready services.
struct ReadyQueue {
    queue: Mutex<std::collections::VecDeque<Arc<ServiceContext>>>,
    cond: Condvar,
}

impl ReadyQueue {
    fn new() -> ReadyQueue {
        ReadyQueue {
            queue: Mutex::new(std::collections::VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    fn push(&self, ctx: Arc<ServiceContext>) {
        self.queue.lock().push_back(ctx);
        self.cond.notify_one();
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<Arc<ServiceContext>> {
        let mut queue = self.queue.lock();
        if let Some(ctx) = queue.pop_front() {
            return Some(ctx);
        }
        self.cond.wait_for(&mut queue, timeout);
        queue.pop_front()
    }

    fn notify_all(&self) {
        self.cond.notify_all();
    }

    fn clear(&self) {
        self.queue.lock().clear();
    }
}

pub(crate) struct Core {
    ready: ReadyQueue,
    table: RwLock<HashMap<i64, Arc<ServiceContext>>>,
    next_index: AtomicI64,
    stopped: AtomicBool,
    lifecycle: Mutex<()>,
    stop_cond: Condvar,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    worker_init: AtomicUsize,
    pub(crate) wheel: TimingWheel,
    pub(crate) reactor: Reactor,
    watchdog: Mutex<Option<ServiceHandle>>,
    watchdog_interval_ms: u32,
    watchdog_floor_ms: u32,
}

// ─── Lifecycle ───────────────────────────────────────────────────────────

impl Core {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    fn stop(&self) {
        let guard = self.lifecycle.lock();
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("runtime stop");

        self.stop_all_services();
        self.reactor.stop();
        self.ready.notify_all();

        let threads = mem::take(&mut *self.threads.lock());
        for t in threads {
            let _ = t.join();
        }

        // Services that never got to observe the stop: fail their mail and
        // drop their contexts (unwinding any still-suspended stacks).
        let leftover: Vec<_> = self.table.write().drain().map(|(_, ctx)| ctx).collect();
        for ctx in &leftover {
            let drained = mem::take(&mut ctx.inner.lock().mailbox);
            for mut msg in drained {
                msg.done(Err(Error::Interrupt));
            }
        }
        drop(leftover);
        self.ready.clear();

        drop(guard);
        self.stop_cond.notify_all();
    }

    fn wait_stop(&self) {
        let mut guard = self.lifecycle.lock();
        while !self.is_stopped() {
            self.stop_cond.wait(&mut guard);
        }
    }

    fn stop_all_services(&self) {
        let services: Vec<_> = self.table.read().values().cloned().collect();
        for ctx in services {
            self.stop_service_ctx(&ctx);
        }
    }

    // ─── Service table ───────────────────────────────────────────────────

    pub(crate) fn find_service(&self, h: ServiceHandle) -> Option<Arc<ServiceContext>> {
        self.table.read().get(&h.index()).cloned()
    }

    fn add_service(&self, ctx: Arc<ServiceContext>) {
        self.table.write().insert(ctx.handle.index(), ctx);
    }

    fn remove_service(&self, h: ServiceHandle) {
        self.table.write().remove(&h.index());
    }

    // ─── Launch ──────────────────────────────────────────────────────────

    fn launch(
        self: &Arc<Core>,
        name: String,
        stack: StackSize,
        body: Body,
    ) -> Result<ServiceHandle, Error> {
        if self.is_stopped() {
            return Err(Error::failed("runtime is stopped"));
        }

        let index = self.next_index.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = ServiceHandle::from_index(index);
        let ctx = Arc::new(ServiceContext::new(name, handle));
        let now = self.wheel.current_tick();
        ctx.blocked_tick.store(now, Ordering::Relaxed);
        ctx.wakeup_tick.store(now, Ordering::Relaxed);

        let stack = DefaultStack::new(stack.bytes())
            .map_err(|e| Error::failed(format!("stack allocation failed: {}", e)))?;
        let is_thread = matches!(body, Body::Thread(_));
        let co = self.make_trampoline(ctx.clone(), body, stack);

        {
            let mut inner = ctx.inner.lock();
            inner.co = Some(SendCo(co));
            self.add_service(ctx.clone());
            ctx.set_status(ServiceStatus::Blocked);
            if is_thread {
                inner.wait_events = Events::START;
                self.wakeup_locked(&ctx, inner, Events::START);
            } else {
                inner.wait_events = Events::MESSAGE | Events::STOP;
            }
        }

        trace!("launched service {} {}", ctx.name, handle);
        Ok(handle)
    }

    /// Build the coroutine for a service: a match on the variant tag picks
    /// the trampoline.
    fn make_trampoline(
        self: &Arc<Core>,
        ctx: Arc<ServiceContext>,
        body: Body,
        stack: DefaultStack,
    ) -> Coroutine<(), (), ()> {
        let core = self.clone();
        match body {
            Body::Thread(mut svc) => Coroutine::with_stack(stack, move |yielder, ()| {
                let runtime = Runtime::from_core(core);
                ctx.inner.lock().yielder = YielderRef::new(yielder);
                let scope = Scope::new(&runtime, &ctx);
                svc.on_start(&scope);
                svc.run(&scope);
                svc.on_stop(&scope);
                ctx.inner.lock().yielder = YielderRef::null();
            }),
            Body::Message(mut svc) => Coroutine::with_stack(stack, move |yielder, ()| {
                let runtime = Runtime::from_core(core);
                ctx.inner.lock().yielder = YielderRef::new(yielder);
                let scope = Scope::new(&runtime, &ctx);
                svc.on_start(&scope);
                loop {
                    // The lock is held from the empty-check into the wait:
                    // a message arriving in between must find wait_events set.
                    let mut inner = ctx.inner.lock();
                    if ctx.is_stopping() {
                        break;
                    }
                    if let Some(msg) = inner.mailbox.pop_front() {
                        drop(inner);
                        svc.handle(&scope, msg);
                    } else {
                        let (guard, _) = runtime.core.wait_locked(
                            &ctx,
                            inner,
                            Events::MESSAGE | Events::STOP,
                        );
                        drop(guard);
                    }
                }
                svc.on_stop(&scope);
                ctx.inner.lock().yielder = YielderRef::null();
            }),
            Body::Method(mut svc) => Coroutine::with_stack(stack, move |yielder, ()| {
                let runtime = Runtime::from_core(core);
                ctx.inner.lock().yielder = YielderRef::new(yielder);
                let scope = Scope::new(&runtime, &ctx);
                svc.on_start(&scope);
                loop {
                    let mut inner = ctx.inner.lock();
                    if ctx.is_stopping() {
                        break;
                    }
                    if let Some(msg) = inner.mailbox.pop_front() {
                        drop(inner);
                        dispatch_method(&mut *svc, &scope, msg);
                    } else {
                        let (guard, _) = runtime.core.wait_locked(
                            &ctx,
                            inner,
                            Events::MESSAGE | Events::STOP,
                        );
                        drop(guard);
                    }
                }
                svc.on_stop(&scope);
                ctx.inner.lock().yielder = YielderRef::null();
            }),
        }
    }

    // ─── Worker ──────────────────────────────────────────────────────────

    fn worker_main(self: &Arc<Core>, index: i32) {
        self.worker_init.fetch_add(1, Ordering::Release);
        trace!("worker {} online", index);
        loop {
            match self.ready.pop_timeout(Duration::from_millis(10)) {
                Some(ctx) => self.run_service(ctx, index),
                None => {
                    if self.is_stopped() {
                        break;
                    }
                    self.rebalance_ready_queue();
                }
            }
        }
        trace!("worker {} exit", index);
    }

    /// Hook for future per-worker queues with work stealing. The global
    /// FIFO is the baseline; nothing to do when it is empty.
    fn rebalance_ready_queue(&self) {}

    /// Resume one ready service until it suspends or returns.
    fn run_service(self: &Arc<Core>, ctx: Arc<ServiceContext>, worker: i32) {
        let co = {
            let mut inner = ctx.inner.lock();
            debug_assert_eq!(ctx.status(), ServiceStatus::Ready);
            inner.wakeup_signal = false;
            inner.wait_events = Events::empty();
            inner.last_thread = worker;
            ctx.set_status(ServiceStatus::Running);
            inner.co.take()
        };
        ctx.wakeup_tick
            .store(self.wheel.current_tick(), Ordering::Relaxed);

        let Some(mut co) = co else {
            panic!(
                "run_service: no coroutine for {}. Please report this error.",
                ctx.name
            );
        };

        trace!("worker {}: resuming {}", worker, ctx.name);
        CURRENT.with(|c| *c.borrow_mut() = Some(ctx.clone()));
        let result = panic::catch_unwind(AssertUnwindSafe(|| co.0.resume(())));
        CURRENT.with(|c| *c.borrow_mut() = None);

        match result {
            Ok(CoroutineResult::Yield(())) => self.on_suspend(ctx, co),
            Ok(CoroutineResult::Return(())) => self.retire(ctx),
            Err(_) => {
                error!("service {} panicked; marking it dead", ctx.name);
                self.retire(ctx);
            }
        }
    }

    /// Bookkeeping for a service that switched out: restore its coroutine
    /// and requeue it if a wake landed during the switch window (or if it
    /// yielded).
    fn on_suspend(&self, ctx: Arc<ServiceContext>, co: SendCo) {
        let mut inner = ctx.inner.lock();
        debug_assert!(inner.is_swapping_out);
        inner.co = Some(co);
        inner.is_swapping_out = false;
        match ctx.status() {
            ServiceStatus::Ready => {
                drop(inner);
                self.ready.push(ctx);
            }
            ServiceStatus::Blocked if inner.wakeup_signal => {
                ctx.set_status(ServiceStatus::Ready);
                drop(inner);
                self.ready.push(ctx);
            }
            _ => {}
        }
    }

    /// A service's trampoline returned (or panicked): mark it dead, fail
    /// its undelivered mail, and forget it. The coroutine drops here, on
    /// the worker that ran the final activation.
    fn retire(&self, ctx: Arc<ServiceContext>) {
        trace!("retire service {} {}", ctx.name, ctx.handle);
        let drained = {
            let mut inner = ctx.inner.lock();
            ctx.stopping.store(true, Ordering::Relaxed);
            ctx.set_status(ServiceStatus::Dead);
            inner.yielder = YielderRef::null();
            mem::take(&mut inner.mailbox)
        };
        self.remove_service(ctx.handle);
        for mut msg in drained {
            msg.done(Err(Error::Interrupt));
        }
    }

    // ─── Wait / wakeup protocol ──────────────────────────────────────────

    /// Block the calling service until one of `events` is pending, and
    /// consume those bits. Fast path: a requested event already pending (or
    /// a stop, when `STOP` is requested) returns without switching.
    fn wait_on(&self, ctx: &Arc<ServiceContext>, events: Events) -> Events {
        let inner = ctx.inner.lock();
        let (inner, revents) = self.wait_locked(ctx, inner, events);
        drop(inner);
        revents
    }

    pub(crate) fn wait_locked<'a>(
        &self,
        ctx: &'a ServiceContext,
        mut inner: MutexGuard<'a, ContextInner>,
        events: Events,
    ) -> (MutexGuard<'a, ContextInner>, Events) {
        trace!("wait: {} for {:?}", ctx.name, events);
        inner.wait_events = Events::empty();

        if ctx.is_stopping() && events.contains(Events::STOP) {
            return (inner, Events::STOP);
        }

        if inner.events.intersects(events) {
            let revents = inner.events & events;
            inner.events &= !events;
            return (inner, revents);
        }

        loop {
            ctx.set_status(ServiceStatus::Blocked);
            ctx.blocked_tick
                .store(self.wheel.current_tick(), Ordering::Relaxed);
            inner.is_swapping_out = true;
            inner.wait_events = events;
            let yielder = inner.yielder;
            drop(inner);

            // Safety: we are on this service's coroutine; the yielder was
            // installed at trampoline entry and outlives this suspension.
            unsafe { yielder.get() }.suspend(());

            inner = ctx.inner.lock();
            if inner.events.intersects(events) {
                let revents = inner.events & events;
                inner.events &= !events;
                return (inner, revents);
            }
            warn!(
                "wait: {} woken without requested events (pending {:?}, wanted {:?})",
                ctx.name, inner.events, events
            );
        }
    }

    /// Post `events` to a service. Returns false when the service is not
    /// waiting for any of them (the bits stay pending regardless).
    pub(crate) fn wakeup(&self, h: ServiceHandle, events: Events) -> bool {
        match self.find_service(h) {
            Some(ctx) => self.wakeup_service(&ctx, events),
            None => false,
        }
    }

    fn wakeup_service(&self, ctx: &Arc<ServiceContext>, events: Events) -> bool {
        let inner = ctx.inner.lock();
        self.wakeup_locked(ctx, inner, events)
    }

    fn wakeup_locked(
        &self,
        ctx: &Arc<ServiceContext>,
        mut inner: MutexGuard<'_, ContextInner>,
        events: Events,
    ) -> bool {
        trace!("wake {} with {:?}", ctx.name, events);
        // A wake may land before the matching wait; the bits are sticky.
        inner.events |= events;

        if !inner.wait_events.intersects(events) {
            return false;
        }

        inner.wakeup_signal = true;
        if inner.is_swapping_out {
            // Mid-switch: the worker's suspend sweep requeues it.
            return true;
        }

        if ctx.status() == ServiceStatus::Blocked {
            ctx.set_status(ServiceStatus::Ready);
            drop(inner);
            self.ready.push(ctx.clone());
        }
        true
    }

    // ─── Control ─────────────────────────────────────────────────────────

    pub(crate) fn stop_service_ctx(&self, ctx: &Arc<ServiceContext>) {
        let inner = ctx.inner.lock();
        if ctx.stopping.swap(true, Ordering::Relaxed) {
            return;
        }
        self.wakeup_locked(ctx, inner, Events::STOP);
    }

    fn interrupt(&self, h: ServiceHandle) {
        let Some(ctx) = self.find_service(h) else {
            return;
        };
        let inner = ctx.inner.lock();
        if ctx.status() == ServiceStatus::Blocked && inner.wait_events.contains(Events::INTERRUPT)
        {
            self.wakeup_locked(&ctx, inner, Events::INTERRUPT);
        }
    }

    fn signal(&self, h: ServiceHandle) {
        let Some(ctx) = self.find_service(h) else {
            return;
        };
        self.wakeup_service(&ctx, Events::SIGNAL);
    }

    pub(crate) fn service_blocked_ms(&self, ctx: &ServiceContext) -> u64 {
        if ctx.status() == ServiceStatus::Blocked {
            let blocked = ctx.blocked_tick.load(Ordering::Relaxed);
            let ticks = self.wheel.current_tick().wrapping_sub(blocked);
            u64::from(ticks) * u64::from(TICK_MS)
        } else {
            0
        }
    }

    pub(crate) fn interrupt_if_blocked(
        self: &Arc<Core>,
        h: ServiceHandle,
        max_ms: u32,
    ) -> Status {
        if self.find_service(h).is_none() {
            return Err(Error::NotFound);
        }
        let watchdog = (*self.watchdog.lock()).ok_or(Error::NotFound)?;
        self.call_async(
            watchdog,
            move |w: &mut Watchdog, scope: &Scope<'_>| w.watch(scope, h, max_ms),
            None,
        )
    }

    // ─── Messaging ───────────────────────────────────────────────────────

    fn send(&self, msg: Message) -> Status {
        let Some(ctx) = self.find_service(msg.dest) else {
            return Err(Error::NotFound);
        };

        let mut inner = ctx.inner.lock();
        if ctx.is_stopping() || ctx.status() == ServiceStatus::Created {
            return Err(Error::NotFound);
        }

        inner.mailbox.push_back(msg);
        if inner.wait_events.contains(Events::MESSAGE) {
            self.wakeup_locked(&ctx, inner, Events::MESSAGE);
        }
        Ok(())
    }

    fn call<S, R, F>(self: &Arc<Core>, dest: ServiceHandle, f: F) -> Result<R, Error>
    where
        S: MethodService,
        R: Send + 'static,
        F: FnOnce(&mut S, &Scope<'_>) -> R + Send + 'static,
    {
        let cell: Arc<Mutex<Option<Result<R, Error>>>> = Arc::new(Mutex::new(None));

        let result_cell = cell.clone();
        let invocation = MethodInvocation::new(
            move |target: &mut dyn Any, scope: &Scope<'_>| -> Status {
                match target.downcast_mut::<S>() {
                    Some(svc) => {
                        let r = f(svc, scope);
                        *result_cell.lock() = Some(Ok(r));
                        Ok(())
                    }
                    None => Err(Error::InvalidArgument),
                }
            },
        );
        let mut msg = Message::call(dest, invocation);

        if let Some(caller) = current_service() {
            // Inside the runtime: wait cooperatively for the response.
            msg.source = Some(caller.handle);
            let src = caller.handle;
            let core = self.clone();
            let err_cell = cell.clone();
            msg.done = Some(Box::new(move |status: Status| {
                if let Err(e) = status {
                    let mut slot = err_cell.lock();
                    if slot.is_none() {
                        *slot = Some(Err(e));
                    }
                }
                core.wakeup(src, Events::RESPONSE);
            }));
            self.send(msg)?;
            let revents = self.wait_on(&caller, Events::RESPONSE);
            debug_assert!(revents.contains(Events::RESPONSE));
        } else {
            // Outside: block the calling thread on a condition variable.
            let gate = Arc::new((Mutex::new(false), Condvar::new()));
            let signal_gate = gate.clone();
            let err_cell = cell.clone();
            msg.done = Some(Box::new(move |status: Status| {
                if let Err(e) = status {
                    let mut slot = err_cell.lock();
                    if slot.is_none() {
                        *slot = Some(Err(e));
                    }
                }
                let (done, cond) = &*signal_gate;
                *done.lock() = true;
                cond.notify_one();
            }));
            self.send(msg)?;
            let (done, cond) = &*gate;
            let mut done = done.lock();
            while !*done {
                cond.wait(&mut done);
            }
        }

        let result = cell.lock().take();
        result.unwrap_or_else(|| Err(Error::failed("call completed without a result")))
    }

    pub(crate) fn call_async<S, F>(&self, dest: ServiceHandle, f: F, done: Option<DoneFn>) -> Status
    where
        S: MethodService,
        F: FnOnce(&mut S, &Scope<'_>) + Send + 'static,
    {
        let invocation = MethodInvocation::new(
            move |target: &mut dyn Any, scope: &Scope<'_>| -> Status {
                match target.downcast_mut::<S>() {
                    Some(svc) => {
                        f(svc, scope);
                        Ok(())
                    }
                    None => Err(Error::InvalidArgument),
                }
            },
        );
        let mut msg = Message::call(dest, invocation);
        msg.source = current_service().map(|c| c.handle);
        msg.done = done;
        self.send(msg)
    }

    // ─── Blocking primitives ─────────────────────────────────────────────

    pub(crate) fn sleep_on(self: &Arc<Core>, ctx: &Arc<ServiceContext>, ms: u32) -> Status {
        let h = ctx.handle;
        let core = Arc::downgrade(self);
        let timer = self.wheel.add_timer(ms, move || {
            if let Some(core) = core.upgrade() {
                core.wakeup(h, Events::SLEEP);
            }
        });

        let revents = self.wait_on(ctx, Events::SLEEP | Events::STOP | Events::INTERRUPT);
        if revents.contains(Events::SLEEP) {
            Ok(())
        } else {
            self.wheel.remove_timer(&timer);
            info!("sleep: {} interrupted by {:?}", ctx.name, revents);
            Err(Error::Interrupt)
        }
    }

    pub(crate) fn wait_signal_on(&self, ctx: &Arc<ServiceContext>) -> Status {
        let revents = self.wait_on(ctx, Events::SIGNAL | Events::STOP | Events::INTERRUPT);
        if revents.contains(Events::SIGNAL) {
            Ok(())
        } else {
            Err(Error::Interrupt)
        }
    }

    pub(crate) fn wait_input_on(&self, ctx: &Arc<ServiceContext>, fd: RawFd) -> Status {
        self.wait_io(ctx, fd, EpollFlags::EPOLLIN | EpollFlags::EPOLLET)
    }

    pub(crate) fn wait_output_on(&self, ctx: &Arc<ServiceContext>, fd: RawFd) -> Status {
        self.wait_io(ctx, fd, EpollFlags::EPOLLOUT | EpollFlags::EPOLLET)
    }

    fn wait_io(&self, ctx: &Arc<ServiceContext>, fd: RawFd, want: EpollFlags) -> Status {
        trace!("wait_io: {} fd {} {:?}", ctx.name, fd, want);
        let mut inner = ctx.inner.lock();
        inner.io_ready = EpollFlags::empty();
        inner.fd = fd;
        self.reactor.add(ctx.handle, fd, want)?;

        let (inner, revents) =
            self.wait_locked(ctx, inner, Events::IO | Events::STOP | Events::INTERRUPT);
        if revents.contains(Events::IO) {
            let ready = inner.io_ready.intersects(want);
            drop(inner);
            if ready {
                Ok(())
            } else {
                Err(Error::failed("fd readiness reported an error state"))
            }
        } else {
            drop(inner);
            let _ = self.reactor.remove(fd);
            info!("wait_io: {} interrupted by {:?}", ctx.name, revents);
            Err(Error::Interrupt)
        }
    }

    /// Reactor upcall: readiness arrived for a parked service.
    pub(crate) fn on_io_ready(&self, ctx: &Arc<ServiceContext>, ready: EpollFlags) {
        trace!("io ready: {} {:?}", ctx.name, ready);
        let mut inner = ctx.inner.lock();
        if inner.wait_events.contains(Events::IO) {
            inner.io_ready = ready;
            self.wakeup_locked(ctx, inner, Events::IO);
        }
    }

    pub(crate) fn yield_on(&self, ctx: &Arc<ServiceContext>) {
        let mut inner = ctx.inner.lock();
        // Not blocked: the suspend sweep requeues a Ready service directly.
        ctx.set_status(ServiceStatus::Ready);
        inner.is_swapping_out = true;
        let yielder = inner.yielder;
        drop(inner);
        // Safety: as in `wait_locked`.
        unsafe { yielder.get() }.suspend(());
    }
}

/// Dispatch one mailbox message of a method service: calls are re-entered
/// on the concrete type, everything else goes to the fallback handler.
fn dispatch_method(
    svc: &mut dyn crate::service::DynMethodService,
    scope: &Scope<'_>,
    msg: Message,
) {
    let Message {
        source,
        dest,
        payload,
        done,
    } = msg;
    match payload {
        Payload::Call(invocation) => {
            let status = invocation.invoke(svc.as_any_mut(), scope);
            if let Some(done) = done {
                done(status);
            }
        }
        payload => {
            let msg = Message {
                source,
                dest,
                payload,
                done,
            };
            svc.on_message(scope, msg);
        }
    }
}
