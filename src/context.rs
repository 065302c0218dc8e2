//! The per-service control block.
//!
//! Once launched, a service's context is owned by the scheduler. The hot
//! fields (mailbox, event word, swap flags, the coroutine itself) live under
//! one mutex; status, the stop latch, and the blocked/woken tick stamps are
//! atomics so the watchdog can account for blocked time without taking the
//! lock.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use corosensei::{Coroutine, Yielder};
use nix::sys::epoll::EpollFlags;
use parking_lot::Mutex;

use crate::event::Events;
use crate::handle::ServiceHandle;
use crate::message::Message;

/// Stack presets for launched services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StackSize {
    VerySmall,
    Small,
    #[default]
    Normal,
    Large,
    VeryLarge,
}

impl StackSize {
    pub fn bytes(self) -> usize {
        match self {
            StackSize::VerySmall => 32 * 1024,
            StackSize::Small => 128 * 1024,
            StackSize::Normal => 1024 * 1024,
            StackSize::Large => 4 * 1024 * 1024,
            StackSize::VeryLarge => 8 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum ServiceStatus {
    Created = 1,
    Blocked,
    Ready,
    Running,
    Dead,
}

impl ServiceStatus {
    fn from_u8(v: u8) -> ServiceStatus {
        match v {
            1 => ServiceStatus::Created,
            2 => ServiceStatus::Blocked,
            3 => ServiceStatus::Ready,
            4 => ServiceStatus::Running,
            5 => ServiceStatus::Dead,
            x => panic!("bad service status ({}). Please report this error.", x),
        }
    }
}

pub(crate) type ServiceCo = Coroutine<(), (), ()>;

/// A service coroutine, movable between worker threads.
pub(crate) struct SendCo(pub ServiceCo);

// Safety: the scheduler guarantees that at most one worker resumes a given
// coroutine at any instant (a Ready service is in the queue exactly once,
// and the coroutine travels with it by take/put under the context lock).
// Everything the trampoline closures capture is Send.
unsafe impl Send for SendCo {}

/// Raw pointer to the yielder of the currently running trampoline.
///
/// Written at trampoline entry, cleared at exit; the yielder lives on the
/// coroutine's own stack and outlives every suspension point. Only the
/// service itself dereferences it, from inside its coroutine.
#[derive(Clone, Copy)]
pub(crate) struct YielderRef(*const Yielder<(), ()>);

unsafe impl Send for YielderRef {}

impl YielderRef {
    pub fn null() -> YielderRef {
        YielderRef(std::ptr::null())
    }

    pub fn new(y: &Yielder<(), ()>) -> YielderRef {
        YielderRef(y as *const _)
    }

    /// # Safety
    ///
    /// Must only be called from the coroutine the yielder belongs to, while
    /// that coroutine is running.
    pub unsafe fn get<'a>(self) -> &'a Yielder<(), ()> {
        assert!(
            !self.0.is_null(),
            "wait outside a running service. Please report this error."
        );
        &*self.0
    }
}

pub(crate) struct ContextInner {
    pub mailbox: VecDeque<Message>,
    /// Pending wake reasons; sticky until consumed by a matching wait.
    pub events: Events,
    /// What the service is currently waiting on; empty while running.
    pub wait_events: Events,
    /// Set when a wake lands during the context-switch window.
    pub wakeup_signal: bool,
    /// Set between deciding to switch out and completing the switch.
    pub is_swapping_out: bool,
    /// Readiness reported by the reactor for the current I/O wait.
    pub io_ready: EpollFlags,
    /// The fd of the current reactor registration, if any.
    pub fd: RawFd,
    /// Advisory: index of the worker that last ran this service.
    pub last_thread: i32,
    /// Present while the service is suspended; taken by the resuming worker.
    pub co: Option<SendCo>,
    pub yielder: YielderRef,
}

pub(crate) struct ServiceContext {
    pub name: String,
    pub handle: ServiceHandle,
    status: AtomicU8,
    pub stopping: AtomicBool,
    /// Tick at which the service last blocked (watchdog accounting).
    pub blocked_tick: AtomicU32,
    /// Tick at which the service last resumed.
    pub wakeup_tick: AtomicU32,
    pub inner: Mutex<ContextInner>,
}

impl ServiceContext {
    pub fn new(name: String, handle: ServiceHandle) -> ServiceContext {
        ServiceContext {
            name,
            handle,
            status: AtomicU8::new(ServiceStatus::Created as u8),
            stopping: AtomicBool::new(false),
            blocked_tick: AtomicU32::new(0),
            wakeup_tick: AtomicU32::new(0),
            inner: Mutex::new(ContextInner {
                mailbox: VecDeque::new(),
                events: Events::empty(),
                wait_events: Events::empty(),
                wakeup_signal: false,
                is_swapping_out: false,
                io_ready: EpollFlags::empty(),
                fd: -1,
                last_thread: -1,
                co: None,
                yielder: YielderRef::null(),
            }),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    pub fn set_status(&self, s: ServiceStatus) {
        self.status.store(s as u8, Ordering::Relaxed);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }
}
