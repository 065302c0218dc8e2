//! The I/O reactor: parks services on fd readiness.
//!
//! Registration is edge-triggered and one-shot in effect: the reactor
//! deregisters an fd before dispatching its readiness, and the service must
//! re-issue the wait for further events. The payload stored with the kernel
//! is the service's handle index; the shutdown sentinel has the top bit set
//! and is armed by writing an eventfd.

use std::os::unix::io::{BorrowedFd, RawFd};

use byteorder::{ByteOrder, NativeEndian};
use log::{info, trace, warn};
use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use nix::unistd;

use crate::handle::ServiceHandle;
use crate::runtime::Core;
use crate::status::{Error, Status};

/// Sentinel payload for the stop event; negative when read back as i64.
const STOP_TOKEN: u64 = u64::MAX;

pub(crate) struct Reactor {
    epoll: Epoll,
    stop_event: EventFd,
}

impl Reactor {
    pub fn new() -> Result<Reactor, Error> {
        let epoll = Epoll::new(EpollCreateFlags::empty())
            .map_err(|e| Error::failed(format!("epoll_create1 failed: {}", e)))?;
        let stop_event = EventFd::from_value_and_flags(0, EfdFlags::empty())
            .map_err(|e| Error::failed(format!("eventfd failed: {}", e)))?;
        epoll
            .add(&stop_event, EpollEvent::new(EpollFlags::EPOLLIN, STOP_TOKEN))
            .map_err(|e| Error::failed(format!("epoll_ctl add stop event failed: {}", e)))?;
        Ok(Reactor { epoll, stop_event })
    }

    /// Register one-shot interest in `fd` on behalf of the service named by
    /// `handle`. At most one waiting service per fd.
    pub fn add(&self, handle: ServiceHandle, fd: RawFd, interest: EpollFlags) -> Status {
        trace!("reactor: add {} fd {} {:?}", handle, fd, interest);
        debug_assert!(fd >= 0);
        // Safety: the caller keeps the fd open for the duration of the wait;
        // the registration is removed before readiness is dispatched.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll
            .add(borrowed, EpollEvent::new(interest, handle.index() as u64))
            .map_err(|e| Error::failed(format!("epoll_ctl add failed: {}", e)))
    }

    /// Drop the registration for `fd`. Safe to call after the fd was closed:
    /// the kernel's refusal is ignored.
    pub fn remove(&self, fd: RawFd) -> Status {
        trace!("reactor: remove fd {}", fd);
        // Safety: only the raw descriptor number is needed for EPOLL_CTL_DEL.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        match self.epoll.delete(borrowed) {
            Ok(()) => Ok(()),
            Err(Errno::ENOENT) | Err(Errno::EBADF) => Ok(()),
            Err(e) => Err(Error::failed(format!("epoll_ctl del failed: {}", e))),
        }
    }

    /// Event loop. Blocks on the kernel with no timeout; for each readiness
    /// report, deregisters the fd and wakes the owning service. Returns when
    /// the stop sentinel fires.
    pub fn run(&self, core: &Core) {
        let mut events = [EpollEvent::empty(); 32];
        loop {
            let n = match self.epoll.wait(&mut events, EpollTimeout::NONE) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("reactor: epoll_wait failed, stopping: {}", e);
                    return;
                }
            };

            for event in &events[..n] {
                if (event.data() as i64) < 0 {
                    info!("reactor: stop");
                    return;
                }

                let handle = ServiceHandle::from_index(event.data() as i64);
                let Some(ctx) = core.find_service(handle) else {
                    continue;
                };
                let fd = ctx.inner.lock().fd;
                if fd >= 0 {
                    let _ = self.remove(fd);
                }
                core.on_io_ready(&ctx, event.events());
            }
        }
    }

    /// Unblock the event loop. A single 8-byte write; idempotent.
    pub fn stop(&self) {
        let mut buf = [0u8; 8];
        NativeEndian::write_u64(&mut buf, 1);
        if let Err(e) = unistd::write(&self.stop_event, &buf) {
            warn!("reactor: stop write failed: {}", e);
        }
    }
}
