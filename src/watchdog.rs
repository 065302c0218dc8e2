//! The blocked-deadline watchdog.
//!
//! A built-in method service holding `(handle, max_blocked_ms)` entries. On
//! a periodic timer — the minimum of the registered deadlines, floored — it
//! walks the list: entries whose service is gone are dropped, and a service
//! blocked past its deadline is interrupted and its entry dropped. Waits that
//! are not interruptible (a mailbox wait) are left alone.

use std::sync::Weak;

use log::{info, trace, warn};

use crate::handle::ServiceHandle;
use crate::runtime::Core;
use crate::scope::Scope;
use crate::service::MethodService;
use crate::wheel::TimerHandle;

struct Entry {
    handle: ServiceHandle,
    max_blocked_ms: u32,
}

pub(crate) struct Watchdog {
    entries: Vec<Entry>,
    interval_ms: u32,
    floor_ms: u32,
    timer: TimerHandle,
    core: Weak<Core>,
}

impl Watchdog {
    pub fn new(core: &std::sync::Arc<Core>, interval_ms: u32, floor_ms: u32) -> Watchdog {
        Watchdog {
            entries: Vec::new(),
            interval_ms,
            floor_ms,
            timer: TimerHandle::default(),
            core: std::sync::Arc::downgrade(core),
        }
    }

    pub fn start(&mut self, scope: &Scope<'_>) {
        trace!("watchdog online");
        if !self.entries.is_empty() {
            self.arm(scope);
        }
    }

    /// Register a deadline. A short deadline may shrink the polling
    /// interval, never below the floor.
    pub fn watch(&mut self, scope: &Scope<'_>, handle: ServiceHandle, max_blocked_ms: u32) {
        let max_blocked_ms = max_blocked_ms.max(self.floor_ms);
        if max_blocked_ms < self.interval_ms {
            self.interval_ms = max_blocked_ms;
        }
        self.entries.push(Entry {
            handle,
            max_blocked_ms,
        });
        if self.timer.is_expired() {
            self.arm(scope);
        }
    }

    fn arm(&mut self, scope: &Scope<'_>) {
        let me = scope.handle();
        let core = self.core.clone();
        self.timer = scope.runtime().add_timer(self.interval_ms, move || {
            let Some(core) = core.upgrade() else {
                return;
            };
            let r = core.call_async(
                me,
                |w: &mut Watchdog, scope: &Scope<'_>| w.poll_entries(scope),
                None,
            );
            if let Err(e) = r {
                warn!("watchdog: self-call failed: {}", e);
            }
        });
    }

    /// One pass over the registered deadlines.
    pub fn poll_entries(&mut self, scope: &Scope<'_>) {
        let runtime = scope.runtime();
        self.entries.retain(|entry| {
            match runtime.blocked_ms(entry.handle) {
                // Service is gone; nothing left to watch.
                None => false,
                Some(ms) if ms > u64::from(entry.max_blocked_ms) => {
                    info!(
                        "watchdog: interrupting {} (blocked {} ms, deadline {} ms)",
                        entry.handle, ms, entry.max_blocked_ms
                    );
                    runtime.interrupt(entry.handle);
                    false
                }
                Some(_) => true,
            }
        });

        if !scope.is_stopping() && !self.entries.is_empty() {
            self.arm(scope);
        }
    }
}

impl MethodService for Watchdog {
    fn on_stop(&mut self, scope: &Scope<'_>) {
        scope.runtime().remove_timer(&self.timer);
    }
}
