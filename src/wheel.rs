//! The clock and its hierarchical timing wheel.
//!
//! Tens of thousands of timers with O(1) insertion and cancellation. Four
//! cascading wheels: a 256-slot wheel keyed on the low byte of the expiry
//! tick, then four 64-slot wheels keyed on successive 6-bit groups; together
//! they address the full range of the 32-bit tick counter. Each tick the
//! current low-byte slot is spliced out under the lock and fired outside it;
//! when the low byte wraps, the next wheel's current slot is cascaded back
//! down to its refined position.
//!
//! The clock thread sleeps for half a quantum, computes the elapsed whole
//! ticks, and applies each one exactly once.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Length of one wheel tick in milliseconds.
pub(crate) const TICK_MS: u32 = 10;

const SECTION1_BITS: u32 = 8;
const SECTION2_BITS: u32 = 6;
const SECTION1_NUM: u32 = 1 << SECTION1_BITS;
const SECTION2_NUM: u32 = 1 << SECTION2_BITS;
const SECTION1_MASK: u32 = SECTION1_NUM - 1;
const SECTION2_MASK: u32 = SECTION2_NUM - 1;

type Callback = Box<dyn FnOnce() + Send + 'static>;
type TimerList = Vec<Arc<TimerEntry>>;

pub(crate) struct TimerEntry {
    /// Absolute expiry tick.
    tick: u32,
    /// Taken exactly once, by the firing tick or by cancellation.
    callback: Mutex<Option<Callback>>,
}

/// Cancellation handle for a registered timer.
///
/// Holds only a weak reference: once the timer has fired, the handle expires
/// and cancellation becomes a no-op.
#[derive(Clone, Default)]
pub struct TimerHandle(Weak<TimerEntry>);

impl TimerHandle {
    fn expired() -> TimerHandle {
        TimerHandle(Weak::new())
    }

    /// True once the timer has fired (or was never registered).
    pub fn is_expired(&self) -> bool {
        self.0.strong_count() == 0
    }
}

struct WheelState {
    section1: [TimerList; SECTION1_NUM as usize],
    section2: [[TimerList; SECTION2_NUM as usize]; 4],
}

impl WheelState {
    fn insert(&mut self, cur_tick: u32, entry: Arc<TimerEntry>) {
        let dx = entry.tick.wrapping_sub(cur_tick);
        if dx < SECTION1_NUM {
            let i = (entry.tick & SECTION1_MASK) as usize;
            self.section1[i].push(entry);
        } else if dx < SECTION1_NUM * SECTION2_NUM {
            self.insert_section2(0, entry);
        } else if dx < SECTION1_NUM * SECTION2_NUM * SECTION2_NUM {
            self.insert_section2(1, entry);
        } else if dx < SECTION1_NUM * SECTION2_NUM * SECTION2_NUM * SECTION2_NUM {
            self.insert_section2(2, entry);
        } else {
            self.insert_section2(3, entry);
        }
    }

    fn insert_section2(&mut self, section: usize, entry: Arc<TimerEntry>) {
        let i = section2_index(entry.tick, section) as usize;
        self.section2[section][i].push(entry);
    }
}

fn section2_index(tick: u32, section: usize) -> u32 {
    (tick >> (SECTION1_BITS + SECTION2_BITS * section as u32)) & SECTION2_MASK
}

pub(crate) struct TimingWheel {
    state: Mutex<WheelState>,
    cur_tick: AtomicU32,
}

impl TimingWheel {
    pub fn new() -> TimingWheel {
        TimingWheel {
            state: Mutex::new(WheelState {
                section1: std::array::from_fn(|_| Vec::new()),
                section2: std::array::from_fn(|_| std::array::from_fn(|_| Vec::new())),
            }),
            cur_tick: AtomicU32::new(1),
        }
    }

    pub fn current_tick(&self) -> u32 {
        self.cur_tick.load(Ordering::Relaxed)
    }

    /// Register `callback` to fire once, roughly `timeout_ms` from now.
    ///
    /// A timeout that rounds to zero ticks fires the callback synchronously
    /// and returns an expired handle.
    pub fn add_timer(
        &self,
        timeout_ms: u32,
        callback: impl FnOnce() + Send + 'static,
    ) -> TimerHandle {
        let ticks = (timeout_ms + TICK_MS / 2) / TICK_MS;
        if ticks == 0 {
            callback();
            return TimerHandle::expired();
        }

        let mut state = self.state.lock();
        let cur = self.cur_tick.load(Ordering::Relaxed);
        let entry = Arc::new(TimerEntry {
            tick: cur.wrapping_add(ticks),
            callback: Mutex::new(Some(Box::new(callback))),
        });
        let handle = TimerHandle(Arc::downgrade(&entry));
        state.insert(cur, entry);
        handle
    }

    /// Cancel a registered timer. Returns false if it already fired or was
    /// already cancelled. A cancelled timer never fires.
    pub fn remove_timer(&self, handle: &TimerHandle) -> bool {
        let Some(entry) = handle.0.upgrade() else {
            return false;
        };
        let _state = self.state.lock();
        let had_callback = entry.callback.lock().take().is_some();
        had_callback
    }

    /// Apply one tick: cascade on section boundaries, then fire the current
    /// slot. Callbacks run outside the wheel lock.
    pub fn update(&self, tick: u32) {
        if tick & SECTION1_MASK == 0
            && self.cascade(tick, 0)
            && self.cascade(tick, 1)
            && self.cascade(tick, 2)
        {
            self.cascade(tick, 3);
        }

        let due = {
            let mut state = self.state.lock();
            let i = (tick & SECTION1_MASK) as usize;
            mem::take(&mut state.section1[i])
        };
        for entry in due {
            if let Some(callback) = entry.callback.lock().take() {
                callback();
            }
        }
    }

    /// Move the current slot of a section-2 wheel down to its refined
    /// position. Returns true when that slot's index has wrapped to zero and
    /// the next wheel must cascade too.
    fn cascade(&self, tick: u32, section: usize) -> bool {
        let i = section2_index(tick, section);
        let mut state = self.state.lock();
        let list = mem::take(&mut state.section2[section][i as usize]);
        for entry in list {
            state.insert(tick, entry);
        }
        i == 0
    }

    /// Clock loop: runs until `shutdown` is set, applying every elapsed tick
    /// exactly once.
    pub fn run(&self, shutdown: &AtomicBool) {
        let start = Instant::now();
        let mut applied: u64 = 0;
        while !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(u64::from(TICK_MS) / 2));
            let elapsed = start.elapsed().as_millis() as u64 / u64::from(TICK_MS);
            while applied < elapsed {
                let tick = self.cur_tick.fetch_add(1, Ordering::Relaxed);
                self.update(tick);
                applied += 1;
            }
        }
    }

    #[cfg(test)]
    fn set_current_tick(&self, tick: u32) {
        self.cur_tick.store(tick, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> usize) {
        let count = Arc::new(AtomicUsize::new(0));
        let read = {
            let count = count.clone();
            move || count.load(Ordering::SeqCst)
        };
        (count, read)
    }

    fn bump(count: &Arc<AtomicUsize>) -> impl FnOnce() + Send + 'static {
        let count = count.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn zero_timeout_fires_synchronously() {
        let wheel = TimingWheel::new();
        let (count, read) = counter();
        let handle = wheel.add_timer(0, bump(&count));
        assert_eq!(read(), 1);
        assert!(handle.is_expired());
    }

    #[test]
    fn one_tick_timer_fires_on_the_next_tick() {
        let wheel = TimingWheel::new();
        let (count, read) = counter();
        wheel.add_timer(TICK_MS, bump(&count));
        let cur = wheel.current_tick();
        wheel.update(cur);
        assert_eq!(read(), 0);
        wheel.set_current_tick(cur + 1);
        wheel.update(cur + 1);
        assert_eq!(read(), 1);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let wheel = TimingWheel::new();
        let (count, read) = counter();
        let handle = wheel.add_timer(TICK_MS, bump(&count));
        assert!(wheel.remove_timer(&handle));
        assert!(!wheel.remove_timer(&handle));
        let cur = wheel.current_tick();
        wheel.set_current_tick(cur + 1);
        wheel.update(cur + 1);
        assert_eq!(read(), 0);
    }

    /// Advance the wheel tick by tick across `ticks` ticks, starting at 0.
    fn advance(wheel: &TimingWheel, ticks: u32) {
        for t in 1..=ticks {
            wheel.set_current_tick(t);
            wheel.update(t);
        }
    }

    #[test]
    fn fires_at_section1_edge() {
        let wheel = TimingWheel::new();
        wheel.set_current_tick(0);
        let (count, read) = counter();
        wheel.add_timer(TICK_MS * (SECTION1_NUM - 1), bump(&count));
        advance(&wheel, SECTION1_NUM - 2);
        assert_eq!(read(), 0);
        wheel.set_current_tick(SECTION1_NUM - 1);
        wheel.update(SECTION1_NUM - 1);
        assert_eq!(read(), 1);
    }

    #[test]
    fn fires_at_section_boundaries() {
        for timeout in [
            SECTION1_NUM,
            SECTION1_NUM * SECTION2_NUM,
            SECTION1_NUM * SECTION2_NUM * SECTION2_NUM,
        ] {
            let wheel = TimingWheel::new();
            wheel.set_current_tick(0);
            let (count, read) = counter();
            wheel.add_timer(TICK_MS * timeout, bump(&count));
            advance(&wheel, timeout - 1);
            assert_eq!(read(), 0, "timeout {} fired early", timeout);
            wheel.set_current_tick(timeout);
            wheel.update(timeout);
            assert_eq!(read(), 1, "timeout {} did not fire", timeout);
        }
    }

    #[test]
    fn cascade_fires_exactly_once() {
        let wheel = TimingWheel::new();
        wheel.set_current_tick(0);
        let (count, read) = counter();
        let ticks = SECTION1_NUM * SECTION2_NUM + 1;
        wheel.add_timer(TICK_MS * ticks, bump(&count));
        advance(&wheel, ticks);
        assert_eq!(read(), 1);
        advance_more(&wheel, ticks, SECTION1_NUM * 2);
        assert_eq!(read(), 1);
    }

    fn advance_more(wheel: &TimingWheel, from: u32, ticks: u32) {
        for t in from + 1..=from + ticks {
            wheel.set_current_tick(t);
            wheel.update(t);
        }
    }

    #[test]
    fn deep_section_timer_survives_cascades() {
        let wheel = TimingWheel::new();
        wheel.set_current_tick(0);
        let (count, read) = counter();
        let ticks = SECTION1_NUM * SECTION2_NUM * SECTION2_NUM + 7;
        wheel.add_timer(TICK_MS.wrapping_mul(ticks), bump(&count));
        advance(&wheel, ticks - 1);
        assert_eq!(read(), 0);
        wheel.set_current_tick(ticks);
        wheel.update(ticks);
        assert_eq!(read(), 1);
    }
}
