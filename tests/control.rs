//! Lifecycle, timers, interruption, and fd parking.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use coro_pool::{Error, Message, MessageService, Runtime, Scope, ServiceBody, StackSize};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn long_sleep_is_interruptible() {
    init_logging();
    let rt = Runtime::start(2).unwrap();
    let (tx, rx) = mpsc::channel();
    let h = rt
        .launch_fn("sleeper", move |scope| {
            tx.send(scope.sleep(10_000_000)).unwrap();
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(30));
    rt.interrupt(h);

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        Err(Error::Interrupt)
    );
    rt.stop();
}

#[test]
fn signal_wakes_wait_signal() {
    init_logging();
    let rt = Runtime::start(2).unwrap();
    let (tx, rx) = mpsc::channel();
    let h = rt
        .launch_fn("waiter", move |scope| {
            tx.send(scope.wait_signal()).unwrap();
        })
        .unwrap();

    rt.signal(h);
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), Ok(()));
    rt.stop();
}

#[test]
fn signal_before_wait_is_remembered() {
    init_logging();
    let rt = Runtime::start(2).unwrap();
    let (tx, rx) = mpsc::channel();
    let h = rt
        .launch_fn("late-waiter", move |scope| {
            // Give the signal time to arrive while we are not waiting for it.
            scope.sleep(50).unwrap();
            tx.send(scope.wait_signal()).unwrap();
        })
        .unwrap();

    rt.signal(h);
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), Ok(()));
    rt.stop();
}

#[test]
fn watchdog_interrupts_blocked_service() {
    init_logging();
    let rt = Runtime::builder().workers(2).start().unwrap();
    let (tx, rx) = mpsc::channel();
    let h = rt
        .launch_fn("stuck", move |scope| {
            let started = Instant::now();
            let r = scope.sleep(10_000_000);
            tx.send((r, started.elapsed())).unwrap();
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    assert!(rt.blocked_ms(h).is_some());
    rt.interrupt_if_blocked(h, 100).unwrap();

    let (r, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(r, Err(Error::Interrupt));
    assert!(elapsed >= Duration::from_millis(100), "woke after {:?}", elapsed);
    rt.stop();
}

#[test]
fn zero_sleep_returns_immediately() {
    init_logging();
    let rt = Runtime::start(2).unwrap();
    let (tx, rx) = mpsc::channel();
    rt.launch_fn("napper", move |scope| {
        let started = Instant::now();
        let r = scope.sleep(0);
        tx.send((r, started.elapsed())).unwrap();
    })
    .unwrap();

    let (r, elapsed) = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(r, Ok(()));
    assert!(elapsed < Duration::from_millis(100), "took {:?}", elapsed);
    rt.stop();
}

#[test]
fn interrupt_outside_interruptible_wait_is_lost() {
    init_logging();
    let rt = Runtime::start(2).unwrap();
    let (go_tx, go_rx) = mpsc::channel::<()>();
    let (tx, rx) = mpsc::channel();
    let h = rt
        .launch_fn("busy", move |scope| {
            // Spin (yielding) instead of blocking: no interruptible wait.
            while go_rx.try_recv().is_err() {
                scope.yield_now();
            }
            tx.send(scope.sleep(200)).unwrap();
        })
        .unwrap();

    rt.interrupt(h);
    std::thread::sleep(Duration::from_millis(20));
    rt.interrupt(h);
    go_tx.send(()).unwrap();

    // The dropped interrupts must not spuriously end the later sleep.
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), Ok(()));
    rt.stop();
}

#[test]
fn fd_readiness_wakes_waiter() {
    init_logging();
    let rt = Runtime::start(2).unwrap();
    let (read_end, write_end) = nix::unistd::pipe().unwrap();
    let mut writer = File::from(write_end);

    let (tx, rx) = mpsc::channel();
    rt.launch_fn("reader", move |scope| {
        let mut reader = File::from(read_end);
        let status = scope.wait_input(reader.as_raw_fd());
        let mut buf = [0u8; 8];
        let n = reader.read(&mut buf).unwrap();
        tx.send((status, n)).unwrap();
    })
    .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    writer.write_all(b"x").unwrap();

    let (status, n) = rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(status, Ok(()));
    assert_eq!(n, 1);
    rt.stop();
}

#[test]
fn stop_unblocks_fd_waiters() {
    init_logging();
    let rt = Runtime::start(2).unwrap();
    let (read_end, write_end) = nix::unistd::pipe().unwrap();

    let (tx, rx) = mpsc::channel();
    rt.launch_fn("parked", move |scope| {
        let reader = File::from(read_end);
        tx.send(scope.wait_input(reader.as_raw_fd())).unwrap();
    })
    .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    let started = Instant::now();
    rt.stop();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert_eq!(
        rx.recv_timeout(RECV_TIMEOUT).unwrap(),
        Err(Error::Interrupt)
    );
    drop(write_end);
}

struct Quiet {
    stopped_tx: mpsc::Sender<()>,
}

impl MessageService for Quiet {
    fn handle(&mut self, _scope: &Scope<'_>, mut msg: Message) {
        msg.done(Ok(()));
    }

    fn on_stop(&mut self, _scope: &Scope<'_>) {
        self.stopped_tx.send(()).unwrap();
    }
}

#[test]
fn stop_service_is_idempotent() {
    init_logging();
    let rt = Runtime::start(2).unwrap();
    let (stopped_tx, stopped_rx) = mpsc::channel();
    let h = rt
        .launch(
            "quiet",
            StackSize::Small,
            ServiceBody::message(Quiet { stopped_tx }),
        )
        .unwrap();

    assert!(rt.stop_service(h));
    rt.stop_service(h);

    stopped_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(stopped_rx.try_recv().is_err(), "on_stop ran twice");
    rt.stop();
}

#[test]
fn runtime_stop_is_idempotent() {
    init_logging();
    let rt = Runtime::start(2).unwrap();

    let waiter = {
        let rt = rt.clone();
        std::thread::spawn(move || rt.wait_stop())
    };

    std::thread::sleep(Duration::from_millis(50));
    rt.stop();
    rt.stop();
    waiter.join().unwrap();

    assert!(rt.is_stopped());
    assert!(rt.launch_fn("late", |_scope| {}).is_err());
}

#[test]
fn wait_output_on_writable_pipe_returns_quickly() {
    init_logging();
    let rt = Runtime::start(2).unwrap();
    let (read_end, write_end) = nix::unistd::pipe().unwrap();

    let (tx, rx) = mpsc::channel();
    rt.launch_fn("writer", move |scope| {
        let writer = File::from(write_end);
        // An empty pipe is writable; the wait should complete promptly.
        tx.send(scope.wait_output(writer.as_raw_fd())).unwrap();
    })
    .unwrap();

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), Ok(()));
    drop(read_end);
    rt.stop();
}

#[test]
fn services_can_launch_services() {
    init_logging();
    let rt = Runtime::start(2).unwrap();
    let (tx, rx) = mpsc::channel();

    rt.launch_fn("parent", move |scope| {
        let tx = tx.clone();
        scope
            .runtime()
            .launch_fn("child", move |child_scope| {
                tx.send(child_scope.name().to_string()).unwrap();
            })
            .unwrap();
    })
    .unwrap();

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), "child");
    rt.stop();
}

#[test]
fn runtimes_are_independent() {
    init_logging();
    let a = Runtime::start(1).unwrap();
    let b = Runtime::start(1).unwrap();

    let (tx_a, rx_a) = mpsc::channel();
    let (tx_b, rx_b) = mpsc::channel();
    a.launch_fn("in-a", move |_| tx_a.send("a").unwrap()).unwrap();
    b.launch_fn("in-b", move |_| tx_b.send("b").unwrap()).unwrap();

    assert_eq!(rx_a.recv_timeout(RECV_TIMEOUT).unwrap(), "a");
    assert_eq!(rx_b.recv_timeout(RECV_TIMEOUT).unwrap(), "b");

    a.stop();
    // The second runtime keeps working after the first stops.
    let (tx, rx) = mpsc::channel();
    b.launch_fn("still-alive", move |_| tx.send(()).unwrap()).unwrap();
    rx.recv_timeout(RECV_TIMEOUT).unwrap();
    b.stop();
}

#[test]
fn many_sleepers_all_wake() {
    init_logging();
    let rt = Runtime::start(4).unwrap();
    let (tx, rx) = mpsc::channel();

    for i in 0..100u32 {
        let tx = tx.clone();
        rt.launch_fn(format!("sleeper-{}", i), move |scope| {
            // Spread wakeups across a few wheel slots.
            scope.sleep(10 + (i % 7) * 10).unwrap();
            tx.send(i).unwrap();
        })
        .unwrap();
    }
    drop(tx);

    let mut woken = Vec::new();
    for _ in 0..100 {
        woken.push(rx.recv_timeout(RECV_TIMEOUT).unwrap());
    }
    woken.sort_unstable();
    assert_eq!(woken, (0..100).collect::<Vec<u32>>());
    rt.stop();
}

#[test]
fn timers_fire_and_cancel() {
    init_logging();
    let rt = Runtime::start(2).unwrap();
    let (tx, rx) = mpsc::channel();

    let cancelled_tx = tx.clone();
    let _kept = rt.add_timer(30, move || {
        tx.send("fired").unwrap();
    });
    let cancelled = rt.add_timer(30, move || {
        cancelled_tx.send("cancelled").unwrap();
    });

    assert!(rt.remove_timer(&cancelled));
    assert!(!rt.remove_timer(&cancelled));

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), "fired");
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    rt.stop();
}
