//! Discrete-event virtual time driver for Embassy.
//!
//! This module implements the global `embassy_time_driver::Driver` used by all
//! timed waits in the simulator. Unlike a wall-clock driver, the clock here is
//! purely virtual: `now` is an atomic tick counter that only moves when the
//! executor decides that every task is suspended, at which point it jumps
//! directly to the earliest scheduled deadline. A six-hundred-thousand-second
//! run therefore completes as fast as the host can poll futures.
//!
//! Scheduling contract:
//!
//! - `schedule_wake` files the waker under its deadline in a `BTreeMap`; wakers
//!   registered for the same instant are kept in registration order and woken
//!   in that order, which together with the executor's fixed polling order
//!   gives the deterministic node-id tie-break the simulation relies on.
//! - A deadline at or before the current virtual instant wakes immediately
//!   (embassy's `Timer` yields once even for zero-length waits).
//! - `advance_to` is only called from the executor between polling sweeps, so
//!   no task ever observes the clock moving underneath it.
//!
//! The driver state is process-global. Anything that runs a simulation (or a
//! test touching the clock) must hold [`sim_lock`] for the whole run and call
//! [`reset`] first; `cargo test` runs tests on multiple threads and two
//! simulations sharing one clock would corrupt each other.

use core::task::Waker;
use embassy_time_driver::{Driver, TICK_HZ, time_driver_impl};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

/// Current virtual time in Embassy ticks.
static NOW_TICKS: AtomicU64 = AtomicU64::new(0);

/// Pending wakeups: virtual-tick deadline -> wakers in registration order.
static QUEUE: OnceLock<Mutex<BTreeMap<u64, Vec<Waker>>>> = OnceLock::new();

/// Serializes whole simulation runs (and clock-touching tests).
static SIM_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn queue() -> &'static Mutex<BTreeMap<u64, Vec<Waker>>> {
    QUEUE.get_or_init(|| Mutex::new(BTreeMap::new()))
}

/// Acquire the process-wide simulation lock. The guard must be held for as
/// long as the caller uses the virtual clock.
pub(crate) fn sim_lock() -> MutexGuard<'static, ()> {
    let lock = SIM_LOCK.get_or_init(|| Mutex::new(()));
    // A panicking test poisons the lock; the clock itself is reset on every
    // run, so the poison carries no information we need.
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reset the clock to zero and drop every pending wakeup.
/// Call once per simulation run, with [`sim_lock`] held.
pub(crate) fn reset() {
    queue().lock().unwrap().clear();
    NOW_TICKS.store(0, Ordering::Relaxed);
}

struct VirtualDriver;

impl Driver for VirtualDriver {
    fn now(&self) -> u64 {
        NOW_TICKS.load(Ordering::Relaxed)
    }

    fn schedule_wake(&self, at: u64, waker: &Waker) {
        if at <= NOW_TICKS.load(Ordering::Relaxed) {
            // Already due; embassy re-polls and completes the timer.
            waker.wake_by_ref();
            return;
        }
        queue().lock().unwrap().entry(at).or_default().push(waker.clone());
    }
}

// Register as the global time driver for embassy-time
time_driver_impl!(static DRIVER: VirtualDriver = VirtualDriver);

/// Current virtual time in milliseconds.
pub(crate) fn now_ms() -> f64 {
    ticks_to_ms(NOW_TICKS.load(Ordering::Relaxed))
}

/// Earliest pending deadline in ticks, if any wait is scheduled.
pub(crate) fn next_deadline() -> Option<u64> {
    queue().lock().unwrap().keys().next().copied()
}

/// Jump the clock to `at` and wake everything due at or before it.
/// Wakers fire in deadline order, then registration order within a deadline.
pub(crate) fn advance_to(at: u64) {
    NOW_TICKS.store(at, Ordering::Relaxed);
    let due: Vec<Waker> = {
        let mut guard = queue().lock().unwrap();
        let later = guard.split_off(&(at + 1));
        let due = std::mem::replace(&mut *guard, later);
        due.into_values().flatten().collect()
    };
    // Wake outside the lock: waking marks executor tasks ready, and a woken
    // timer may immediately re-register with an earlier-than-next deadline.
    for waker in due {
        waker.wake();
    }
}

pub(crate) fn ms_to_ticks(ms: f64) -> u64 {
    if ms <= 0.0 {
        return 0;
    }
    (ms * TICK_HZ as f64 / 1000.0).round() as u64
}

pub(crate) fn ticks_to_ms(ticks: u64) -> f64 {
    ticks as f64 * 1000.0 / TICK_HZ as f64
}

/// Convert a millisecond wait into an embassy `Duration`, clamping negative
/// values (a NAV already contained in a listening window) to zero.
pub(crate) fn ms_duration(ms: f64) -> embassy_time::Duration {
    embassy_time::Duration::from_ticks(ms_to_ticks(ms.max(0.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::task::Wake;

    struct Flag(AtomicBool);

    impl Wake for Flag {
        fn wake(self: Arc<Self>) {
            self.0.store(true, Ordering::Relaxed);
        }
    }

    #[test]
    fn advance_wakes_due_deadlines_only() {
        let _guard = sim_lock();
        reset();

        let early = Arc::new(Flag(AtomicBool::new(false)));
        let late = Arc::new(Flag(AtomicBool::new(false)));
        VirtualDriver.schedule_wake(ms_to_ticks(10.0), &Waker::from(early.clone()));
        VirtualDriver.schedule_wake(ms_to_ticks(20.0), &Waker::from(late.clone()));

        advance_to(ms_to_ticks(10.0));
        assert!(early.0.load(Ordering::Relaxed));
        assert!(!late.0.load(Ordering::Relaxed));
        assert!((now_ms() - 10.0).abs() <= 500.0 / TICK_HZ as f64);

        advance_to(ms_to_ticks(20.0));
        assert!(late.0.load(Ordering::Relaxed));
    }

    #[test]
    fn past_deadline_wakes_immediately() {
        let _guard = sim_lock();
        reset();

        advance_to(ms_to_ticks(5.0));
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        VirtualDriver.schedule_wake(ms_to_ticks(1.0), &Waker::from(flag.clone()));
        assert!(flag.0.load(Ordering::Relaxed));
        assert_eq!(next_deadline(), None);
    }

    #[test]
    fn ms_tick_round_trip() {
        // Round-trip error is bounded by half a tick.
        let ms = 401.408;
        let back = ticks_to_ms(ms_to_ticks(ms));
        assert!((back - ms).abs() <= 500.0 / TICK_HZ as f64);
        assert_eq!(ms_to_ticks(-3.0), 0);
    }
}
