//! Deterministic cooperative executor over the virtual clock.
//!
//! One future per simulated node, polled on a single thread. The loop
//! alternates two steps:
//!
//! 1. Poll every ready task in spawn (node-id) order until no task is ready.
//! 2. Jump the virtual clock to the earliest scheduled deadline, waking the
//!    timers due there, and go back to step 1.
//!
//! Tasks suspend only inside `embassy_time::Timer` waits, so between two polls
//! of the same task no other task has observed an intermediate state — the
//! cooperative-atomicity guarantee the MAC logic depends on (a CCA check and
//! the transmission it clears happen in one non-suspending section). Events
//! scheduled for the same virtual instant run in node-id order because wakers
//! fire in registration order and the polling sweep is in spawn order.
//!
//! The run ends when every task has returned, or when the next deadline lies
//! beyond the caller's virtual time limit.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Wake, Waker};

use crate::time_driver;

/// Per-task wake flag; setting it marks the task for the next polling sweep.
struct ReadyFlag(AtomicBool);

impl Wake for ReadyFlag {
    fn wake(self: Arc<Self>) {
        self.0.store(true, Ordering::Relaxed);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.store(true, Ordering::Relaxed);
    }
}

struct Task {
    future: Pin<Box<dyn Future<Output = ()>>>,
    ready: Arc<ReadyFlag>,
    waker: Waker,
    done: bool,
}

pub struct SimExecutor {
    tasks: Vec<Task>,
}

impl SimExecutor {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Add a task. Tasks are polled in spawn order; spawn node 0 first.
    pub fn spawn(&mut self, future: impl Future<Output = ()> + 'static) {
        let ready = Arc::new(ReadyFlag(AtomicBool::new(true)));
        let waker = Waker::from(ready.clone());
        self.tasks.push(Task {
            future: Box::pin(future),
            ready,
            waker,
            done: false,
        });
    }

    /// Drive all tasks until they return or until no wakeup is due at or
    /// before `limit_ticks`. The caller must hold `time_driver::sim_lock`.
    pub fn run_until(&mut self, limit_ticks: u64) {
        loop {
            // Step 1: poll until quiescent. A polled task may wake another
            // (or itself, via an already-due timer), so sweep repeatedly.
            loop {
                let mut progressed = false;
                for task in self.tasks.iter_mut() {
                    if task.done || !task.ready.0.swap(false, Ordering::Relaxed) {
                        continue;
                    }
                    progressed = true;
                    let mut cx = Context::from_waker(&task.waker);
                    if task.future.as_mut().poll(&mut cx).is_ready() {
                        task.done = true;
                    }
                }
                if !progressed {
                    break;
                }
            }

            if self.tasks.iter().all(|t| t.done) {
                return;
            }

            // Step 2: advance virtual time.
            match time_driver::next_deadline() {
                Some(at) if at <= limit_ticks => time_driver::advance_to(at),
                // Past the horizon, or every live task is blocked on
                // something that will never wake: either way the run is over.
                _ => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_time::{Duration, Timer};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn timers_run_in_virtual_time_and_spawn_order() {
        let _guard = time_driver::sim_lock();
        time_driver::reset();

        let order: Rc<RefCell<Vec<(u32, u64)>>> = Rc::new(RefCell::new(Vec::new()));
        let mut exec = SimExecutor::new();
        for id in 0..3u32 {
            let order = order.clone();
            exec.spawn(async move {
                // All three fire at the same virtual instants.
                for _ in 0..2 {
                    Timer::after(Duration::from_millis(50)).await;
                    order.borrow_mut().push((id, embassy_time::Instant::now().as_millis()));
                }
            });
        }
        exec.run_until(time_driver::ms_to_ticks(1000.0));

        let order = order.borrow();
        assert_eq!(
            *order,
            vec![(0, 50), (1, 50), (2, 50), (0, 100), (1, 100), (2, 100)]
        );
    }

    #[test]
    fn run_stops_at_the_time_limit() {
        let _guard = time_driver::sim_lock();
        time_driver::reset();

        let ticks: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));
        let counter = ticks.clone();
        let mut exec = SimExecutor::new();
        exec.spawn(async move {
            loop {
                Timer::after(Duration::from_millis(10)).await;
                *counter.borrow_mut() += 1;
            }
        });
        exec.run_until(time_driver::ms_to_ticks(95.0));
        assert_eq!(*ticks.borrow(), 9);
    }

    #[test]
    fn zero_length_wait_completes() {
        let _guard = time_driver::sim_lock();
        time_driver::reset();

        let done: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));
        let flag = done.clone();
        let mut exec = SimExecutor::new();
        exec.spawn(async move {
            Timer::after(Duration::from_ticks(0)).await;
            *flag.borrow_mut() = true;
        });
        exec.run_until(0);
        assert!(*done.borrow());
    }
}
