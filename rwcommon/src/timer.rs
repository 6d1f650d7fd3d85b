// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared timer service.
//!
//! One thread owns a deadline list and fires registered callbacks at 100 ms
//! resolution.  Callbacks run on the timer thread and must return promptly;
//! anything heavier should hand off to its own worker.  Callback panics are
//! caught so one bad timer cannot take the wheel down.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::error;

use crate::MutexExt;

const TICK: Duration = Duration::from_millis(100);

pub type TimerId = u64;

type TimerFn = Box<dyn FnMut() + Send>;

struct TimerEntry {
    deadline: Instant,
    period: Option<Duration>,
    callback: TimerFn,
}

#[derive(Default)]
struct TimerTable {
    next_id: TimerId,
    entries: HashMap<TimerId, TimerEntry>,
    // Timer whose callback is currently executing, and whether it was
    // cancelled mid-flight.  Needed so remove_timer works from inside a
    // callback.
    running: Option<TimerId>,
    running_cancelled: bool,
    shutdown: bool,
}

/// Deadline-driven timer wheel shared across components.
pub struct TimerService {
    table: Arc<Mutex<TimerTable>>,
    wake: Arc<Condvar>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn new() -> Arc<Self> {
        let table = Arc::new(Mutex::new(TimerTable {
            next_id: 1,
            ..Default::default()
        }));
        let wake = Arc::new(Condvar::new());

        let svc = Arc::new(TimerService {
            table: table.clone(),
            wake: wake.clone(),
            thread: Mutex::new(None),
        });

        let handle = std::thread::Builder::new()
            .name("rw-timer".to_string())
            .spawn(move || Self::run(table, wake));

        match handle {
            Ok(h) => *svc.thread.lock_or_panic() = Some(h),
            Err(e) => error!("failed to spawn timer thread: {e}"),
        }

        svc
    }

    fn run(table: Arc<Mutex<TimerTable>>, wake: Arc<Condvar>) {
        let mut guard = table.lock_or_panic();

        loop {
            if guard.shutdown {
                return;
            }

            let now = Instant::now();
            let mut due: Vec<TimerId> = guard
                .entries
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            due.sort_unstable();

            for id in due {
                // The entry may have been cancelled by an earlier callback
                // in this same tick.
                let Some(mut entry) = guard.entries.remove(&id) else {
                    continue;
                };

                guard.running = Some(id);
                guard.running_cancelled = false;

                drop(guard);
                let result = catch_unwind(AssertUnwindSafe(|| (entry.callback)()));
                if result.is_err() {
                    error!("timer callback {id} panicked; timer removed");
                }
                guard = table.lock_or_panic();

                let cancelled = guard.running_cancelled;
                guard.running = None;

                if result.is_ok() && !cancelled && !guard.shutdown {
                    if let Some(period) = entry.period {
                        entry.deadline = now + period;
                        guard.entries.insert(id, entry);
                    }
                }
            }

            let (g, _) = wake
                .wait_timeout(guard, TICK)
                .unwrap_or_else(|p| p.into_inner());
            guard = g;
        }
    }

    /// Register a repeating timer.  The first fire is one period from now.
    pub fn register_repeating<F>(&self, period: Duration, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.insert(period.max(TICK), Some(period.max(TICK)), Box::new(callback))
    }

    /// Register a one-shot timer.
    pub fn register_oneshot<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.insert(delay, None, Box::new(callback))
    }

    fn insert(&self, delay: Duration, period: Option<Duration>, callback: TimerFn) -> TimerId {
        let mut table = self.table.lock_or_panic();
        let id = table.next_id;
        table.next_id += 1;
        table.entries.insert(
            id,
            TimerEntry {
                deadline: Instant::now() + delay,
                period,
                callback,
            },
        );
        self.wake.notify_one();
        id
    }

    pub fn remove_timer(&self, id: TimerId) {
        let mut table = self.table.lock_or_panic();
        if table.entries.remove(&id).is_none() && table.running == Some(id) {
            table.running_cancelled = true;
        }
    }

    /// Stop the wheel and join the thread.  Pending timers never fire.
    pub fn shutdown(&self) {
        {
            let mut table = self.table.lock_or_panic();
            table.shutdown = true;
            table.entries.clear();
        }
        self.wake.notify_all();

        if let Some(handle) = self.thread.lock_or_panic().take() {
            if handle.join().is_err() {
                error!("timer thread panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_repeating_fires() {
        let svc = TimerService::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        svc.register_repeating(Duration::from_millis(100), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(550));
        svc.shutdown();

        let n = count.load(Ordering::SeqCst);
        assert!(n >= 2, "expected at least 2 fires, saw {n}");
    }

    #[test]
    fn test_oneshot_fires_once() {
        let svc = TimerService::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        svc.register_oneshot(Duration::from_millis(100), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(500));
        svc.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_before_fire() {
        let svc = TimerService::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        let id = svc.register_oneshot(Duration::from_millis(300), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        svc.remove_timer(id);

        std::thread::sleep(Duration::from_millis(500));
        svc.shutdown();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let svc = TimerService::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        svc.register_repeating(Duration::from_millis(100), || panic!("boom"));
        svc.register_repeating(Duration::from_millis(100), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(400));
        svc.shutdown();
        assert!(count.load(Ordering::SeqCst) >= 1);
    }
}
