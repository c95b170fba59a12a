//! Periodic transmission scheduler
//!
//! A scheduler owns one tokio task for its whole life. `start` arms it: the
//! action runs immediately and then once per period until `stop`. Arming
//! and halting are separate signals, so a stopped scheduler can be started
//! again without spawning a new task. `terminate` ends the task for good.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Snapshot of a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerState {
    pub period: Duration,
    pub running: bool,
    pub stop_requested: bool,
    pub terminated: bool,
}

struct Shared {
    name: String,
    arm: Notify,
    halt: Notify,
    period: Mutex<Duration>,
    running: AtomicBool,
    stop_requested: AtomicBool,
    terminated: AtomicBool,
}

impl Shared {
    fn should_run(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.terminated.load(Ordering::SeqCst)
    }
}

/// Runs an action now and then at a fixed period, on its own task
pub struct PeriodicScheduler {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicScheduler {
    /// Spawn the scheduler task; nothing runs until [`start`](Self::start)
    pub fn spawn<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            name: name.into(),
            arm: Notify::new(),
            halt: Notify::new(),
            period: Mutex::new(Duration::ZERO),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        });

        let handle = tokio::spawn(run(shared.clone(), action));

        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Arm the scheduler: run the action now, then every `period`
    ///
    /// A zero period runs the action once and then idles until `stop`.
    /// Starting an already running scheduler only updates its period.
    pub fn start(&self, period: Duration) {
        if self.shared.terminated.load(Ordering::SeqCst) {
            debug!(scheduler = %self.shared.name, "Start ignored, scheduler terminated");
            return;
        }

        *self.shared.period.lock() = period;
        self.shared.stop_requested.store(false, Ordering::SeqCst);
        if !self.shared.running.swap(true, Ordering::SeqCst) {
            self.shared.arm.notify_one();
            debug!(scheduler = %self.shared.name, ?period, "Scheduler started");
        }
    }

    /// Stop repeating; the task stays alive for a later `start`
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            self.shared.stop_requested.store(true, Ordering::SeqCst);
            self.shared.halt.notify_waiters();
            debug!(scheduler = %self.shared.name, "Scheduler stopped");
        }
    }

    /// End the scheduler task and wait for it to exit
    ///
    /// An action that is currently executing is allowed to finish.
    pub async fn terminate(&self) {
        self.shared.terminated.store(true, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.arm.notify_one();
        self.shared.halt.notify_waiters();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                debug!(scheduler = %self.shared.name, error = %e, "Scheduler task ended abnormally");
            }
            debug!(scheduler = %self.shared.name, "Scheduler terminated");
        }
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState {
            period: *self.shared.period.lock(),
            running: self.shared.running.load(Ordering::SeqCst),
            stop_requested: self.shared.stop_requested.load(Ordering::SeqCst),
            terminated: self.shared.terminated.load(Ordering::SeqCst),
        }
    }
}

impl Drop for PeriodicScheduler {
    fn drop(&mut self) {
        self.shared.terminated.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run<F, Fut>(shared: Arc<Shared>, mut action: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    while !shared.terminated.load(Ordering::SeqCst) {
        shared.arm.notified().await;

        let mut next = Instant::now();
        while shared.should_run() {
            action().await;

            // Register for the halt signal before re-checking the flags so a
            // stop issued in between is not lost.
            let halted = shared.halt.notified();
            tokio::pin!(halted);
            halted.as_mut().enable();
            if !shared.should_run() {
                break;
            }

            let period = *shared.period.lock();
            if period.is_zero() {
                halted.await;
                break;
            }

            next += period;
            let now = Instant::now();
            if next < now {
                next = now;
            }

            tokio::select! {
                _ = &mut halted => break,
                _ = tokio::time::sleep_until(next) => {}
            }
        }
    }
    debug!(scheduler = %shared.name, "Scheduler task exiting");
}
