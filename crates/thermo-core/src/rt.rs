//! Task runtime: shutdown signal, periodic timing and the sleep scheduler
//!
//! Every task on a node is an OS thread. Threads never block on each other;
//! the only shared waits are on [`ShutdownSignal`], which lets a pending
//! sleep end early when the node is asked to stop.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct ShutdownInner {
    flag: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

/// Process-wide stop request, cheap to clone and to poll.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

impl ShutdownSignal {
    /// Create an untriggered signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every waiter
    pub fn trigger(&self) {
        let _guard = self.inner.lock.lock();
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.cond.notify_all();
    }

    /// Whether shutdown has been requested
    pub fn is_triggered(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `timeout` unless shutdown is requested first.
    ///
    /// Returns `true` if shutdown was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock.lock();
        while !self.is_triggered() {
            if self.inner.cond.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }
        self.is_triggered()
    }
}

/// Result of a scheduler sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The full duration passed
    Elapsed,
    /// Shutdown was requested before or during the sleep
    Interrupted,
}

/// Suspends the calling task. Used by the sandbox's `sleep` capability.
pub trait Scheduler: Send + Sync {
    /// Suspend only the calling thread for `duration`.
    fn sleep(&self, duration: Duration, shutdown: &ShutdownSignal) -> SleepOutcome;

    /// Time elapsed according to this scheduler's clock
    fn now(&self) -> Duration;
}

/// Real-time scheduler backed by the OS clock.
#[derive(Debug)]
pub struct ThreadScheduler {
    started: Instant,
}

impl ThreadScheduler {
    /// Create a scheduler whose clock starts now
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ThreadScheduler {
    fn sleep(&self, duration: Duration, shutdown: &ShutdownSignal) -> SleepOutcome {
        if shutdown.wait_timeout(duration) {
            SleepOutcome::Interrupted
        } else {
            SleepOutcome::Elapsed
        }
    }

    fn now(&self) -> Duration {
        self.started.elapsed()
    }
}

type StepHook = Box<dyn FnMut(Duration) -> bool + Send>;

/// Virtual-time scheduler for simulation and tests.
///
/// A sleep returns immediately after advancing the virtual clock and running
/// the step hook with the slept duration. When the hook returns `false` the
/// scheduler triggers shutdown, ending the run at its next capability call.
pub struct SteppedScheduler {
    hook: Mutex<StepHook>,
    clock_ms: AtomicU64,
}

impl SteppedScheduler {
    /// Create a scheduler that calls `hook` on every sleep
    pub fn new<F>(hook: F) -> Self
    where
        F: FnMut(Duration) -> bool + Send + 'static,
    {
        Self {
            hook: Mutex::new(Box::new(hook)),
            clock_ms: AtomicU64::new(0),
        }
    }
}

impl std::fmt::Debug for SteppedScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SteppedScheduler")
            .field("clock_ms", &self.clock_ms.load(Ordering::Relaxed))
            .finish()
    }
}

impl Scheduler for SteppedScheduler {
    fn sleep(&self, duration: Duration, shutdown: &ShutdownSignal) -> SleepOutcome {
        if shutdown.is_triggered() {
            return SleepOutcome::Interrupted;
        }
        self.clock_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);

        let keep_going = {
            let mut hook = self.hook.lock();
            (*hook)(duration)
        };
        if !keep_going {
            shutdown.trigger();
        }
        if shutdown.is_triggered() {
            SleepOutcome::Interrupted
        } else {
            SleepOutcome::Elapsed
        }
    }

    fn now(&self) -> Duration {
        Duration::from_millis(self.clock_ms.load(Ordering::Relaxed))
    }
}

/// Fixed-rate timer: deadlines advance by whole periods from the start, so
/// jitter in one cycle does not accumulate. Missed deadlines are skipped.
#[derive(Debug)]
pub struct PeriodicTimer {
    period: Duration,
    next: Instant,
    overruns: u64,
}

impl PeriodicTimer {
    /// Start a timer whose first deadline is one period from now
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        Self {
            period,
            next: Instant::now() + period,
            overruns: 0,
        }
    }

    /// Timer period
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Cycles skipped because the task ran late
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Block until the next deadline. Returns `false` on shutdown.
    pub fn wait(&mut self, shutdown: &ShutdownSignal) -> bool {
        let now = Instant::now();
        if self.next > now && shutdown.wait_timeout(self.next - now) {
            return false;
        }
        if shutdown.is_triggered() {
            return false;
        }

        self.next += self.period;
        let now = Instant::now();
        while self.next <= now {
            self.next += self.period;
            self.overruns += 1;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_shutdown_wakes_waiter() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let interrupted = signal.wait_timeout(Duration::from_secs(30));
                (interrupted, start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        signal.trigger();

        let (interrupted, elapsed) = waiter.join().unwrap();
        assert!(interrupted);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_timeout_elapses() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(5)));
        assert!(!signal.is_triggered());
    }

    #[test]
    fn test_thread_scheduler_interruptible() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        let sched = ThreadScheduler::new();
        assert_eq!(
            sched.sleep(Duration::from_secs(10), &signal),
            SleepOutcome::Interrupted
        );
    }

    #[test]
    fn test_stepped_scheduler_advances_clock() {
        let signal = ShutdownSignal::new();
        let mut steps = 0;
        let sched = SteppedScheduler::new(move |_| {
            steps += 1;
            steps < 3
        });

        assert_eq!(sched.sleep(Duration::from_millis(100), &signal), SleepOutcome::Elapsed);
        assert_eq!(sched.sleep(Duration::from_millis(100), &signal), SleepOutcome::Elapsed);
        assert_eq!(
            sched.sleep(Duration::from_millis(100), &signal),
            SleepOutcome::Interrupted
        );
        assert!(signal.is_triggered());
        assert_eq!(sched.now(), Duration::from_millis(300));
    }

    #[test]
    fn test_periodic_timer_stops_on_shutdown() {
        let signal = ShutdownSignal::new();
        let mut timer = PeriodicTimer::new(Duration::from_millis(2));
        assert!(timer.wait(&signal));
        signal.trigger();
        assert!(!timer.wait(&signal));
    }
}
