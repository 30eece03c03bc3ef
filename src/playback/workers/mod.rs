//! Worker scaffolding: state machine, cancellation, and the shared step
//! timer that paces the read and decode loops.

pub mod decode;
pub mod read;
pub mod render;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, warn};

/// Resolution of the shared step timer.
pub const STEP_TIMER_INTERVAL: Duration = Duration::from_millis(10);

/// Default render cycle when video is present (~60 Hz).
pub const RENDER_CYCLE: Duration = Duration::from_millis(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    Paused,
    Stopped,
}

/// Cooperative cancellation flag shared with worker cycles.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

struct StepTimerShared {
    ticks: Mutex<u64>,
    condvar: Condvar,
    stopped: AtomicBool,
}

/// Broadcast timer waking interval-driven workers roughly every 10 ms.
pub struct StepTimer {
    shared: Arc<StepTimerShared>,
    handle: Option<JoinHandle<()>>,
}

impl StepTimer {
    pub fn new() -> Self {
        let shared = Arc::new(StepTimerShared {
            ticks: Mutex::new(0),
            condvar: Condvar::new(),
            stopped: AtomicBool::new(false),
        });
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("media-step-timer".to_string())
            .spawn(move || loop {
                thread::sleep(STEP_TIMER_INTERVAL);
                if thread_shared.stopped.load(Ordering::SeqCst) {
                    break;
                }
                let mut ticks = thread_shared.ticks.lock().unwrap();
                *ticks = ticks.wrapping_add(1);
                thread_shared.condvar.notify_all();
            })
            .expect("failed to spawn step timer thread");
        Self {
            shared,
            handle: Some(handle),
        }
    }

    pub fn handle(&self) -> StepTimerHandle {
        StepTimerHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Default for StepTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for StepTimer {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("step timer thread panicked during join");
            }
        }
    }
}

/// Cloneable waiter on the shared step timer.
#[derive(Clone)]
pub struct StepTimerHandle {
    shared: Arc<StepTimerShared>,
}

impl StepTimerHandle {
    /// Block until the tick counter moves past `last_seen` (or the timer
    /// interval elapses as a fallback). Returns the current counter.
    pub fn wait_tick(&self, last_seen: u64) -> u64 {
        let mut ticks = self.shared.ticks.lock().unwrap();
        if *ticks == last_seen && !self.shared.stopped.load(Ordering::SeqCst) {
            let (guard, _timeout) = self
                .shared
                .condvar
                .wait_timeout(ticks, STEP_TIMER_INTERVAL * 2)
                .unwrap();
            ticks = guard;
        }
        *ticks
    }
}

/// How a worker's cycles are scheduled.
pub enum WorkerSchedule {
    /// Woken by the shared step timer.
    Interval(StepTimerHandle),
    /// Dedicated thread sleeping the remaining cycle time.
    Thread(Duration),
}

struct WorkerShared {
    target: Mutex<WorkerState>,
    current: Mutex<WorkerState>,
    condvar: Condvar,
    cancel: CancellationToken,
    cycles: AtomicU64,
}

/// Handle to a spawned pipeline worker.
///
/// Cycles are non-reentrant: the single worker thread executes them in
/// sequence. `pause`/`resume`/`stop` request a target state and wait until
/// the worker reaches it. A panicking cycle is caught, logged, and the
/// worker keeps running.
pub struct Worker {
    name: &'static str,
    shared: Arc<WorkerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn spawn<F>(name: &'static str, schedule: WorkerSchedule, mut cycle: F) -> Self
    where
        F: FnMut(&CancellationToken) + Send + 'static,
    {
        let shared = Arc::new(WorkerShared {
            target: Mutex::new(WorkerState::Running),
            current: Mutex::new(WorkerState::Created),
            condvar: Condvar::new(),
            cancel: CancellationToken::new(),
            cycles: AtomicU64::new(0),
        });
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut last_tick = 0u64;
                loop {
                    match schedule {
                        WorkerSchedule::Interval(ref timer) => {
                            last_tick = timer.wait_tick(last_tick);
                        }
                        WorkerSchedule::Thread(_) => {}
                    }

                    let target = *thread_shared.target.lock().unwrap();
                    match target {
                        WorkerState::Stopped => break,
                        WorkerState::Paused | WorkerState::Created => {
                            set_state(&thread_shared, WorkerState::Paused);
                            if let WorkerSchedule::Thread(cycle_time) = schedule {
                                thread::sleep(cycle_time);
                            }
                            continue;
                        }
                        WorkerState::Running => {}
                    }
                    set_state(&thread_shared, WorkerState::Running);

                    let started = Instant::now();
                    let outcome = catch_unwind(AssertUnwindSafe(|| cycle(&thread_shared.cancel)));
                    if outcome.is_err() {
                        error!("{} worker cycle panicked", name);
                    }
                    thread_shared.cycles.fetch_add(1, Ordering::Relaxed);

                    if let WorkerSchedule::Thread(cycle_time) = schedule {
                        let elapsed = started.elapsed();
                        if elapsed < cycle_time {
                            thread::sleep(cycle_time - elapsed);
                        }
                    }
                }
                set_state(&thread_shared, WorkerState::Stopped);
            })
            .expect("failed to spawn worker thread");

        Self {
            name,
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.current.lock().unwrap()
    }

    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Relaxed)
    }

    /// Request the paused state and wait for the current cycle to finish.
    pub fn pause(&self) {
        *self.shared.target.lock().unwrap() = WorkerState::Paused;
        self.wait_for(|state| {
            matches!(state, WorkerState::Paused | WorkerState::Stopped)
        });
    }

    pub fn resume(&self) {
        *self.shared.target.lock().unwrap() = WorkerState::Running;
        self.wait_for(|state| {
            matches!(state, WorkerState::Running | WorkerState::Stopped)
        });
    }

    /// Assert cancellation, wait for cycle completion, and join the thread.
    pub fn stop(&self) {
        *self.shared.target.lock().unwrap() = WorkerState::Stopped;
        self.shared.cancel.cancel();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            if handle.join().is_err() {
                warn!("{} worker panicked during join", self.name);
            }
        }
        set_state(&self.shared, WorkerState::Stopped);
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    fn wait_for(&self, reached: impl Fn(WorkerState) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut current = self.shared.current.lock().unwrap();
        while !reached(*current) {
            let timeout = deadline.saturating_duration_since(Instant::now());
            if timeout.is_zero() {
                warn!("{} worker did not reach the requested state in time", self.name);
                break;
            }
            let (guard, _timeout) = self.shared.condvar.wait_timeout(current, timeout).unwrap();
            current = guard;
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_state(shared: &WorkerShared, state: WorkerState) {
    *shared.current.lock().unwrap() = state;
    shared.condvar.notify_all();
}
