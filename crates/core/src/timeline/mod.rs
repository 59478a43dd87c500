use std::{
    fmt,
    sync::{Arc, Mutex, OnceLock, PoisonError},
    time::{Duration, Instant},
};

use tokio::{
    runtime::{Handle, Runtime},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::{PlayerError, Result};

/// Monotonic time source. Positions are always derived by reading the clock
/// and subtracting an anchor, never by accumulating per-tick deltas.
pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;
}

/// Wall clock backed by [`Instant`].
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    time: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, delta: Duration) {
        let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
        *time += delta;
    }

    pub fn advance_secs(&self, seconds: f64) {
        self.advance(Duration::from_secs_f64(seconds.max(0.0)));
    }

    pub fn set(&self, time: Duration) {
        *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.time.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Runtime that drives periodic tasks spawned outside of a tokio context.
static TIMER_RUNTIME: OnceLock<Runtime> = OnceLock::new();

fn timer_handle() -> Result<Handle> {
    if let Ok(handle) = Handle::try_current() {
        return Ok(handle);
    }
    if let Some(runtime) = TIMER_RUNTIME.get() {
        return Ok(runtime.handle().clone());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("cadence-timer")
        .enable_time()
        .build()?;
    // A concurrent caller may have won the race; its runtime is the one kept.
    let _ = TIMER_RUNTIME.set(runtime);
    TIMER_RUNTIME
        .get()
        .map(|runtime| runtime.handle().clone())
        .ok_or_else(|| PlayerError::msg("timer runtime unavailable"))
}

/// A repeating background job bound to a cancellable handle.
///
/// Runs on the ambient tokio runtime when there is one and on a shared
/// timer runtime otherwise. Ticks follow a `tokio::time::interval`, so a slow
/// iteration delays the next tick but never shifts the cadence, and missed
/// ticks are skipped rather than replayed in a burst.
pub struct PeriodicTask {
    name: String,
    interval: Duration,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<F>(name: impl Into<String>, interval: Duration, mut job: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        if interval.is_zero() {
            return Err(PlayerError::InvalidInput("periodic task interval must be non-zero"));
        }

        let name = name.into();
        let runtime = timer_handle()?;
        let handle = runtime.spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                job();
            }
        });

        tracing::debug!(task = %name, ?interval, "periodic task started");

        Ok(Self {
            name,
            interval,
            handle: Some(handle),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Aborts the task. An iteration already in progress runs to its end;
    /// no further iteration starts.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            tracing::debug!(task = %self.name, "periodic task stopped");
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish()
    }
}
