use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{LightBoardError, Result};

/// Elapsed-time origin for the breathing waveform. Re-anchoring moves the
/// origin to "now" so a speed change does not jump the phase.
#[derive(Debug, Clone, Copy)]
pub struct PhaseClock {
    origin: Instant,
}

impl PhaseClock {
    /// Creates a clock whose cycle begins at `now`.
    pub fn start(now: Instant) -> Self {
        Self { origin: now }
    }

    /// Restarts the cycle at `now`.
    pub fn reanchor(&mut self, now: Instant) {
        self.origin = now;
    }

    /// Returns the time since the origin, zero if `now` is earlier.
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.origin)
    }

    /// Position within the current cycle of `period_seconds`, in `[0, 1)`.
    pub fn cycle_progress(&self, now: Instant, period_seconds: f64) -> f64 {
        if period_seconds <= 0.0 {
            return 0.0;
        }
        let elapsed = self.elapsed(now).as_secs_f64();
        (elapsed % period_seconds) / period_seconds
    }
}

/// Deadline bookkeeping for a periodic task driven by an external loop.
#[derive(Debug, Clone, Copy)]
pub struct PeriodicTimer {
    interval: Duration,
    next_due: Instant,
}

impl PeriodicTimer {
    /// First firing is one interval after `now`.
    pub fn starting_at(now: Instant, interval: Duration) -> Self {
        Self {
            interval,
            next_due: now + interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the instant of the next firing.
    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due
    }

    /// Consumes one firing if due. Missed periods collapse into one firing;
    /// the next deadline never lands in the past.
    pub fn fire(&mut self, now: Instant) -> bool {
        if !self.is_due(now) {
            return false;
        }
        self.next_due += self.interval;
        if self.next_due <= now {
            self.next_due = now + self.interval;
        }
        true
    }
}

/// Shared flag telling a background task to wind down.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; the task sees it on its next check.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Background thread paired with its cancellation token. Stopping cancels and
/// then joins, so once [`Worker::stop`] returns the task has fully exited.
#[derive(Debug)]
pub struct Worker {
    name: String,
    token: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns `task` on a named thread, passing it the cancellation token.
    pub fn spawn<F>(name: impl Into<String>, task: F) -> Result<Self>
    where
        F: FnOnce(CancelToken) + Send + 'static,
    {
        let name = name.into();
        let token = CancelToken::new();
        let task_token = token.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || task(task_token))?;

        Ok(Self {
            name,
            token,
            handle: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancels the task and waits for it to exit.
    pub fn stop(&mut self) -> Result<()> {
        self.token.cancel();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| LightBoardError::msg(format!("worker `{}` panicked", self.name))),
            None => Ok(()),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            tracing::warn!(%err, "worker did not shut down cleanly");
        }
    }
}
