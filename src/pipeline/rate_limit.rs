//! Sliding-window rate limiter shared by every extraction call of a run.
//!
//! The limiter records the start time of each admitted call. A new call is
//! admitted when fewer than `max_calls` starts fall inside the trailing
//! window; otherwise the caller sleeps until the oldest start leaves the
//! window and tries again. Header calls, item calls and retries all pass
//! through the same limiter.
//!
//! Time comes from a [`Clock`] so tests can drive the limiter without
//! waiting a real minute.

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Source of time for the limiter.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// The runtime clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// A clock that only moves when something sleeps on it.
///
/// Each `sleep` returns immediately after advancing the clock by the
/// requested duration, and is recorded so tests can assert on it.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    state: Mutex<ManualState>,
}

#[derive(Debug, Default)]
struct ManualState {
    offset: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            state: Mutex::new(ManualState::default()),
        }
    }

    /// Move the clock forward without recording a sleep.
    pub fn advance(&self, by: Duration) {
        let mut state = lock(&self.state);
        state.offset += by;
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        lock(&self.state).sleeps.clone()
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        lock(&self.state).offset
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + lock(&self.state).offset
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let mut state = lock(&self.state);
        state.offset += duration;
        state.sleeps.push(duration);
        Box::pin(futures::future::ready(()))
    }
}

/// Admits at most `max_calls` call starts per rolling `window`.
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
    starts: Mutex<VecDeque<Instant>>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_calls", &self.max_calls)
            .field("window", &self.window)
            .finish()
    }
}

impl fmt::Display for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.max_calls, self.window.as_secs())
    }
}

impl RateLimiter {
    /// A limiter on the runtime clock. `max_calls` is raised to at least 1.
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self::with_clock(max_calls, window, Arc::new(TokioClock))
    }

    /// `max_calls` per rolling minute.
    pub fn per_minute(max_calls: usize) -> Self {
        Self::new(max_calls, Duration::from_secs(60))
    }

    pub fn with_clock(max_calls: usize, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_calls: max_calls.max(1),
            window,
            clock,
            starts: Mutex::new(VecDeque::with_capacity(max_calls.max(1))),
        }
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Wait until a call may start, then record its start.
    ///
    /// Returns how long the caller was held back.
    pub async fn acquire(&self) -> Duration {
        let mut waited = Duration::ZERO;
        loop {
            let wait = {
                let mut starts = lock(&self.starts);
                let now = self.clock.now();
                while let Some(&oldest) = starts.front() {
                    if now.duration_since(oldest) >= self.window {
                        starts.pop_front();
                    } else {
                        break;
                    }
                }
                if starts.len() < self.max_calls {
                    starts.push_back(now);
                    debug!(
                        "Rate limiter admitted call ({}/{} in window)",
                        starts.len(),
                        self.max_calls
                    );
                    return waited;
                }
                // Non-empty: len >= max_calls >= 1.
                let oldest = starts.front().copied().unwrap_or(now);
                self.window.saturating_sub(now.duration_since(oldest))
            };
            info!(
                "Rate limit of {} reached; waiting {:.1}s",
                self, wait.as_secs_f64()
            );
            self.clock.sleep(wait).await;
            waited += wait;
        }
    }

    /// Call starts currently inside the window.
    pub fn in_window(&self) -> usize {
        let starts = lock(&self.starts);
        let now = self.clock.now();
        starts
            .iter()
            .filter(|&&t| now.duration_since(t) < self.window)
            .count()
    }
}

/// The guarded data stays consistent across a panic, so a poisoned lock is
/// simply taken over.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
