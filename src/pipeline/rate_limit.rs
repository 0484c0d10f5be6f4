//! Outbound request throttle shared by every call to arXiv.
//!
//! Two constraints are enforced together:
//!
//! * a **token bucket** holding at most `burst` tokens, refilled at `rps`
//!   tokens per second, so short bursts are allowed but the long-run rate is
//!   bounded;
//! * a **sliding-window log** of recent call-starts, so no one-second window
//!   ever contains more than `max(1, floor(rps))` starts.
//!
//! All state lives behind a single `tokio::sync::Mutex`. Tokio's mutex hands
//! the lock out in FIFO order and a waiting caller keeps it while it sleeps,
//! so callers are released strictly in the order they asked. Dropping an
//! `acquire()` future releases the lock without recording a start, which
//! means a cancelled waiter never consumes or leaks a slot.

use std::collections::VecDeque;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::debug;

const WINDOW: Duration = Duration::from_secs(1);

/// Fair token-bucket + sliding-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    rps: f64,
    burst: f64,
    window_cap: usize,
    state: Mutex<LimiterState>,
}

#[derive(Debug)]
struct LimiterState {
    tokens: f64,
    refilled_at: Instant,
    starts: VecDeque<Instant>,
}

impl RateLimiter {
    /// Create a limiter allowing `rps` requests per second with the given
    /// burst allowance. Non-positive rates are treated as one request per
    /// minute rather than panicking.
    pub fn new(rps: f64, burst: u32) -> Self {
        let rps = if rps.is_finite() && rps > 0.0 { rps } else { 1.0 / 60.0 };
        let burst = f64::from(burst.max(1));
        let window_cap = (rps.floor() as usize).max(1);
        Self {
            rps,
            burst,
            window_cap,
            state: Mutex::new(LimiterState {
                tokens: burst,
                refilled_at: Instant::now(),
                starts: VecDeque::with_capacity(window_cap + 1),
            }),
        }
    }

    /// Maximum call-starts admitted in any one-second window.
    pub fn window_cap(&self) -> usize {
        self.window_cap
    }

    /// Wait until one more request may start, then record it.
    ///
    /// Never fails. Callers are released in the order they called.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        loop {
            let now = Instant::now();
            match self.try_admit(&mut state, now) {
                None => return,
                Some(wait) => {
                    debug!("rate limiter: waiting {:?}", wait);
                    sleep_until(now + wait).await;
                }
            }
        }
    }

    /// Admit a start at `now`, or return how long to wait before retrying.
    fn try_admit(&self, state: &mut LimiterState, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rps).min(self.burst);
        state.refilled_at = now;

        while let Some(&oldest) = state.starts.front() {
            if now.saturating_duration_since(oldest) >= WINDOW {
                state.starts.pop_front();
            } else {
                break;
            }
        }

        let window_wait = if state.starts.len() >= self.window_cap {
            state
                .starts
                .front()
                .map(|&oldest| (oldest + WINDOW).saturating_duration_since(now))
                .unwrap_or_default()
        } else {
            Duration::ZERO
        };

        let token_wait = if state.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - state.tokens) / self.rps)
        };

        let wait = window_wait.max(token_wait);
        if wait.is_zero() {
            state.tokens -= 1.0;
            state.starts.push_back(now);
            None
        } else {
            Some(wait)
        }
    }
}
