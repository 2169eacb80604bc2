//! Bounded polling with backoff
//!
//! Every "wait until X" loop in the crate (instance boot, worker health,
//! blocking job waits in the CLI) goes through [`poll_until`] so that each has
//! an explicit interval, growth factor and overall deadline.
//!
//! ```text
//! probe ─► Some(v) ──────────────► Ready(v)
//!   │
//!   └─► None ─► sleep(interval) ─► interval *= multiplier (≤ max_interval)
//!                                  └─ deadline passed ─► TimedOut
//! ```

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Polling schedule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// First delay between probes
    pub interval: Duration,

    /// Upper bound on the delay
    pub max_interval: Duration,

    /// Growth factor applied after each miss (1.0 = fixed interval)
    pub multiplier: f64,

    /// Overall deadline measured from the first probe
    pub timeout: Duration,
}

impl PollPolicy {
    /// Fixed-interval polling
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            multiplier: 1.0,
            timeout,
        }
    }

    /// Exponential backoff
    pub fn backoff(interval: Duration, max_interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            max_interval,
            multiplier: 2.0,
            timeout,
        }
    }

    fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier.max(1.0)).min(self.max_interval)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5), Duration::from_secs(180))
    }
}

/// Result of a bounded poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    TimedOut,
}

impl<T> PollOutcome<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            PollOutcome::Ready(v) => Some(v),
            PollOutcome::TimedOut => None,
        }
    }
}

/// Call `probe` until it yields a value, fails, or the deadline passes.
///
/// `Ok(None)` from the probe means "not yet"; an `Err` aborts immediately.
/// The probe is always attempted at least once.
pub async fn poll_until<T, E, F, Fut>(policy: &PollPolicy, mut probe: F) -> Result<PollOutcome<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut interval = policy.interval;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if let Some(value) = probe().await? {
            return Ok(PollOutcome::Ready(value));
        }

        let now = Instant::now();
        if now >= deadline {
            debug!(attempt, "Poll deadline reached");
            return Ok(PollOutcome::TimedOut);
        }

        let sleep_for = interval.min(deadline - now);
        debug!(attempt, ?sleep_for, "Not ready, polling again");
        tokio::time::sleep(sleep_for).await;
        interval = policy.next_interval(interval);
    }
}
