//! Backoff for startup connections, and the error streak that drives
//! forced recovery in the processing loop.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Exponential backoff policy.
#[derive(Debug, Clone)]
pub struct Backoff {
    label: &'static str,
    /// Retries after the first attempt
    retries: u32,
    initial: Duration,
    ceiling: Duration,
}

/// The last error once every attempt is spent.
#[derive(Debug)]
pub struct GaveUp<E> {
    pub error: E,
    pub attempts: u32,
}

impl Backoff {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            retries: 3,
            initial: Duration::from_millis(500),
            ceiling: Duration::from_secs(10),
        }
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    /// Wait before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.ceiling)
    }

    /// Run `attempt` until it succeeds or the retries run out.
    pub async fn run<F, Fut, T, E>(&self, mut attempt: F) -> Result<T, GaveUp<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut retry = 0;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(error) if retry >= self.retries => {
                    return Err(GaveUp {
                        error,
                        attempts: retry + 1,
                    })
                }
                Err(error) => {
                    retry += 1;
                    let delay = self.delay(retry);
                    warn!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        self.label, error, retry, self.retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Consecutive failed ticks of the processing loop.
///
/// Logging is cut off after `log_limit` errors in a row; recovery is due
/// once the streak reaches `recover_at`.
#[derive(Debug)]
pub struct ErrorStreak {
    len: u32,
    log_limit: u32,
    recover_at: u32,
}

impl ErrorStreak {
    pub fn new(log_limit: u32, recover_at: u32) -> Self {
        Self {
            len: 0,
            log_limit,
            recover_at: recover_at.max(1),
        }
    }

    /// Count one failure. Returns whether it should be logged in full.
    pub fn failed(&mut self) -> bool {
        self.len += 1;
        if self.len == self.log_limit + 1 {
            warn!(
                "{} errors in a row, suppressing further error logs",
                self.log_limit
            );
        }
        self.len <= self.log_limit
    }

    /// A clean tick ends the streak.
    pub fn succeeded(&mut self) {
        if self.len > self.log_limit {
            debug!("Recovered after {} consecutive errors", self.len);
        }
        self.len = 0;
    }

    pub fn needs_recovery(&self) -> bool {
        self.len >= self.recover_at
    }

    pub fn count(&self) -> u32 {
        self.len
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}
