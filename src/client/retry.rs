//! client/retry — единая политика повторов для всех сетевых операций клиента.
//!
//! - не более max_retries повторов после первой попытки;
//! - пауза между попытками: base * 2^n, но не больше cap, с джиттером в [d/2, d];
//! - общий дедлайн операции: по его истечении — Unavailable, даже если попытки остались.

use std::time::{Duration, Instant};

use log::debug;
use rand::Rng;

use crate::config::{deadline_in, ClientConfig};
use crate::error::{PageError, Result};
use crate::metrics::record_client_retry;

/// Outcome of one attempt that did not succeed.
#[derive(Debug)]
pub enum Failure {
    /// Worth another attempt (I/O error, not_applied, server busy).
    Transient(String),
    /// Final answer; returned as is.
    Fatal(PageError),
}

impl From<PageError> for Failure {
    fn from(e: PageError) -> Self {
        match e {
            PageError::Unavailable(m) => Failure::Transient(m),
            other => Failure::Fatal(other),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub deadline: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: Duration, backoff_cap: Duration, deadline: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
            backoff_cap: backoff_cap.max(backoff_base),
            deadline,
        }
    }

    /// GetPage/Ping policy.
    pub fn for_requests(cfg: &ClientConfig) -> Self {
        Self::new(
            cfg.max_retries,
            Duration::from_millis(cfg.backoff_base_ms),
            Duration::from_millis(cfg.backoff_cap_ms),
            cfg.request_deadline(),
        )
    }

    /// StreamWAL policy: same schedule, shorter deadline.
    pub fn for_wal(cfg: &ClientConfig) -> Self {
        Self {
            deadline: cfg.wal_deadline(),
            ..Self::for_requests(cfg)
        }
    }

    /// Upper bound of the pause after attempt `n` (0-based), before jitter.
    pub fn backoff_ceiling(&self, n: u32) -> Duration {
        let factor = 1u32.checked_shl(n.min(31)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_cap)
            .min(self.backoff_cap)
    }

    /// Jittered pause after attempt `n`.
    pub fn backoff(&self, n: u32) -> Duration {
        let d = self.backoff_ceiling(n);
        let ms = d.as_millis() as u64;
        if ms < 2 {
            return d;
        }
        Duration::from_millis(rand::thread_rng().gen_range(ms / 2..=ms))
    }

    /// Run `f` until it succeeds, fails fatally, runs out of attempts or hits the deadline.
    /// `f` receives the attempt number and the operation deadline.
    pub fn run<T, F>(&self, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut(u32, Instant) -> std::result::Result<T, Failure>,
    {
        let deadline = deadline_in(self.deadline);
        let mut attempt = 0u32;
        loop {
            let reason = match f(attempt, deadline) {
                Ok(v) => return Ok(v),
                Err(Failure::Fatal(e)) => return Err(e),
                Err(Failure::Transient(r)) => r,
            };

            let now = Instant::now();
            if attempt >= self.max_retries || now >= deadline {
                return Err(PageError::unavailable(format!(
                    "{}: {} (after {} attempt(s))",
                    op,
                    reason,
                    attempt + 1
                )));
            }

            let pause = self.backoff(attempt).min(deadline - now);
            debug!(
                "{}: attempt {} failed: {}; retry in {:?}",
                op,
                attempt + 1,
                reason,
                pause
            );
            record_client_retry();
            std::thread::sleep(pause);
            attempt += 1;

            if Instant::now() >= deadline {
                return Err(PageError::unavailable(format!(
                    "{}: deadline of {:?} exceeded ({})",
                    op, self.deadline, reason
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(retries: u32, deadline_ms: u64) -> RetryPolicy {
        RetryPolicy::new(
            retries,
            Duration::from_millis(10),
            Duration::from_millis(40),
            Duration::from_millis(deadline_ms),
        )
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let p = policy(5, 1000);
        let ceil: Vec<u64> = (0..5).map(|n| p.backoff_ceiling(n).as_millis() as u64).collect();
        assert_eq!(ceil, vec![10, 20, 40, 40, 40]);
        assert_eq!(p.backoff_ceiling(100).as_millis(), 40);
        for n in 0..5 {
            let d = p.backoff(n);
            assert!(d <= p.backoff_ceiling(n) && d >= p.backoff_ceiling(n) / 2);
        }
    }

    #[test]
    fn transient_failures_are_retried_then_reported_unavailable() {
        let p = policy(2, 5000);
        let mut calls = 0;
        let r: Result<()> = p.run("op", |_, _| {
            calls += 1;
            Err(Failure::Transient("refused".into()))
        });
        assert_eq!(calls, 3);
        assert!(matches!(r, Err(PageError::Unavailable(_))));
    }

    #[test]
    fn success_after_a_retry() {
        let p = policy(2, 5000);
        let r = p.run("op", |n, _| {
            if n == 0 {
                Err(Failure::Transient("reset".into()))
            } else {
                Ok(n)
            }
        });
        assert_eq!(r.unwrap(), 1);
    }

    #[test]
    fn fatal_stops_immediately() {
        let p = policy(5, 5000);
        let mut calls = 0;
        let r: Result<()> = p.run("op", |_, _| {
            calls += 1;
            Err(Failure::Fatal(PageError::malformed("bad json")))
        });
        assert_eq!(calls, 1);
        assert!(matches!(r, Err(PageError::Malformed(_))));
    }

    #[test]
    fn deadline_bounds_the_whole_operation() {
        let p = RetryPolicy::new(
            1000,
            Duration::from_millis(20),
            Duration::from_millis(20),
            Duration::from_millis(100),
        );
        let started = Instant::now();
        let r: Result<()> = p.run("op", |_, _| Err(Failure::Transient("down".into())));
        assert!(matches!(r, Err(PageError::Unavailable(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn huge_deadline_is_accepted() {
        let p = policy(0, u64::MAX);
        assert_eq!(p.run("op", |n, _| Ok(n)).unwrap(), 0);
    }
}
