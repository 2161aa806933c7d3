//! Bounded retry-until-ready polling.
//!
//! One abstraction serves both readiness waits in the suite: a fixed number of
//! attempts (an inner engine coming up) and a wall-clock deadline (the host's
//! command port resurfacing after a reboot). Polling blocks the caller; the
//! only way out besides success is exhausting the budget.

use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, instrument};

use crate::io::remote::Remote;

/// How long a poll may keep trying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryBudget {
    /// At most `max` attempts, sleeping `interval` between them.
    Attempts { max: u32, interval: Duration },
    /// Keep trying every `interval` until `within` has elapsed.
    Deadline { within: Duration, interval: Duration },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("not ready after {attempts} attempts ({elapsed:?})")]
pub struct PollTimeout {
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Call `ready` until it returns true or `budget` is spent.
///
/// Returns the number of attempts it took. No sleep follows the final attempt,
/// so an attempts budget never takes longer than roughly `max * interval`.
#[instrument(skip(ready))]
pub fn poll_until<F: FnMut() -> bool>(
    budget: RetryBudget,
    mut ready: F,
) -> Result<u32, PollTimeout> {
    let started = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        if ready() {
            debug!(attempts, "ready");
            return Ok(attempts);
        }
        let pause = match budget {
            RetryBudget::Attempts { max, interval } => {
                if attempts >= max {
                    break;
                }
                interval
            }
            RetryBudget::Deadline { within, interval } => {
                let elapsed = started.elapsed();
                if elapsed >= within {
                    break;
                }
                interval.min(within - elapsed)
            }
        };
        thread::sleep(pause);
    }
    Err(PollTimeout {
        attempts,
        elapsed: started.elapsed(),
    })
}

/// Poll a remote predicate command until it exits 0.
///
/// `command` is invoked before every attempt, so callers may vary it.
pub fn poll_command<R, F>(
    remote: &R,
    budget: RetryBudget,
    mut command: F,
) -> Result<u32, PollTimeout>
where
    R: Remote + ?Sized,
    F: FnMut() -> String,
{
    poll_until(budget, || remote.run(&command()).success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeRemote, failed, ok};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn returns_as_soon_as_ready() {
        let mut calls = 0;
        let attempts = poll_until(
            RetryBudget::Attempts {
                max: 10,
                interval: Duration::from_millis(1),
            },
            || {
                calls += 1;
                calls == 3
            },
        )
        .expect("ready");
        assert_eq!(attempts, 3);
    }

    #[test]
    fn attempts_budget_is_bounded() {
        let started = Instant::now();
        let err = poll_until(
            RetryBudget::Attempts {
                max: 4,
                interval: Duration::from_millis(20),
            },
            || false,
        )
        .unwrap_err();
        assert_eq!(err.attempts, 4);
        // Three sleeps between four attempts, none after the last.
        assert!(started.elapsed() < Duration::from_millis(4 * 20 + 200));
        assert!(started.elapsed() >= Duration::from_millis(3 * 20));
    }

    #[test]
    fn deadline_budget_is_bounded() {
        let started = Instant::now();
        let err = poll_until(
            RetryBudget::Deadline {
                within: Duration::from_millis(60),
                interval: Duration::from_millis(25),
            },
            || false,
        )
        .unwrap_err();
        assert!(err.attempts >= 2);
        assert!(err.elapsed >= Duration::from_millis(60));
        assert!(started.elapsed() < Duration::from_millis(60 + 200));
    }

    #[test]
    fn remote_predicate_uses_exit_code() {
        let seen = AtomicU32::new(0);
        let remote = FakeRemote::new(move |_| {
            if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                failed(1, "Cannot connect to the Docker daemon")
            } else {
                ok("")
            }
        });
        let attempts = poll_command(
            &remote,
            RetryBudget::Attempts {
                max: 5,
                interval: Duration::from_millis(1),
            },
            || "docker info".to_string(),
        )
        .expect("ready");
        assert_eq!(attempts, 3);
        assert_eq!(remote.calls().len(), 3);
    }
}
