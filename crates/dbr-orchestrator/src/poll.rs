//! ---
//! dbr_section: "04-configuration-orchestration"
//! dbr_subsection: "module"
//! dbr_type: "source"
//! dbr_scope: "code"
//! dbr_description: "Deadline-bounded polling with exponential backoff."
//! dbr_version: "v0.0.0-prealpha"
//! dbr_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use dbr_common::PollConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, trace};

/// Delay schedule between poll attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Upper bound of the random delay added to each wait.
    pub jitter: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: if multiplier.is_finite() && multiplier >= 1.0 {
                multiplier
            } else {
                1.0
            },
            jitter,
        }
    }

    pub fn fixed(interval: Duration) -> Self {
        Self::new(interval, interval, 1.0, Duration::ZERO)
    }

    pub fn from_config(config: &PollConfig) -> Self {
        Self::new(
            config.initial_backoff,
            config.max_backoff,
            config.multiplier,
            config.jitter,
        )
    }

    /// Delay after the given attempt (1-indexed).
    pub fn delay(&self, attempt: u32, rng: &mut StdRng) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let base = if scaled >= self.max.as_secs_f64() {
            self.max
        } else {
            self.initial.mul_f64(self.multiplier.powi(exponent))
        };
        if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = rng.gen_range(0..=self.jitter.as_millis().max(1)) as u64;
            base + Duration::from_millis(jitter_ms)
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&PollConfig::default())
    }
}

/// Result of [`poll_until`].
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    Ready {
        value: T,
        attempts: u32,
        elapsed: Duration,
    },
    TimedOut {
        attempts: u32,
        elapsed: Duration,
    },
}

impl<T> PollOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            PollOutcome::Ready { attempts, .. } | PollOutcome::TimedOut { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready { .. })
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            PollOutcome::Ready { value, .. } => Some(value),
            PollOutcome::TimedOut { .. } => None,
        }
    }
}

/// Evaluate `predicate` until it yields a value or `deadline` elapses.
///
/// The predicate receives the 1-indexed attempt number. One final attempt is
/// made once the deadline is reached, so a condition that becomes true while
/// sleeping is never missed. An attempt still pending at the deadline is
/// dropped and the poll times out.
pub async fn poll_until<T, F, Fut>(
    policy: &BackoffPolicy,
    deadline: Duration,
    mut predicate: F,
) -> PollOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let started = Instant::now();
    let deadline_at = started + deadline;
    let mut rng = StdRng::seed_from_u64(0xDB5E_ED00);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match timeout_at(deadline_at, predicate(attempt)).await {
            Ok(Some(value)) => {
                return PollOutcome::Ready {
                    value,
                    attempts: attempt,
                    elapsed: started.elapsed(),
                };
            }
            Ok(None) => {}
            Err(_) => {
                debug!(attempt, "poll attempt still pending at deadline; abandoned");
                return PollOutcome::TimedOut {
                    attempts: attempt,
                    elapsed: started.elapsed(),
                };
            }
        }
        let now = Instant::now();
        if now >= deadline_at {
            return PollOutcome::TimedOut {
                attempts: attempt,
                elapsed: started.elapsed(),
            };
        }
        let delay = policy.delay(attempt, &mut rng).min(deadline_at - now);
        trace!(attempt, delay_ms = delay.as_millis() as u64, "poll not satisfied; backing off");
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let policy = BackoffPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(500),
            2.0,
            Duration::ZERO,
        );
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<_> = (1..=5).map(|a| policy.delay(a, &mut rng)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = BackoffPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(100),
            1.0,
            Duration::from_millis(20),
        );
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 1..50 {
            let delay = policy.delay(attempt, &mut rng);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(120));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returns_value_once_predicate_holds() {
        let policy = BackoffPolicy::fixed(Duration::from_secs(1));
        let outcome = poll_until(&policy, Duration::from_secs(60), |attempt| async move {
            (attempt >= 3).then_some(attempt * 10)
        })
        .await;
        assert_eq!(outcome.attempts(), 3);
        assert_eq!(outcome.into_value(), Some(30));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempt_is_abandoned_at_deadline() {
        let policy = BackoffPolicy::fixed(Duration::from_secs(1));
        let outcome: PollOutcome<()> =
            poll_until(&policy, Duration::from_secs(5), |attempt| async move {
                if attempt >= 2 {
                    std::future::pending::<()>().await;
                }
                None
            })
            .await;
        match outcome {
            PollOutcome::TimedOut { attempts, elapsed } => {
                assert_eq!(attempts, 2);
                assert!(elapsed >= Duration::from_secs(5));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_deadline() {
        let policy = BackoffPolicy::fixed(Duration::from_secs(2));
        let outcome: PollOutcome<()> =
            poll_until(&policy, Duration::from_secs(5), |_| async { None }).await;
        match outcome {
            PollOutcome::TimedOut { attempts, elapsed } => {
                // attempts at t = 0, 2, 4 and a final one at 5
                assert_eq!(attempts, 4);
                assert!(elapsed >= Duration::from_secs(5));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
