use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Bounded, fixed-delay polling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of predicate evaluations, including the first
    pub max_attempts: u32,
    /// Pause between evaluations
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(300))
    }
}

/// Outcome of a polling loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready { value: T, attempts: u32 },
    Exhausted { attempts: u32 },
}

/// Re-evaluates `predicate` until it yields `Some`, sleeping `policy.delay`
/// between attempts. Errors from the predicate stop the loop immediately.
pub async fn poll_until_ready<F, Fut, T, E>(
    policy: RetryPolicy,
    mut predicate: F,
) -> Result<PollOutcome<T>, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        if let Some(value) = predicate().await? {
            if attempts > 1 {
                debug!("Condition satisfied after {} attempts", attempts);
            }
            return Ok(PollOutcome::Ready { value, attempts });
        }

        if attempts >= policy.max_attempts {
            debug!("Condition still unmet after {} attempts", attempts);
            return Ok(PollOutcome::Exhausted { attempts });
        }

        sleep(policy.delay).await;
    }
}
