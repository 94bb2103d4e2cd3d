//! Automatic error recovery strategies.
//
// Bounded retries for mechanical recovery sequences (e.g., re-homing the
// automounter arm after a fault). The policy is fixed and documented rather
// than open-ended: a sequence that keeps failing is escalated to the caller.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Defines a policy for retrying an operation.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// The maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// The delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(200),
        }
    }
}

/// Run `attempt` until it succeeds or the policy is exhausted.
///
/// The closure receives the 1-based attempt number. On exhaustion the error of the
/// last attempt is returned.
pub async fn retry_with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut number = 1;
    loop {
        match attempt(number).await {
            Ok(value) => return Ok(value),
            Err(e) if number >= attempts => {
                warn!(operation, attempts, error = %e, "retries exhausted");
                return Err(e);
            }
            Err(e) => {
                warn!(operation, attempt = number, error = %e, "attempt failed, retrying");
                number += 1;
                sleep(policy.backoff_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_retry_logic_succeeds() {
        let attempts = RefCell::new(0);
        let result = retry_with_policy(&fast_policy(), "home", |n| {
            *attempts.borrow_mut() += 1;
            async move {
                if n >= 2 {
                    Ok(n)
                } else {
                    Err("gripper sensor timeout")
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(*attempts.borrow(), 2);
    }

    #[tokio::test]
    async fn test_retry_logic_fails() {
        let attempts = RefCell::new(0);
        let result: Result<(), String> = retry_with_policy(&fast_policy(), "home", |n| {
            *attempts.borrow_mut() += 1;
            async move { Err(format!("attempt {n} failed")) }
        })
        .await;
        assert_eq!(result, Err("attempt 3 failed".to_string()));
        assert_eq!(*attempts.borrow(), 3);
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_delay, Duration::from_millis(200));
    }
}
