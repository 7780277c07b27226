//! Exponential, jittered, clamped backoff.
//!
//! Two callers: the channel manager retries transient storage failures a
//! bounded number of times, and slots retry `UNAVAILABLE` RPCs (binding
//! retries without bound until the slot is closed).

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::status::Status;
use crate::store::StoreError;

/// Configures a retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First sleep between attempts.
    pub initial_backoff: Duration,
    pub multiplier: u32,
    /// Upper bound of a single sleep.
    pub clamp_backoff: Duration,
    /// Total attempts including the first; `None` retries forever.
    pub max_attempts: Option<usize>,
}

impl RetryPolicy {
    pub fn bounded(max_attempts: usize, initial_backoff: Duration, clamp_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            multiplier: 2,
            clamp_backoff,
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    pub fn unbounded(initial_backoff: Duration, clamp_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            multiplier: 2,
            clamp_backoff,
            max_attempts: None,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            rng: SmallRng::from_entropy(),
            attempt: 0,
            next: self.initial_backoff,
        }
    }
}

/// A series of sleeps driven by a [`RetryPolicy`].
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    rng: SmallRng,
    attempt: usize,
    next: Duration,
}

impl Backoff {
    /// Completed sleeps so far.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Next sleep, without jitter.
    pub fn next_sleep(&self) -> Duration {
        self.next
    }

    /// Whether another attempt is allowed after `self.attempt() + 1` tries.
    pub fn can_retry(&self) -> bool {
        match self.policy.max_attempts {
            Some(max) => self.attempt + 1 < max,
            None => true,
        }
    }

    pub async fn sleep(&mut self) {
        let jitter = self.rng.gen_range(0.9..=1.1);
        tokio::time::sleep(self.next.mul_f64(jitter)).await;
        self.advance();
    }

    fn advance(&mut self) {
        self.attempt += 1;
        self.next = std::cmp::min(
            self.next.saturating_mul(self.policy.multiplier),
            self.policy.clamp_backoff,
        );
    }
}

/// Errors that may go away when the same call is repeated.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        StoreError::is_transient(self)
    }
}

impl Transient for Status {
    fn is_transient(&self) -> bool {
        self.is_retryable()
    }
}

/// Runs a synchronous storage transaction, retrying transient failures.
pub async fn with_store_retries<T, E>(
    policy: &RetryPolicy,
    mut f: impl FnMut() -> Result<T, E>,
) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
{
    let mut backoff = policy.backoff();
    loop {
        match f() {
            Err(e) if e.is_transient() && backoff.can_retry() => {
                debug!(attempt = backoff.attempt(), error = %e, "Retrying storage transaction");
                backoff.sleep().await;
            }
            result => return result,
        }
    }
}

/// Calls an RPC, retrying `UNAVAILABLE` until the policy or `cancel` says stop.
pub async fn with_rpc_retries<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut f: F,
) -> Result<T, Status>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Status>>,
{
    let mut backoff = policy.backoff();
    loop {
        if cancel.is_cancelled() {
            return Err(Status::cancelled(format!("{} cancelled", what)));
        }
        match f().await {
            Err(status) if status.is_retryable() && backoff.can_retry() => {
                debug!(
                    call = what,
                    attempt = backoff.attempt(),
                    error = %status,
                    "Retrying RPC"
                );
                tokio::select! {
                    _ = backoff.sleep() => {}
                    _ = cancel.cancelled() => {
                        return Err(Status::cancelled(format!("{} cancelled", what)));
                    }
                }
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast(attempts: usize) -> RetryPolicy {
        RetryPolicy::bounded(attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_backoff_doubles_and_clamps() {
        let policy = RetryPolicy::bounded(10, Duration::from_millis(100), Duration::from_millis(350));
        let mut backoff = policy.backoff();
        let mut sleeps = Vec::new();
        for _ in 0..4 {
            sleeps.push(backoff.next_sleep().as_millis());
            backoff.advance();
        }
        assert_eq!(sleeps, vec![100, 200, 350, 350]);
    }

    #[test]
    fn test_bounded_attempts() {
        let mut backoff = fast(3).backoff();
        assert!(backoff.can_retry());
        backoff.advance();
        assert!(backoff.can_retry());
        backoff.advance();
        assert!(!backoff.can_retry());
    }

    #[tokio::test]
    async fn test_store_retries_transient_then_succeeds() {
        let calls = AtomicUsize::new(0);
        let result: Result<i32, StoreError> = with_store_retries(&fast(5), || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Transient("flaky".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_store_retries_give_up() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), StoreError> = with_store_retries(&fast(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Transient("down".into()))
        })
        .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_store_retries_skip_permanent_errors() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), StoreError> = with_store_retries(&fast(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::NotFound("x".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rpc_retries_stop_on_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = RetryPolicy::unbounded(Duration::from_millis(1), Duration::from_millis(1));
        let result: Result<(), Status> = with_rpc_retries(&policy, &cancel, "bind", || async {
            Err(Status::unavailable("down"))
        })
        .await;
        assert_eq!(result.unwrap_err().code(), crate::status::Code::Cancelled);
    }

    #[tokio::test]
    async fn test_rpc_retries_unavailable_only() {
        let calls = AtomicUsize::new(0);
        let cancel = CancellationToken::new();
        let result = with_rpc_retries(&fast(10), &cancel, "bind", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Status::unavailable("down"))
                } else {
                    Err::<(), _>(Status::not_found("gone"))
                }
            }
        })
        .await;
        assert_eq!(result.unwrap_err().code(), crate::status::Code::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
