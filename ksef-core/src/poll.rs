//! Fixed-delay polling shared by enrollment and batch-status waits.
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    /// A terminal result was observed; polling stops.
    Ready(T),
    /// Nothing terminal yet; poll again after the policy delay.
    Pending,
}

/// Why a polling loop stopped without a [`PollOutcome::Ready`] value.
#[derive(Debug, Error)]
pub enum PollError<E> {
    #[error("no terminal result after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("polling cancelled")]
    Cancelled,
    #[error(transparent)]
    Attempt(E),
}

/// Attempt budget and inter-attempt delay for a polling loop.
///
/// # Examples
/// ```rust
/// use std::time::Duration;
/// use ksef_core::poll::RetryPolicy;
///
/// let policy = RetryPolicy::bounded(5, Duration::from_millis(500));
/// assert_eq!(policy.max_attempts(), Some(5));
/// assert_eq!(RetryPolicy::batch().max_attempts(), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
    delay: Duration,
}

impl RetryPolicy {
    pub const fn bounded(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            delay,
        }
    }

    pub const fn unbounded(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            delay,
        }
    }

    /// Certificate enrollment is a back-office process without push notification:
    /// 30 checks, 2 seconds apart.
    pub const fn enrollment() -> Self {
        Self::bounded(30, Duration::from_secs(2))
    }

    /// Batch processing time grows with the caller's batch, so no attempt bound.
    pub const fn batch() -> Self {
        Self::unbounded(Duration::from_secs(2))
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Run `attempt` until it yields [`PollOutcome::Ready`], the budget runs out or
    /// `cancel` fires. `attempt` receives the 1-based attempt number. Errors from
    /// an attempt end the loop immediately.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<T, PollError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<PollOutcome<T>, E>>,
    {
        let mut count: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(PollError::Cancelled);
            }
            count += 1;
            match attempt(count).await.map_err(PollError::Attempt)? {
                PollOutcome::Ready(value) => return Ok(value),
                PollOutcome::Pending => {}
            }
            if self.max_attempts.is_some_and(|max| count >= max) {
                return Err(PollError::Exhausted { attempts: count });
            }
            tracing::trace!(attempt = count, delay_ms = self.delay.as_millis() as u64, "poll pending");
            tokio::select! {
                _ = cancel.cancelled() => return Err(PollError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
    }
}
