use std::{fmt::Display, future::Future};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{Backoff, BackoffPolicy, Clock};

/// The outcome of a single failed attempt, as reported by the operation
/// being retried
#[derive(Debug)]
pub enum Failure<E> {
    /// The attempt failed, but a later attempt may succeed
    Transient(E),
    /// The attempt failed and retrying will not help
    Permanent(E),
}

impl<E> Failure<E> {
    /// Wrap an error that is worth retrying
    pub fn transient(error: E) -> Self {
        Failure::Transient(error)
    }

    /// Wrap an error that should stop the retry loop immediately
    pub fn permanent(error: E) -> Self {
        Failure::Permanent(error)
    }
}

/// Why a [retry] loop stopped without producing a value
#[derive(Error, Debug)]
pub enum RetryError<E> {
    /// The operation reported a [Failure::Permanent] error
    #[error("{0}")]
    Permanent(E),

    /// The [BackoffPolicy] was exhausted; holds the last transient error
    #[error("gave up after {attempts} attempt(s): {error}")]
    Exhausted {
        /// How many attempts were made
        attempts: u32,
        /// The error reported by the final attempt
        error: E,
    },

    /// The [CancellationToken] fired before the operation succeeded
    #[error("the operation was cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The underlying operation error, if the loop did not stop because of
    /// cancellation
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Permanent(error) | RetryError::Exhausted { error, .. } => Some(error),
            RetryError::Cancelled => None,
        }
    }
}

/// Run `operation` until it succeeds, reports a [Failure::Permanent] error,
/// exhausts the [BackoffPolicy] or `cancel` fires. Cancellation wins over
/// everything: an attempt or a delay that is interrupted by it is never
/// followed by another attempt.
pub async fn retry<T, E, F, Fut>(
    policy: BackoffPolicy,
    clock: &dyn Clock,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Failure<E>>>,
{
    let mut backoff = Backoff::new(policy);
    let started = clock.now();

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = operation() => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(Failure::Permanent(error)) => return Err(RetryError::Permanent(error)),
            Err(Failure::Transient(error)) => error,
        };

        let elapsed = clock.now().saturating_duration_since(started);

        let Some(delay) = backoff.next_delay(elapsed) else {
            warn!(
                "Giving up after {} attempt(s): {}",
                backoff.attempts(),
                error
            );
            return Err(RetryError::Exhausted {
                attempts: backoff.attempts(),
                error,
            });
        };

        debug!(
            "Attempt {} failed ({}); retrying in {:?}",
            backoff.attempts(),
            error,
            delay
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = clock.sleep(delay) => (),
        }
    }
}
