use async_trait::async_trait;
use fly_common::{retry, system_clock, BackoffPolicy, Failure, RetryError, SharedClock};
use reqwest::StatusCode;
use std::fmt::Display;
use tokio_util::sync::CancellationToken;

use super::{FlapsRequest, FlapsResponse, SharedTransport, Transport};
use crate::TransportError;

/// Statuses that indicate a proxy could not reach a healthy backend
pub const RETRYABLE_STATUSES: &[StatusCode] =
    &[StatusCode::BAD_GATEWAY, StatusCode::SERVICE_UNAVAILABLE];

enum Attempt {
    Status(FlapsResponse),
    Error(TransportError),
}

impl Display for Attempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Attempt::Status(response) => write!(f, "status {}", response.status.as_u16()),
            Attempt::Error(error) => write!(f, "{}", error),
        }
    }
}

/// Repeats a request that failed with a temporary transport error or a
/// [RETRYABLE_STATUSES] response, backing off between attempts. When the
/// [BackoffPolicy] is exhausted the last response (or error) is returned as
/// is. Cancellation always wins: a cancelled attempt is never repeated.
pub struct RetryTransport {
    inner: SharedTransport,
    policy: BackoffPolicy,
    clock: SharedClock,
}

impl RetryTransport {
    pub fn new(inner: SharedTransport) -> Self {
        RetryTransport {
            inner,
            policy: BackoffPolicy::transport(),
            clock: system_clock(),
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl Transport for RetryTransport {
    async fn round_trip(
        &self,
        request: FlapsRequest,
        cancel: &CancellationToken,
    ) -> Result<FlapsResponse, TransportError> {
        let request = &request;
        let inner = &self.inner;

        let result = retry(
            self.policy.clone(),
            self.clock.as_ref(),
            cancel,
            || async move {
                match inner.round_trip(request.clone(), cancel).await {
                    Ok(response) if RETRYABLE_STATUSES.contains(&response.status) => {
                        Err(Failure::transient(Attempt::Status(response)))
                    }
                    Ok(response) => Ok(response),
                    Err(error) if error.is_temporary() => {
                        Err(Failure::transient(Attempt::Error(error)))
                    }
                    Err(error) => Err(Failure::permanent(Attempt::Error(error))),
                }
            },
        )
        .await;

        match result {
            Ok(response) => Ok(response),
            Err(RetryError::Cancelled) => Err(TransportError::Cancelled),
            Err(RetryError::Permanent(attempt) | RetryError::Exhausted { error: attempt, .. }) => {
                match attempt {
                    Attempt::Status(response) => Ok(response),
                    Attempt::Error(error) => Err(error),
                }
            }
        }
    }
}
