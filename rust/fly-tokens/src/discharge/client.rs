use anyhow::anyhow;
use async_trait::async_trait;
use fly_common::{retry, system_clock, BackoffPolicy, Failure, RetryError, SharedClock};
use futures::future::{join_all, BoxFuture};
use reqwest::{Method, RequestBuilder, StatusCode};
use std::{future::Future, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    data::{discharge_url, DischargeRequest, DischargeResponse},
    undischarged_caveats, DischargeAuthority,
};
use crate::{
    macaroon::ThirdPartyCaveat, Debugger, DischargeError, DischargeFailure, NoopDebugger,
};

/// Invoked with a URL that the user must visit (usually in a browser) before
/// a third party will hand out a discharge. The token is cancelled once the
/// exchange is abandoned.
pub type UserUrlCallback =
    Arc<dyn Fn(CancellationToken, String) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wrap an async closure as a [UserUrlCallback]
pub fn user_url_callback<F, Fut>(callback: F) -> UserUrlCallback
where
    F: Fn(CancellationToken, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |cancel, url| Box::pin(callback(cancel, url)))
}

/// How long to keep polling a third party for a discharge that is pending
pub fn default_poll_policy() -> BackoffPolicy {
    BackoffPolicy::flaps()
        .with_initial_interval(Duration::from_millis(250))
        .with_max_interval(Duration::from_secs(2))
        .with_max_elapsed_time(Some(Duration::from_secs(300)))
}

/// A [DischargeAuthority] that requests discharges from the third parties
/// named in each caveat over HTTP.
///
/// Cookies set by a third party are kept for the lifetime of the client, and
/// user tokens may be presented as bearer credentials to selected third
/// parties with [ThirdPartyClient::with_bearer_authentication].
#[derive(Clone)]
pub struct ThirdPartyClient {
    http: reqwest::Client,
    bearer: Vec<(String, String)>,
    user_url_callback: Option<UserUrlCallback>,
    debugger: Arc<dyn Debugger>,
    clock: SharedClock,
    poll_policy: BackoffPolicy,
}

impl ThirdPartyClient {
    pub fn new() -> Result<Self, DischargeError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(anyhow::Error::from)?;

        Ok(ThirdPartyClient {
            http,
            bearer: Vec::new(),
            user_url_callback: None,
            debugger: Arc::new(NoopDebugger),
            clock: system_clock(),
            poll_policy: default_poll_policy(),
        })
    }

    /// Send `token` as a bearer credential with every request to the third
    /// party at `location`. A bare host name (such as `auth.fly.io`) matches
    /// any URL on that host; anything else is treated as a URL prefix.
    pub fn with_bearer_authentication(mut self, location: &str, token: &str) -> Self {
        self.bearer.push((location.to_owned(), token.to_owned()));
        self
    }

    pub fn with_user_url_callback(mut self, callback: UserUrlCallback) -> Self {
        self.user_url_callback = Some(callback);
        self
    }

    pub fn with_debugger(mut self, debugger: Arc<dyn Debugger>) -> Self {
        self.debugger = debugger;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_poll_policy(mut self, poll_policy: BackoffPolicy) -> Self {
        self.poll_policy = poll_policy;
        self
    }

    fn bearer_for(&self, url: &Url) -> Option<&str> {
        self.bearer
            .iter()
            .find(|(location, _)| {
                if location.contains("://") {
                    url.as_str().starts_with(location.as_str())
                } else {
                    url.host_str() == Some(location.as_str())
                }
            })
            .map(|(_, token)| token.as_str())
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.debugger.debug(&format!("Request: {}", url));

        let bearer = self.bearer_for(&url).map(str::to_owned);
        let request = self
            .http
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json");

        match bearer {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn exchange(
        &self,
        cancel: &CancellationToken,
        location: &str,
        request: RequestBuilder,
    ) -> Result<(StatusCode, String), DischargeError> {
        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DischargeError::Cancelled),
            result = exchange => result.map_err(|source| DischargeError::Transport {
                location: location.to_owned(),
                source,
            }),
        }
    }

    fn read_response(
        location: &str,
        status: StatusCode,
        body: &str,
    ) -> Result<DischargeResponse, DischargeError> {
        match serde_json::from_str::<DischargeResponse>(body) {
            Ok(DischargeResponse {
                error: Some(message),
                ..
            }) => Err(DischargeError::Refused {
                location: location.to_owned(),
                message,
            }),
            Ok(response) if status.is_success() => Ok(response),
            Ok(_) => Err(DischargeError::Refused {
                location: location.to_owned(),
                message: format!("{}: {}", status, body),
            }),
            Err(_) if !status.is_success() => Err(DischargeError::Refused {
                location: location.to_owned(),
                message: format!("{}: {}", status, body),
            }),
            Err(error) => Err(anyhow::Error::new(error)
                .context(format!("Malformed discharge response from {}", location))
                .into()),
        }
    }

    /// Obtain a discharge for a single third party caveat
    pub async fn discharge(
        &self,
        cancel: &CancellationToken,
        caveat: &ThirdPartyCaveat,
    ) -> Result<String, DischargeError> {
        let location = caveat.location.as_str();
        let url = discharge_url(location)?;

        let request = self
            .request(Method::POST, url.clone())
            .json(&DischargeRequest {
                ticket: caveat.ticket.clone(),
            });

        let (status, body) = self.exchange(cancel, location, request).await?;
        let response = Self::read_response(location, status, &body)?;

        if let Some(discharge) = response.discharge {
            return Ok(discharge);
        }

        if let Some(poll_url) = response.poll_url {
            return self.poll(cancel, location, join(&url, location, &poll_url)?).await;
        }

        if let Some(interactive) = response.user_interactive {
            let user_url = join(&url, location, &interactive.user_url)?;
            let poll_url = join(&url, location, &interactive.poll_url)?;

            let Some(callback) = &self.user_url_callback else {
                return Err(DischargeError::UserInteractionRequired {
                    location: location.to_owned(),
                    url: user_url.to_string(),
                });
            };

            self.debugger
                .debug(&format!("Waiting for the user to visit {}", user_url));
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DischargeError::Cancelled),
                result = callback(cancel.clone(), user_url.to_string()) => result?,
            }

            return self.poll(cancel, location, poll_url).await;
        }

        Err(anyhow!("Third party {} did not say how to proceed", location).into())
    }

    async fn poll(
        &self,
        cancel: &CancellationToken,
        location: &str,
        poll_url: Url,
    ) -> Result<String, DischargeError> {
        let poll_url = &poll_url;

        let result = retry(
            self.poll_policy.clone(),
            self.clock.as_ref(),
            cancel,
            || async move {
                let request = self.request(Method::GET, poll_url.clone());
                let (status, body) = match self.exchange(cancel, location, request).await {
                    Ok(exchanged) => exchanged,
                    Err(error @ DischargeError::Transport { .. }) => {
                        return Err(Failure::transient(error))
                    }
                    Err(error) => return Err(Failure::permanent(error)),
                };

                if status == StatusCode::ACCEPTED {
                    return Err(Failure::transient(DischargeError::Pending {
                        location: location.to_owned(),
                    }));
                }

                match Self::read_response(location, status, &body) {
                    Ok(DischargeResponse {
                        discharge: Some(discharge),
                        ..
                    }) => Ok(discharge),
                    Ok(_) => Err(Failure::transient(DischargeError::Pending {
                        location: location.to_owned(),
                    })),
                    Err(error) => Err(Failure::permanent(error)),
                }
            },
        )
        .await;

        result.map_err(|error| match error {
            RetryError::Cancelled => DischargeError::Cancelled,
            RetryError::Permanent(error) | RetryError::Exhausted { error, .. } => error,
        })
    }
}

fn join(base: &Url, location: &str, reference: &str) -> Result<Url, DischargeError> {
    base.join(reference)
        .map_err(|source| DischargeError::Location {
            location: location.to_owned(),
            source,
        })
}

#[async_trait]
impl DischargeAuthority for ThirdPartyClient {
    async fn needs_discharge(&self, macaroons: &str) -> Result<bool, DischargeError> {
        Ok(!undischarged_caveats(macaroons, self.clock.unix_time()).is_empty())
    }

    async fn fetch_discharge_tokens(
        &self,
        cancel: &CancellationToken,
        macaroons: &str,
    ) -> Result<String, DischargeFailure> {
        let caveats = undischarged_caveats(macaroons, self.clock.unix_time());

        let results = join_all(
            caveats
                .iter()
                .map(|caveat| self.discharge(cancel, caveat)),
        )
        .await;

        let mut tokens: Vec<String> = macaroons
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_owned)
            .collect();
        let before = tokens.len();
        let mut first_error = None;

        for (caveat, result) in caveats.iter().zip(results) {
            match result {
                Ok(discharge) => tokens.push(discharge),
                Err(error) => {
                    warn!(
                        "Could not discharge caveat for {}: {}",
                        caveat.location, error
                    );
                    first_error.get_or_insert(error);
                }
            }
        }

        let discharged = tokens.len() > before;
        let tokens = tokens.join(",");

        match first_error {
            None => Ok(tokens),
            Some(error) => Err(DischargeFailure {
                partial: discharged.then_some(tokens),
                error,
            }),
        }
    }
}
