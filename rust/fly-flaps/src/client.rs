use anyhow::anyhow;
use fly_common::{system_clock, BackoffPolicy, SharedClock};
use fly_tokens::Tokens;
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT},
    Method,
};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{field, Instrument};
use url::Url;

use crate::{
    transport::{
        FlapsRequest, FlapsResponse, LoggingTransport, ReqwestTransport, RetryTransport,
        SharedTransport, Transport,
    },
    ApiError, CallMetadata, FlapsError,
};

/// Where the Machines API lives unless `FLY_FLAPS_BASE_URL` says otherwise
pub const DEFAULT_BASE_URL: &str = "https://api.machines.dev";

/// Environment variable that overrides [DEFAULT_BASE_URL]
pub const BASE_URL_ENV: &str = "FLY_FLAPS_BASE_URL";

pub const DEFAULT_USER_AGENT: &str = "fly-flaps";

/// Every endpoint lives under this path of the base URL
pub const API_ROOT: &str = "/v1";

/// Configuration for a [Client]
#[derive(Clone)]
pub struct ClientOptions {
    app_name: String,
    tokens: Arc<Tokens>,
    user_agent: Option<String>,
    base_url: Option<Url>,
    transport: Option<SharedTransport>,
    retry_policy: BackoffPolicy,
    operation_policy: BackoffPolicy,
    clock: SharedClock,
}

impl ClientOptions {
    pub fn new(app_name: &str, tokens: Arc<Tokens>) -> Self {
        ClientOptions {
            app_name: app_name.to_owned(),
            tokens,
            user_agent: None,
            base_url: None,
            transport: None,
            retry_policy: BackoffPolicy::transport(),
            operation_policy: BackoffPolicy::flaps(),
            clock: system_clock(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = Some(user_agent.to_owned());
        self
    }

    /// Takes precedence over `FLY_FLAPS_BASE_URL`
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    /// The innermost [Transport]; retrying and logging are layered on top
    pub fn with_transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Governs how individual HTTP exchanges are retried
    pub fn with_retry_policy(mut self, retry_policy: BackoffPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Governs operations that poll until a condition holds, such as
    /// [Client::wait_for_app]
    pub fn with_operation_policy(mut self, operation_policy: BackoffPolicy) -> Self {
        self.operation_policy = operation_policy;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }
}

/// A client for the Machines API of a single app.
///
/// Every call is authorized with the `Authorization` header produced by
/// [Tokens::flaps_header] (unless [CallMetadata::authorization] overrides
/// it), retried according to the client's retry policy, and classified into a
/// [FlapsError] when the API does not answer with a 2xx status.
pub struct Client {
    app_name: String,
    base_url: Url,
    tokens: Arc<Tokens>,
    transport: SharedTransport,
    user_agent: HeaderValue,
    pub(crate) operation_policy: BackoffPolicy,
    pub(crate) clock: SharedClock,
}

impl Client {
    pub fn new(options: ClientOptions) -> Result<Self, FlapsError> {
        let base_url = match options.base_url {
            Some(base_url) => base_url,
            None => {
                let raw = std::env::var(BASE_URL_ENV)
                    .ok()
                    .filter(|value| !value.is_empty())
                    .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
                Url::parse(&raw).map_err(|source| FlapsError::InvalidBaseUrl { url: raw, source })?
            }
        };

        let user_agent = options
            .user_agent
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_owned());
        let user_agent = HeaderValue::from_str(&user_agent)
            .map_err(|error| anyhow!("Invalid user agent {:?}: {}", user_agent, error))?;

        let base: SharedTransport = match options.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let retrying = RetryTransport::new(base)
            .with_policy(options.retry_policy)
            .with_clock(options.clock.clone());
        let transport = Arc::new(LoggingTransport::new(Arc::new(retrying)));

        debug!(
            "Initializing Machines API client for {} at {}",
            options.app_name, base_url
        );

        Ok(Client {
            app_name: options.app_name,
            base_url,
            tokens: options.tokens,
            transport,
            user_agent,
            operation_policy: options.operation_policy,
            clock: options.clock,
        })
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn tokens(&self) -> &Arc<Tokens> {
        &self.tokens
    }

    /// Resolve an endpoint path (with an optional query string) under
    /// [API_ROOT] of the base URL. Paths that would resolve anywhere outside
    /// of it are rejected.
    pub fn url_for(&self, path_and_query: &str) -> Result<Url, FlapsError> {
        let invalid = |reason: &str| FlapsError::InvalidPath {
            path: path_and_query.to_owned(),
            reason: reason.to_owned(),
        };

        if !path_and_query.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }

        let mut url = self
            .base_url
            .join(&format!("{}{}", API_ROOT, path_and_query))
            .map_err(|error| invalid(&error.to_string()))?;
        url.set_fragment(None);

        let inside_root = url.path() == API_ROOT
            || url
                .path()
                .strip_prefix(API_ROOT)
                .is_some_and(|rest| rest.starts_with('/'));

        if url.origin() != self.base_url.origin() || !inside_root {
            return Err(invalid("escapes the API root"));
        }

        Ok(url)
    }

    fn prepare<B>(
        &self,
        metadata: &CallMetadata,
        method: Method,
        path: &str,
        body: Option<&B>,
        headers: Option<HeaderMap>,
    ) -> Result<FlapsRequest, FlapsError>
    where
        B: Serialize + ?Sized,
    {
        let mut request = FlapsRequest::new(method, self.url_for(path)?);

        if let Some(headers) = headers {
            request.headers = headers;
        }

        if let Some(body) = body {
            let body = serde_json::to_vec(body).map_err(FlapsError::Encode)?;
            request
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            request.body = Some(body.into());
        }

        request.headers.insert(USER_AGENT, self.user_agent.clone());

        let authorization = match &metadata.authorization {
            Some(authorization) => authorization.clone(),
            None => self.tokens.flaps_header(),
        };
        let mut authorization = HeaderValue::from_str(&authorization)
            .map_err(|_| anyhow!("Credentials are not a valid Authorization header"))?;
        authorization.set_sensitive(true);
        request.headers.insert(AUTHORIZATION, authorization);

        Ok(request)
    }

    /// Send a request to the endpoint at `path`, serializing `body` (if any)
    /// as JSON. Any 2xx response is returned as is; everything else becomes a
    /// [FlapsError].
    pub async fn send<B>(
        &self,
        cancel: &CancellationToken,
        metadata: &CallMetadata,
        method: Method,
        path: &str,
        body: Option<&B>,
        headers: Option<HeaderMap>,
    ) -> Result<FlapsResponse, FlapsError>
    where
        B: Serialize + ?Sized,
    {
        let span = info_span!(
            "flaps.request",
            request.action = metadata.action.as_str(),
            request.endpoint = path,
            request.method = %method,
            request.machine_id = metadata.machine_id.as_deref().unwrap_or_default(),
            request.caveats = ?self.tokens.caveat_names(),
            request.status_code = field::Empty,
            request.id = field::Empty,
        );

        let exchange = async {
            let request = self.prepare(metadata, method, path, body, headers)?;
            let response = self.transport.round_trip(request, cancel).await?;

            let span = tracing::Span::current();
            span.record("request.status_code", response.status.as_u16());
            if let Some(request_id) = response.request_id() {
                span.record("request.id", request_id);
            }

            classify(response)
        };

        let result = exchange.instrument(span.clone()).await;

        if let Err(error) = &result {
            span.in_scope(|| debug!("Machines API call failed: {}", error));
        }

        result
    }

    /// Like [Client::send], decoding the response body as JSON
    pub async fn send_json<T, B>(
        &self,
        cancel: &CancellationToken,
        metadata: &CallMetadata,
        method: Method,
        path: &str,
        body: Option<&B>,
        headers: Option<HeaderMap>,
    ) -> Result<T, FlapsError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(cancel, metadata, method, path, body, headers)
            .await?
            .json()
            .map_err(FlapsError::Decode)
    }

    /// Like [Client::send], passing the response body through as text
    pub async fn send_text<B>(
        &self,
        cancel: &CancellationToken,
        metadata: &CallMetadata,
        method: Method,
        path: &str,
        body: Option<&B>,
        headers: Option<HeaderMap>,
    ) -> Result<String, FlapsError>
    where
        B: Serialize + ?Sized,
    {
        Ok(self
            .send(cancel, metadata, method, path, body, headers)
            .await?
            .text())
    }
}

fn classify(response: FlapsResponse) -> Result<FlapsResponse, FlapsError> {
    match response.status.as_u16() {
        200..=299 => Ok(response),
        404 => Err(FlapsError::NotFound(ApiError::from_response(&response))),
        400..=599 => Err(FlapsError::Api(ApiError::from_response(&response))),
        _ => Err(FlapsError::UnexpectedStatus {
            status: response.status,
            request_id: response.request_id().map(str::to_owned),
        }),
    }
}
