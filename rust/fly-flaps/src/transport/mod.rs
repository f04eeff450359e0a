//! The layers a Machines API request passes through on its way to the
//! network. Each layer is a [Transport]; the client stacks a
//! [LoggingTransport] over a [RetryTransport] over whatever base transport it
//! was given (a [ReqwestTransport] by default).

mod logging;
mod reqwest;
mod retry;

pub use self::reqwest::*;
pub use logging::*;
pub use retry::*;

use ::reqwest::{header::HeaderMap, Method, StatusCode};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::TransportError;

/// The header that the Machines API echoes a request's correlation id in
pub const HEADER_FLY_REQUEST_ID: &str = "fly-request-id";

/// A fully prepared request. The body is held as [Bytes] so that the request
/// can be cheaply cloned for every attempt.
#[derive(Clone, Debug)]
pub struct FlapsRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl FlapsRequest {
    pub fn new(method: Method, url: Url) -> Self {
        FlapsRequest {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

/// A response whose body has been read in full
#[derive(Clone, Debug)]
pub struct FlapsResponse {
    pub status: StatusCode,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FlapsResponse {
    pub fn request_id(&self) -> Option<&str> {
        self.headers
            .get(HEADER_FLY_REQUEST_ID)
            .and_then(|value| value.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Performs a single HTTP exchange. Implementations must give up promptly
/// (with [TransportError::Cancelled]) once `cancel` fires.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(
        &self,
        request: FlapsRequest,
        cancel: &CancellationToken,
    ) -> Result<FlapsResponse, TransportError>;
}

pub type SharedTransport = Arc<dyn Transport>;

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn round_trip(
        &self,
        request: FlapsRequest,
        cancel: &CancellationToken,
    ) -> Result<FlapsResponse, TransportError> {
        (**self).round_trip(request, cancel).await
    }
}
