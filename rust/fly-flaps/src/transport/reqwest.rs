use async_trait::async_trait;
use reqwest::redirect::Policy;
use tokio_util::sync::CancellationToken;

use super::{FlapsRequest, FlapsResponse, Transport};
use crate::TransportError;

/// A [Transport] backed by a [reqwest::Client]. Redirects are never followed:
/// the Machines API does not send them, and one is reported to the caller as
/// an unexpected status.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()
            .map_err(anyhow::Error::from)?;
        Ok(ReqwestTransport { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn round_trip(
        &self,
        request: FlapsRequest,
        cancel: &CancellationToken,
    ) -> Result<FlapsResponse, TransportError> {
        let FlapsRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let mut builder = self.client.request(method, url.clone()).headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let exchange = async {
            let response = builder.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        };

        let (status, headers, body) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = exchange => result.map_err(|error| TransportError::from_reqwest(&url, error))?,
        };

        Ok(FlapsResponse {
            status,
            url,
            headers,
            body,
        })
    }
}
