use async_trait::async_trait;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{FlapsRequest, FlapsResponse, SharedTransport, Transport};
use crate::TransportError;

/// Logs every exchange that passes through it at `debug` level, and the
/// bodies at `trace` level
pub struct LoggingTransport {
    inner: SharedTransport,
}

impl LoggingTransport {
    pub fn new(inner: SharedTransport) -> Self {
        LoggingTransport { inner }
    }
}

#[async_trait]
impl Transport for LoggingTransport {
    async fn round_trip(
        &self,
        request: FlapsRequest,
        cancel: &CancellationToken,
    ) -> Result<FlapsResponse, TransportError> {
        debug!("--> {} {}", request.method, request.url);
        if let Some(body) = &request.body {
            trace!("{}", String::from_utf8_lossy(body));
        }

        let url = request.url.clone();
        let started = Instant::now();

        match self.inner.round_trip(request, cancel).await {
            Ok(response) => {
                debug!(
                    "<-- {} {} ({:?})",
                    response.status.as_u16(),
                    response.url,
                    started.elapsed()
                );
                trace!("<-- {}: {}", response.url, response.text());
                Ok(response)
            }
            Err(error) => {
                debug!("<-- {} failed after {:?}: {}", url, started.elapsed(), error);
                Err(error)
            }
        }
    }
}
