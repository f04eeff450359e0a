use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt::Display;
use thiserror::Error;
use url::Url;

use crate::FlapsResponse;

/// Failures of a single HTTP round trip, before any status code is looked at
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Could not connect to {url}: {source}")]
    Connection { url: Url, source: reqwest::Error },

    #[error("Request to {url} timed out")]
    Timeout { url: Url },

    #[error("Request to {url} failed: {source}")]
    Request { url: Url, source: reqwest::Error },

    #[error("Request was cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(anyhow::Error),
}

impl TransportError {
    pub fn from_reqwest(url: &Url, error: reqwest::Error) -> Self {
        if error.is_timeout() {
            TransportError::Timeout { url: url.clone() }
        } else if error.is_connect() {
            TransportError::Connection {
                url: url.clone(),
                source: error,
            }
        } else {
            TransportError::Request {
                url: url.clone(),
                source: error,
            }
        }
    }

    /// Whether a later attempt of the same request might succeed
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            TransportError::Connection { .. } | TransportError::Timeout { .. }
        )
    }
}

impl From<anyhow::Error> for TransportError {
    fn from(error: anyhow::Error) -> Self {
        TransportError::Other(error)
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(default)]
    message: Option<String>,
}

/// A 4xx or 5xx response from the Machines API
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    /// The envelope's `message` if it had one, else its `error`; when the body
    /// is not an envelope at all, a description of the raw response
    pub message: String,
    pub body: String,
    /// Echoed by the API in the `fly-request-id` header
    pub request_id: Option<String>,
}

impl ApiError {
    pub fn from_response(response: &FlapsResponse) -> Self {
        let body = response.text();

        let message = match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(ErrorEnvelope {
                message: Some(message),
                ..
            }) if !message.is_empty() => message,
            Ok(ErrorEnvelope { error, .. }) => error,
            Err(_) => format!(
                "request returned non-2xx status: {}: {}",
                response.status.as_u16(),
                body
            ),
        };

        ApiError {
            status: response.status,
            message,
            body,
            request_id: response.request_id().map(str::to_owned),
        }
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.request_id {
            Some(request_id) => write!(f, "{} (Request ID: {})", self.message, request_id),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for ApiError {}

/// Different classes of error that may occur when calling the Machines API
#[derive(Error, Debug)]
pub enum FlapsError {
    #[error("Invalid FLY_FLAPS_BASE_URL {url:?}: {source}")]
    InvalidBaseUrl { url: String, source: url::ParseError },

    #[error("Invalid Machines API path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Could not encode request body: {0}")]
    Encode(serde_json::Error),

    #[error("Failed decoding response: {0}")]
    Decode(serde_json::Error),

    #[error(transparent)]
    Transport(TransportError),

    #[error("API returned unexpected status, {}", .status.as_u16())]
    UnexpectedStatus {
        status: StatusCode,
        request_id: Option<String>,
    },

    /// The requested resource does not exist (404)
    #[error("{0}")]
    NotFound(ApiError),

    #[error("{0}")]
    Api(ApiError),

    #[error("The request was cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(anyhow::Error),
}

impl FlapsError {
    /// The HTTP status of the response that caused this error, if there was one
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            FlapsError::UnexpectedStatus { status, .. } => Some(*status),
            FlapsError::NotFound(error) | FlapsError::Api(error) => Some(error.status),
            _ => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match self {
            FlapsError::UnexpectedStatus { request_id, .. } => request_id.as_deref(),
            FlapsError::NotFound(error) | FlapsError::Api(error) => error.request_id.as_deref(),
            _ => None,
        }
    }

    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            FlapsError::NotFound(error) | FlapsError::Api(error) => Some(error),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FlapsError::NotFound(_))
    }
}

impl From<TransportError> for FlapsError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Cancelled => FlapsError::Cancelled,
            error => FlapsError::Transport(error),
        }
    }
}

impl From<anyhow::Error> for FlapsError {
    fn from(error: anyhow::Error) -> Self {
        FlapsError::Other(error)
    }
}
