use std::time::Duration;
use thiserror::Error;

/// Reasons a macaroon token string could not be decoded
#[derive(Error, Debug)]
pub enum MacaroonError {
    #[error("Token does not carry a recognized macaroon prefix")]
    UnrecognizedPrefix,

    #[error("Could not decode macaroon base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Could not parse macaroon body: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Different classes of error that may occur while fetching discharge tokens
/// for third party caveats
#[derive(Error, Debug)]
pub enum DischargeError {
    #[error("Discharge timed out after {0:?}")]
    Timeout(Duration),

    #[error("Discharge was cancelled")]
    Cancelled,

    #[error("Invalid macaroon: {0}")]
    Macaroon(#[from] MacaroonError),

    #[error("Invalid third party location {location:?}: {source}")]
    Location {
        location: String,
        source: url::ParseError,
    },

    #[error("Discharge request to {location} failed: {source}")]
    Transport {
        location: String,
        source: reqwest::Error,
    },

    #[error("Third party {location} refused to discharge: {message}")]
    Refused { location: String, message: String },

    #[error("Discharge from {location} is still pending")]
    Pending { location: String },

    #[error("Third party {location} requires the user to visit {url}, but nobody is listening")]
    UserInteractionRequired { location: String, url: String },

    #[error("{0}")]
    Other(anyhow::Error),
}

impl From<anyhow::Error> for DischargeError {
    fn from(error: anyhow::Error) -> Self {
        DischargeError::Other(error)
    }
}

/// A failed discharge exchange. When some discharges were obtained before the
/// failure, `partial` holds the macaroon list including them so that the
/// progress can be kept.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct DischargeFailure {
    pub partial: Option<String>,
    #[source]
    pub error: DischargeError,
}

impl From<DischargeError> for DischargeFailure {
    fn from(error: DischargeError) -> Self {
        DischargeFailure {
            partial: None,
            error,
        }
    }
}

/// The error produced by [crate::Tokens::update]. The credentials could not be
/// refreshed, which is distinct from the failure of whatever operation they
/// were going to authorize. `changed` reports whether the store was modified
/// anyway (by pruning, or by persisting a partial discharge).
#[derive(Error, Debug)]
#[error("Credentials could not be refreshed: {source}")]
pub struct UpdateError {
    pub changed: bool,
    #[source]
    pub source: DischargeError,
}

impl UpdateError {
    pub(crate) fn unchanged(source: DischargeError) -> Self {
        UpdateError {
            changed: false,
            source,
        }
    }
}
