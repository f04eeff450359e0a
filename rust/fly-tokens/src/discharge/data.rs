use serde::{Deserialize, Serialize};
use url::Url;

use crate::DischargeError;

/// Path, relative to a third party's location, that discharge requests are
/// posted to
pub const DISCHARGE_PATH: &str = "/.well-known/macaroon-discharge";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DischargeRequest {
    pub ticket: String,
}

/// The instructions a third party returns as the next step of a discharge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInteractive {
    pub user_url: String,
    pub poll_url: String,
}

/// The body of any response from a third party. Exactly one field is expected
/// to be set: the discharge itself, a URL to poll for it, a URL the user must
/// visit first, or an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DischargeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discharge: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_interactive: Option<UserInteractive>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DischargeResponse {
    pub fn discharge(token: &str) -> Self {
        DischargeResponse {
            discharge: Some(token.to_owned()),
            ..Default::default()
        }
    }

    pub fn poll(poll_url: &str) -> Self {
        DischargeResponse {
            poll_url: Some(poll_url.to_owned()),
            ..Default::default()
        }
    }

    pub fn user_interactive(user_url: &str, poll_url: &str) -> Self {
        DischargeResponse {
            user_interactive: Some(UserInteractive {
                user_url: user_url.to_owned(),
                poll_url: poll_url.to_owned(),
            }),
            ..Default::default()
        }
    }

    pub fn error(message: &str) -> Self {
        DischargeResponse {
            error: Some(message.to_owned()),
            ..Default::default()
        }
    }
}

/// The URL that discharge requests for the third party at `location` are
/// posted to
pub fn discharge_url(location: &str) -> Result<Url, DischargeError> {
    Url::parse(&format!(
        "{}{}",
        location.trim_end_matches('/'),
        DISCHARGE_PATH
    ))
    .map_err(|source| DischargeError::Location {
        location: location.to_owned(),
        source,
    })
}
