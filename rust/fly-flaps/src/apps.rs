use fly_common::{retry, Failure, RetryError};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{Action, CallMetadata, Client, FlapsError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAppRequest {
    pub app_name: String,
    pub org_slug: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOidcTokenRequest {
    #[serde(rename = "aud")]
    pub audience: String,
    pub aws_principal_tags: bool,
}

/// Everything but unreserved characters and the sub-delimiters that carry no
/// meaning inside a single path segment
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b':')
    .remove(b'=')
    .remove(b'@');

/// Percent-encode a single path segment
fn path_segment(value: &str) -> String {
    utf8_percent_encode(value, PATH_SEGMENT).to_string()
}

impl Client {
    pub async fn create_app(
        &self,
        cancel: &CancellationToken,
        name: &str,
        org_slug: &str,
    ) -> Result<(), FlapsError> {
        let request = CreateAppRequest {
            app_name: name.to_owned(),
            org_slug: org_slug.to_owned(),
        };

        self.send(
            cancel,
            &CallMetadata::new(Action::AppCreate),
            Method::POST,
            "/apps",
            Some(&request),
            None,
        )
        .await?;

        Ok(())
    }

    /// Poll until the app called `name` can be fetched. A freshly created app
    /// may briefly be reported as missing (404) or not yet accessible (401);
    /// only those are retried.
    pub async fn wait_for_app(&self, cancel: &CancellationToken, name: &str) -> Result<(), FlapsError> {
        let path = format!("/apps/{}", path_segment(name));
        let metadata = CallMetadata::new(Action::MachineGet);
        let (path, metadata) = (&path, &metadata);

        let result = retry(
            self.operation_policy.clone(),
            self.clock.as_ref(),
            cancel,
            || async move {
                match self
                    .send(cancel, metadata, Method::GET, path, None::<&()>, None)
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(error)
                        if matches!(
                            error.status(),
                            Some(StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED)
                        ) =>
                    {
                        Err(Failure::transient(error))
                    }
                    Err(error) => Err(Failure::permanent(error)),
                }
            },
        )
        .await;

        result.map_err(|error| match error {
            RetryError::Cancelled => FlapsError::Cancelled,
            RetryError::Permanent(error) | RetryError::Exhausted { error, .. } => error,
        })
    }

    /// Request an OIDC token for the app, for the given audience
    pub async fn get_oidc_token(
        &self,
        cancel: &CancellationToken,
        audience: &str,
        aws_principal_tags: bool,
    ) -> Result<String, FlapsError> {
        let request = CreateOidcTokenRequest {
            audience: audience.to_owned(),
            aws_principal_tags,
        };

        self.send_text(
            cancel,
            &CallMetadata::new(Action::GetOidcToken),
            Method::POST,
            "/tokens/oidc",
            Some(&request),
            None,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_escapes_app_names_as_path_segments() {
        assert_eq!(path_segment("my-app"), "my-app");
        assert_eq!(path_segment("my app"), "my%20app");
        assert_eq!(path_segment("a/b?c#d"), "a%2Fb%3Fc%23d");
        assert_eq!(path_segment("a;b,c"), "a%3Bb%2Cc");
        assert_eq!(path_segment("user+tag@org:1"), "user+tag@org:1");
        assert_eq!(path_segment("100%"), "100%25");
    }
}
