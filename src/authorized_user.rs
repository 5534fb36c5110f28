use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use http_body_util::Full;
use hyper::header::CONTENT_TYPE;
use hyper::Request;
use tracing::{debug, instrument, Level};
use url::form_urlencoded;

use crate::cache::{Clock, Refresh, SystemClock, TokenCache};
use crate::config::Config;
use crate::credential_source::UserCredentials;
use crate::error::TokenAcquisitionError;
use crate::types::{HttpClient, Token};
use crate::{Error, TokenProvider};

/// A token provider for user credentials holding a refresh token
///
/// These are typically read from `.config/gcloud/application_default_credentials.json`, as
/// written by `gcloud auth application-default login`.
#[derive(Debug)]
pub struct AuthorizedUser {
    cache: TokenCache<RefreshToken>,
    project_id: Option<Arc<str>>,
}

impl AuthorizedUser {
    /// Create a provider exchanging the refresh token in `credentials` for access tokens
    pub fn new(credentials: UserCredentials, config: &Config) -> Result<Self, Error> {
        Ok(Self::with_client(HttpClient::new()?, credentials, config))
    }

    pub(crate) fn with_client(
        client: HttpClient,
        credentials: UserCredentials,
        config: &Config,
    ) -> Self {
        Self::build(client, credentials, config, Arc::new(SystemClock))
    }

    fn build(
        client: HttpClient,
        credentials: UserCredentials,
        config: &Config,
        clock: Arc<dyn Clock>,
    ) -> Self {
        debug!(
            project = ?credentials.quota_project_id,
            client = credentials.client_id,
            "found user credentials"
        );

        let project_id = credentials
            .quota_project_id
            .clone()
            .or_else(|| config.project_id().cloned());

        Self {
            cache: TokenCache::with_clock(
                RefreshToken {
                    client,
                    token_uri: credentials
                        .token_uri
                        .clone()
                        .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_owned()),
                    credentials,
                    timeout: config.request_timeout(),
                },
                TimeDelta::seconds(REFRESH_SKEW_SECS),
                clock,
            ),
            project_id,
        }
    }
}

#[async_trait]
impl TokenProvider for AuthorizedUser {
    async fn token(&self) -> Result<Arc<Token>, Error> {
        Ok(self.cache.get().await?)
    }

    async fn project_id(&self) -> Result<Arc<str>, Error> {
        self.project_id
            .clone()
            .ok_or(Error::Str("no project ID in user credentials or environment"))
    }
}

#[derive(Debug)]
struct RefreshToken {
    client: HttpClient,
    credentials: UserCredentials,
    token_uri: String,
    timeout: Duration,
}

#[async_trait]
impl Refresh for RefreshToken {
    #[instrument(level = Level::DEBUG, skip(self))]
    async fn refresh(&self, now: DateTime<Utc>) -> Result<Token, TokenAcquisitionError> {
        let cred = &self.credentials;
        let body = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&[
                ("client_id", cred.client_id.as_str()),
                ("client_secret", cred.client_secret.as_str()),
                ("refresh_token", cred.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .finish();

        let mut req =
            Request::post(&self.token_uri).header(CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(project) = &cred.quota_project_id {
            req = req.header(QUOTA_PROJECT_HEADER, &**project);
        }

        let req = req
            .body(Full::from(body))
            .map_err(|err| TokenAcquisitionError::network("invalid token endpoint URL", err))?;
        let token = self.client.token(req, self.timeout, "AuthorizedUser").await?;
        Ok(token.into_token(now))
    }
}

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const QUOTA_PROJECT_HEADER: &str = "x-goog-user-project";
const REFRESH_SKEW_SECS: i64 = 300;
