use std::str;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use http_body_util::Full;
use hyper::{Method, Request};
use tokio::sync::OnceCell;
use tracing::{debug, instrument, Level};
use url::form_urlencoded;

use crate::cache::{Clock, Refresh, SystemClock, TokenCache};
use crate::config::Config;
use crate::error::TokenAcquisitionError;
use crate::types::{HttpClient, Token};
use crate::{Error, TokenProvider};

/// A token provider that queries the GCP instance metadata server for access tokens
///
/// See https://cloud.google.com/compute/docs/metadata/predefined-metadata-keys for details.
#[derive(Debug)]
pub struct MetadataServiceAccount {
    cache: TokenCache<MetadataToken>,
    project_id: OnceCell<Arc<str>>,
    fallback_project_id: Option<Arc<str>>,
}

impl MetadataServiceAccount {
    /// Get tokens for the default service account of the instance, limited to `scopes`
    ///
    /// This does not check that the metadata server is reachable.
    pub fn new(scopes: &[String], config: &Config) -> Result<Self, Error> {
        Ok(Self::with_client(
            HttpClient::new()?,
            &config.metadata_base_url(),
            scopes,
            config,
        ))
    }

    pub(crate) fn with_client(
        client: HttpClient,
        base_url: &str,
        scopes: &[String],
        config: &Config,
    ) -> Self {
        Self::build(client, base_url, scopes, config, Arc::new(SystemClock))
    }

    fn build(
        client: HttpClient,
        base_url: &str,
        scopes: &[String],
        config: &Config,
        clock: Arc<dyn Clock>,
    ) -> Self {
        debug!(base_url, ?scopes, "using GCP instance metadata server");
        let mut token_url = format!("{base_url}{TOKEN_PATH}");
        if !scopes.is_empty() {
            token_url.push('?');
            token_url.push_str(
                &form_urlencoded::Serializer::new(String::new())
                    .append_pair("scopes", &scopes.join(","))
                    .finish(),
            );
        }

        Self {
            cache: TokenCache::with_clock(
                MetadataToken {
                    client,
                    token_url,
                    project_id_url: format!("{base_url}{PROJECT_ID_PATH}"),
                    timeout: config.request_timeout(),
                },
                TimeDelta::seconds(REFRESH_SKEW_SECS),
                clock,
            ),
            project_id: OnceCell::new(),
            fallback_project_id: config.project_id().cloned(),
        }
    }

    async fn fetch_project_id(&self) -> Result<Arc<str>, Error> {
        debug!("getting project ID from GCP instance metadata server");
        let source = self.cache.refresher();
        let req = metadata_request(&source.project_id_url)
            .map_err(|err| TokenAcquisitionError::network("invalid metadata server URL", err))?;
        let body = source
            .client
            .fetch(req, source.timeout, "MetadataServiceAccount")
            .await?;

        match str::from_utf8(&body).map(str::trim) {
            Ok(s) if !s.is_empty() => Ok(Arc::from(s)),
            Ok(_) => Err(Error::Str(
                "empty project ID from GCP instance metadata server",
            )),
            Err(_) => Err(Error::Str(
                "received invalid UTF-8 project ID from GCP instance metadata server",
            )),
        }
    }
}

#[async_trait]
impl TokenProvider for MetadataServiceAccount {
    async fn token(&self) -> Result<Arc<Token>, Error> {
        Ok(self.cache.get().await?)
    }

    async fn project_id(&self) -> Result<Arc<str>, Error> {
        if let Some(project_id) = &self.fallback_project_id {
            return Ok(project_id.clone());
        }

        self.project_id
            .get_or_try_init(|| self.fetch_project_id())
            .await
            .cloned()
    }
}

#[derive(Debug)]
struct MetadataToken {
    client: HttpClient,
    token_url: String,
    project_id_url: String,
    timeout: Duration,
}

#[async_trait]
impl Refresh for MetadataToken {
    #[instrument(level = Level::DEBUG, skip(self))]
    async fn refresh(&self, now: DateTime<Utc>) -> Result<Token, TokenAcquisitionError> {
        let req = metadata_request(&self.token_url)
            .map_err(|err| TokenAcquisitionError::network("invalid metadata server URL", err))?;
        let token = self
            .client
            .token(req, self.timeout, "MetadataServiceAccount")
            .await?;
        Ok(token.into_token(now))
    }
}

/// A GET request carrying the header the metadata server requires
pub(crate) fn metadata_request(url: &str) -> Result<Request<Full<Bytes>>, http::Error> {
    Request::builder()
        .method(Method::GET)
        .uri(url)
        .header(METADATA_FLAVOR, METADATA_FLAVOR_VALUE)
        .body(Full::from(Bytes::new()))
}

pub(crate) const METADATA_FLAVOR: &str = "Metadata-Flavor";
pub(crate) const METADATA_FLAVOR_VALUE: &str = "Google";

// https://cloud.google.com/compute/docs/metadata/predefined-metadata-keys
const PROJECT_ID_PATH: &str = "/computeMetadata/v1/project/project-id";
const TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";

const REFRESH_SKEW_SECS: i64 = 30;

#[cfg(test)]
mod tests {
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use serde_json::json;

    use super::*;
    use crate::cache::tests::ManualClock;

    fn provider(server: &Server, scopes: &[&str], config: &Config) -> MetadataServiceAccount {
        let scopes = scopes.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        MetadataServiceAccount::with_client(
            HttpClient::new().unwrap(),
            &format!("http://{}", server.addr()),
            &scopes,
            config,
        )
    }

    fn token_body() -> String {
        json!({
            "access_token": "metadata-token",
            "expires_in": 3599,
            "token_type": "Bearer"
        })
        .to_string()
    }

    #[tokio::test]
    async fn fetches_token_with_scopes() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", TOKEN_PATH),
                request::headers(contains(("metadata-flavor", "Google"))),
                request::query(url_decoded(contains((
                    "scopes",
                    "https://www.googleapis.com/auth/cloud-platform,https://www.googleapis.com/auth/pubsub"
                )))),
            ])
            .times(1)
            .respond_with(status_code(200).body(token_body())),
        );

        let provider = provider(
            &server,
            &[
                "https://www.googleapis.com/auth/cloud-platform",
                "https://www.googleapis.com/auth/pubsub",
            ],
            &Config::default(),
        );

        let before = Utc::now();
        let first = provider.token().await.unwrap();
        assert_eq!(first.as_str(), "metadata-token");
        assert!(first.expires_at() >= before + TimeDelta::seconds(3599));

        // Served from the cache
        let second = provider.token().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn refreshes_thirty_seconds_before_expiry() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", TOKEN_PATH))
                .times(2)
                .respond_with(status_code(200).body(token_body())),
        );

        let clock = ManualClock::new();
        let start = clock.now();
        let provider = MetadataServiceAccount::build(
            HttpClient::new().unwrap(),
            &format!("http://{}", server.addr()),
            &[],
            &Config::default(),
            clock.clone(),
        );

        let first = provider.token().await.unwrap();
        assert_eq!(first.expires_at(), start + TimeDelta::seconds(3599));

        clock.advance(TimeDelta::seconds(3599 - 30 - 1));
        assert_eq!(provider.token().await.unwrap(), first);

        clock.advance(TimeDelta::seconds(1));
        let refreshed = provider.token().await.unwrap();
        assert_eq!(
            refreshed.expires_at(),
            start + TimeDelta::seconds(3599 - 30 + 3599)
        );
        assert_eq!(provider.token().await.unwrap(), refreshed);
    }

    #[tokio::test]
    async fn omits_empty_scopes() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", TOKEN_PATH))
                .respond_with(status_code(200).body(token_body())),
        );

        let provider = provider(&server, &[], &Config::default());
        assert!(!provider.cache.refresher().token_url.contains('?'));
        assert_eq!(provider.token().await.unwrap().as_str(), "metadata-token");
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", TOKEN_PATH))
                .respond_with(status_code(404).body("service account not found")),
        );

        let provider = provider(&server, &[], &Config::default());
        let err = provider.token().await.unwrap_err();
        match err {
            Error::TokenAcquisition(TokenAcquisitionError::HttpStatus { status, detail }) => {
                assert_eq!(status, 404);
                assert_eq!(detail, "service account not found");
            }
            err => panic!("unexpected error: {err:?}"),
        }
    }

    #[tokio::test]
    async fn project_id_is_fetched_once() {
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("GET", PROJECT_ID_PATH),
                request::headers(contains(("metadata-flavor", "Google"))),
            ])
            .times(1)
            .respond_with(status_code(200).body("test-project\n")),
        );

        let provider = provider(&server, &[], &Config::default());
        assert_eq!(&*provider.project_id().await.unwrap(), "test-project");
        assert_eq!(&*provider.project_id().await.unwrap(), "test-project");
    }

    #[tokio::test]
    async fn project_id_prefers_configuration() {
        let server = Server::run();
        server.expect(
            Expectation::matching(any())
                .times(0)
                .respond_with(status_code(200)),
        );

        let config = Config::default().with_project_id("configured-project");
        let provider = provider(&server, &[], &config);
        assert_eq!(&*provider.project_id().await.unwrap(), "configured-project");
    }
}
