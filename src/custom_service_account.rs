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
use crate::credential_source::ServiceAccountKey;
use crate::error::TokenAcquisitionError;
use crate::jwt::{Claims, GRANT_TYPE, JWT_LIFETIME_SECS};
use crate::types::{HttpClient, Signer, Token};
use crate::{Error, TokenProvider};

/// A token provider for a service account key
///
/// Without scopes, the provider signs its own JWTs for a single audience (the base URL of the
/// API being called) and uses them directly as bearer tokens; no request is made. With scopes,
/// it exchanges a signed assertion for an access token at the key's `token_uri`.
#[derive(Debug)]
pub struct CustomServiceAccount {
    cache: TokenCache<ServiceAccountToken>,
    project_id: Option<Arc<str>>,
}

impl CustomServiceAccount {
    /// Create a provider for `key`
    ///
    /// `audience` is required when `scopes` is empty and ignored otherwise.
    pub fn new(
        key: ServiceAccountKey,
        scopes: Vec<String>,
        audience: Option<String>,
        config: &Config,
    ) -> Result<Self, Error> {
        Self::with_client(HttpClient::new()?, key, scopes, audience, config)
    }

    /// Read a service account key from the given JSON string and create a provider for it
    pub fn from_json(
        s: &str,
        scopes: Vec<String>,
        audience: Option<String>,
        config: &Config,
    ) -> Result<Self, Error> {
        Self::new(s.parse()?, scopes, audience, config)
    }

    pub(crate) fn with_client(
        client: HttpClient,
        key: ServiceAccountKey,
        scopes: Vec<String>,
        audience: Option<String>,
        config: &Config,
    ) -> Result<Self, Error> {
        Self::build(client, key, scopes, audience, config, Arc::new(SystemClock))
    }

    fn build(
        client: HttpClient,
        key: ServiceAccountKey,
        scopes: Vec<String>,
        audience: Option<String>,
        config: &Config,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        let mode = match (scopes.is_empty(), audience) {
            (false, _) => Mode::Exchange { scopes },
            (true, Some(audience)) => Mode::SelfSigned { audience },
            (true, None) => {
                return Err(Error::Str(
                    "an audience is required for service account tokens without scopes",
                ))
            }
        };

        debug!(
            project = ?key.project_id,
            email = key.client_email,
            ?mode,
            "found service account key"
        );
        let project_id = key.project_id.clone().or_else(|| config.project_id().cloned());
        let refresher = ServiceAccountToken {
            client,
            key,
            mode,
            timeout: config.request_timeout(),
        };

        Ok(Self {
            cache: TokenCache::with_clock(
                refresher,
                TimeDelta::seconds(REFRESH_SKEW_SECS),
                clock,
            ),
            project_id,
        })
    }

    /// The RSA PKCS1 SHA256 [`Signer`] used to sign JWT tokens
    pub fn signer(&self) -> &Signer {
        self.cache.refresher().key.signer()
    }

    /// The service account's email address
    pub fn client_email(&self) -> &str {
        self.cache.refresher().key.client_email()
    }
}

#[async_trait]
impl TokenProvider for CustomServiceAccount {
    async fn token(&self) -> Result<Arc<Token>, Error> {
        Ok(self.cache.get().await?)
    }

    async fn project_id(&self) -> Result<Arc<str>, Error> {
        match &self.project_id {
            Some(pid) => Ok(pid.clone()),
            None => Err(Error::Str("no project ID in service account key or environment")),
        }
    }
}

#[derive(Debug)]
enum Mode {
    SelfSigned { audience: String },
    Exchange { scopes: Vec<String> },
}

#[derive(Debug)]
struct ServiceAccountToken {
    client: HttpClient,
    key: ServiceAccountKey,
    mode: Mode,
    timeout: Duration,
}

#[async_trait]
impl Refresh for ServiceAccountToken {
    #[instrument(level = Level::DEBUG, skip(self))]
    async fn refresh(&self, now: DateTime<Utc>) -> Result<Token, TokenAcquisitionError> {
        let key = &self.key;
        let scopes = match &self.mode {
            Mode::SelfSigned { audience } => {
                let jwt = Claims::self_signed(&key.client_email, audience, now)
                    .to_jwt(&key.signer, &key.private_key_id)?;
                return Ok(Token::new(jwt, now + TimeDelta::seconds(JWT_LIFETIME_SECS)));
            }
            Mode::Exchange { scopes } => scopes,
        };

        let jwt = Claims::exchange(&key.client_email, scopes, now)
            .to_jwt(&key.signer, &key.private_key_id)?;
        let body = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&[("grant_type", GRANT_TYPE), ("assertion", jwt.as_str())])
            .finish();

        let req = Request::post(&key.token_uri)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Full::from(body))
            .map_err(|err| TokenAcquisitionError::network("invalid token endpoint URL", err))?;

        let token = self
            .client
            .token(req, self.timeout, "CustomServiceAccount")
            .await?;
        Ok(token.into_token(now))
    }
}

const REFRESH_SKEW_SECS: i64 = 300;

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;

    use httptest::{matchers::*, responders::*, Expectation, Server};
    use serde_json::json;

    use super::*;
    use crate::cache::tests::ManualClock;
    use crate::credential_source::fixtures::*;
    use crate::jwt::tests::decode;
    use crate::jwt::OAUTH_AUDIENCE;

    const AUDIENCE: &str = "https://storage.example.com/";

    fn sa_key(token_uri: &str) -> ServiceAccountKey {
        service_account_json(token_uri).parse().unwrap()
    }

    fn scopes() -> Vec<String> {
        vec!["https://www.googleapis.com/auth/cloud-platform".to_owned()]
    }

    #[tokio::test]
    async fn self_signed_token_is_local_and_cached() {
        let server = Server::run();
        server.expect(
            Expectation::matching(any())
                .times(0)
                .respond_with(status_code(500)),
        );

        let clock = ManualClock::new();
        let start = clock.now();
        let provider = CustomServiceAccount::build(
            HttpClient::new().unwrap(),
            sa_key(&server.url_str("/token")),
            vec![],
            Some(AUDIENCE.to_owned()),
            &Config::default(),
            clock.clone(),
        )
        .unwrap();

        let token = provider.token().await.unwrap();
        let (header, claims, input, signature) = decode(token.as_str());
        assert_eq!(header["kid"], "268f54e43a1af97cfc71731688434f45aca15c8b");
        assert_eq!(claims["iss"], CLIENT_EMAIL);
        assert_eq!(claims["sub"], CLIENT_EMAIL);
        assert_eq!(claims["aud"], AUDIENCE);
        assert_eq!(claims["iat"], start.timestamp());
        assert_eq!(claims["exp"], start.timestamp() + 3600);
        assert_eq!(token.expires_at(), start + TimeDelta::seconds(3600));

        let key = ring::signature::UnparsedPublicKey::new(
            &ring::signature::RSA_PKCS1_2048_8192_SHA256,
            provider.signer().public_key(),
        );
        key.verify(input.as_bytes(), &signature).unwrap();

        clock.advance(TimeDelta::seconds(3299));
        assert_eq!(provider.token().await.unwrap(), token);

        clock.advance(TimeDelta::seconds(1));
        let refreshed = provider.token().await.unwrap();
        assert_ne!(refreshed, token);
        let (_, claims, _, _) = decode(refreshed.as_str());
        assert_eq!(claims["iat"], start.timestamp() + 3300);
    }

    #[test]
    fn self_signed_requires_audience() {
        let err = CustomServiceAccount::new(
            sa_key("https://oauth2.googleapis.com/token"),
            vec![],
            None,
            &Config::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Str(_)), "{err:?}");
    }

    /// Answers with a token and keeps the form pairs of the last request
    #[derive(Clone, Default)]
    struct RecordForm(Arc<std::sync::Mutex<Vec<(String, String)>>>);

    impl RecordForm {
        fn get(&self, key: &str) -> Option<String> {
            let form = self.0.lock().unwrap();
            form.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
        }
    }

    impl Responder for RecordForm {
        fn respond<'a>(
            &mut self,
            req: &'a http::Request<bytes::Bytes>,
        ) -> Pin<Box<dyn Future<Output = http::Response<bytes::Bytes>> + Send + 'a>> {
            *self.0.lock().unwrap() = form_urlencoded::parse(req.body()).into_owned().collect();
            let body = json!({
                "access_token": "exchanged-token",
                "token_type": "Bearer",
                "expires_in": 3599
            })
            .to_string();
            Box::pin(async move {
                http::Response::builder()
                    .status(200)
                    .body(body.into())
                    .unwrap()
            })
        }
    }

    #[tokio::test]
    async fn exchanges_assertion_for_token() {
        crate::init_tracing();
        let form = RecordForm::default();
        let server = Server::run();
        server.expect(
            Expectation::matching(all_of![
                request::method_path("POST", "/token"),
                request::headers(contains((
                    "content-type",
                    "application/x-www-form-urlencoded"
                ))),
            ])
            .times(1)
            .respond_with(form.clone()),
        );

        let clock = ManualClock::new();
        let start = clock.now();
        let provider = CustomServiceAccount::build(
            HttpClient::new().unwrap(),
            sa_key(&server.url_str("/token")),
            scopes(),
            // Ignored when scopes are given
            Some(AUDIENCE.to_owned()),
            &Config::default(),
            clock.clone(),
        )
        .unwrap();

        let token = provider.token().await.unwrap();
        assert_eq!(token.as_str(), "exchanged-token");
        assert_eq!(token.expires_at(), start + TimeDelta::seconds(3599));

        assert_eq!(form.get("grant_type").as_deref(), Some(GRANT_TYPE));
        let assertion = form.get("assertion").unwrap();
        let (header, claims, input, signature) = decode(&assertion);
        assert_eq!(header["alg"], "RS256");
        assert_eq!(header["kid"], "268f54e43a1af97cfc71731688434f45aca15c8b");
        assert_eq!(claims["iss"], CLIENT_EMAIL);
        assert_eq!(claims["sub"], CLIENT_EMAIL);
        assert_eq!(claims["aud"], OAUTH_AUDIENCE);
        assert_eq!(claims["scope"], "https://www.googleapis.com/auth/cloud-platform");
        assert_eq!(claims["iat"], start.timestamp());
        assert_eq!(claims["exp"], start.timestamp() + 3600);

        let key = ring::signature::UnparsedPublicKey::new(
            &ring::signature::RSA_PKCS1_2048_8192_SHA256,
            provider.signer().public_key(),
        );
        key.verify(input.as_bytes(), &signature).unwrap();

        let again = provider.token().await.unwrap();
        assert_eq!(again, token);
    }

    #[tokio::test]
    async fn oauth_error_is_reported() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/token")).respond_with(
                status_code(400).body(
                    json!({
                        "error": "invalid_grant",
                        "error_description": "Invalid JWT Signature."
                    })
                    .to_string(),
                ),
            ),
        );

        let provider = CustomServiceAccount::with_client(
            HttpClient::new().unwrap(),
            sa_key(&server.url_str("/token")),
            scopes(),
            None,
            &Config::default(),
        )
        .unwrap();

        match provider.token().await.unwrap_err() {
            Error::TokenAcquisition(TokenAcquisitionError::HttpStatus { status, detail }) => {
                assert_eq!(status, 400);
                assert_eq!(detail, "invalid_grant: Invalid JWT Signature.");
            }
            err => panic!("unexpected error: {err:?}"),
        }
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("POST", "/token"))
                .respond_with(delay_and_then(Duration::from_secs(2), status_code(200))),
        );

        let timeout = Duration::from_millis(100);
        let provider = CustomServiceAccount::with_client(
            HttpClient::new().unwrap(),
            sa_key(&server.url_str("/token")),
            scopes(),
            None,
            &Config::default().with_request_timeout(timeout),
        )
        .unwrap();

        let err = provider.token().await.unwrap_err();
        assert!(
            matches!(err, Error::TokenAcquisition(TokenAcquisitionError::Timeout(t)) if t == timeout),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn project_id_sources() {
        let provider = CustomServiceAccount::new(
            sa_key("https://oauth2.googleapis.com/token"),
            scopes(),
            None,
            &Config::default().with_project_id("configured"),
        )
        .unwrap();
        assert_eq!(&*provider.project_id().await.unwrap(), "test_project");

        let mut doc: serde_json::Value =
            serde_json::from_str(&service_account_json("https://oauth2.googleapis.com/token"))
                .unwrap();
        doc.as_object_mut().unwrap().remove("project_id");
        let doc = doc.to_string();

        let provider = CustomServiceAccount::from_json(
            &doc,
            scopes(),
            None,
            &Config::default().with_project_id("configured"),
        )
        .unwrap();
        assert_eq!(&*provider.project_id().await.unwrap(), "configured");

        let provider =
            CustomServiceAccount::from_json(&doc, scopes(), None, &Config::default()).unwrap();
        assert!(matches!(provider.project_id().await, Err(Error::Str(_))));
    }
}
