use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::{Request, Response};
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::PrivateKeyDer;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{CredentialLoadError, TokenAcquisitionError};
use crate::Error;

#[derive(Clone, Debug)]
pub(crate) struct HttpClient {
    inner: Client<
        hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
        Full<Bytes>,
    >,
}

impl HttpClient {
    pub(crate) fn new() -> Result<Self, Error> {
        #[cfg(feature = "webpki-roots")]
        let https = HttpsConnectorBuilder::new().with_webpki_roots();
        #[cfg(not(feature = "webpki-roots"))]
        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|err| {
                Error::Io("failed to load native TLS root certificates for HTTPS", err)
            })?;

        Ok(Self {
            inner: Client::builder(TokioExecutor::new())
                .build(https.https_or_http().enable_http1().enable_http2().build()),
        })
    }

    /// Send `req` and read the whole response, bounded by `timeout` and [`MAX_RESPONSE_BYTES`]
    pub(crate) async fn send(
        &self,
        req: Request<Full<Bytes>>,
        timeout: Duration,
    ) -> Result<Response<Bytes>, TokenAcquisitionError> {
        let exchange = async {
            let (parts, body) = self
                .inner
                .request(req)
                .await
                .map_err(|err| TokenAcquisitionError::network("HTTP request failed", err))?
                .into_parts();

            let body = Limited::new(body, MAX_RESPONSE_BYTES)
                .collect()
                .await
                .map_err(|err| match err.downcast::<LengthLimitError>() {
                    Ok(_) => TokenAcquisitionError::ResponseTooLarge(MAX_RESPONSE_BYTES),
                    Err(err) => TokenAcquisitionError::Network {
                        context: "failed to read HTTP response body",
                        source: err.into(),
                    },
                })?
                .to_bytes();

            Ok::<_, TokenAcquisitionError>(Response::from_parts(parts, body))
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| TokenAcquisitionError::Timeout(timeout))?
    }

    /// Like [`HttpClient::send()`], but any non-success status is an error
    pub(crate) async fn fetch(
        &self,
        req: Request<Full<Bytes>>,
        timeout: Duration,
        provider: &'static str,
    ) -> Result<Bytes, TokenAcquisitionError> {
        debug!(url = ?req.uri(), provider, "sending request");
        let (parts, body) = self.send(req, timeout).await?.into_parts();
        if !parts.status.is_success() {
            let detail = error_detail(&body);
            warn!(%detail, status = ?parts.status, provider, "token request failed");
            return Err(TokenAcquisitionError::HttpStatus {
                status: parts.status.as_u16(),
                detail,
            });
        }

        Ok(body)
    }

    pub(crate) async fn token(
        &self,
        req: Request<Full<Bytes>>,
        timeout: Duration,
        provider: &'static str,
    ) -> Result<TokenResponse, TokenAcquisitionError> {
        let body = self.fetch(req, timeout, provider).await?;
        serde_json::from_slice(&body)
            .map_err(|err| TokenAcquisitionError::decoding("failed to deserialize token response", err))
    }
}

/// Error body returned by OAuth 2.0 token endpoints
///
/// https://www.rfc-editor.org/rfc/rfc6749#section-5.2
#[derive(Deserialize)]
struct OAuthError {
    error: String,
    error_description: Option<String>,
}

fn error_detail(body: &[u8]) -> String {
    match serde_json::from_slice::<OAuthError>(body) {
        Ok(OAuthError {
            error,
            error_description: Some(description),
        }) => format!("{error}: {description}"),
        Ok(OAuthError { error, .. }) => error,
        Err(_) => String::from_utf8_lossy(body).trim().to_owned(),
    }
}

/// Token data as returned by the OAuth token endpoint and the metadata server
#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    pub(crate) access_token: String,
    pub(crate) expires_in: u64,
}

impl TokenResponse {
    /// Anchor the relative lifetime at `now`, the instant the request was issued
    pub(crate) fn into_token(self, now: DateTime<Utc>) -> Token {
        let lifetime = TimeDelta::seconds(self.expires_in.min(u64::from(u32::MAX)) as i64);
        Token::new(self.access_token, now + lifetime)
    }
}

/// Represents an access token that can be used as a bearer token in HTTP requests
///
/// Tokens should not be cached; every [`TokenProvider`] already caches tokens and knows when
/// to refresh them.
///
/// The token does not implement [`Display`] to avoid accidentally printing the token in log
/// files, likewise [`Debug`] does not expose the token value itself which is only available
/// using the [`Token::as_str`] method.
///
/// [`TokenProvider`]: crate::TokenProvider
/// [`Display`]: fmt::Display
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl Token {
    pub(crate) fn new(access_token: String, expires_at: DateTime<Utc>) -> Self {
        Token {
            access_token,
            expires_at,
        }
    }

    /// Whether the token is past its expiry as stated by the issuer
    ///
    /// Providers stop serving a token some time before this point, so a token obtained from
    /// a [`TokenProvider`](crate::TokenProvider) is always reasonably usable.
    pub fn has_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Whether the token may still be served at `now` when refreshing `skew` early
    pub(crate) fn is_fresh_at(&self, now: DateTime<Utc>, skew: TimeDelta) -> bool {
        now < self.expires_at - skew
    }

    /// Get str representation of the token.
    pub fn as_str(&self) -> &str {
        &self.access_token
    }

    /// Get expiry of token as stated by the issuer
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"****")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// An RSA PKCS1 SHA256 signer
pub struct Signer {
    key: RsaKeyPair,
    rng: SystemRandom,
}

impl Signer {
    /// Parse a PEM-encoded RSA private key, PKCS#8 or PKCS#1
    pub(crate) fn new(pem: &str) -> Result<Self, CredentialLoadError> {
        let key = PrivateKeyDer::from_pem_slice(pem.as_bytes()).map_err(|err| {
            CredentialLoadError::malformed("failed to read PEM private key", err)
        })?;

        let key = match &key {
            PrivateKeyDer::Pkcs8(der) => RsaKeyPair::from_pkcs8(der.secret_pkcs8_der()),
            PrivateKeyDer::Pkcs1(der) => RsaKeyPair::from_der(der.secret_pkcs1_der()),
            _ => {
                return Err(CredentialLoadError::malformed(
                    "private key is not an RSA key",
                    "unsupported private key encoding",
                ))
            }
        }
        .map_err(|err| CredentialLoadError::malformed("invalid RSA private key", err.to_string()))?;

        Ok(Signer {
            key,
            rng: SystemRandom::new(),
        })
    }

    /// Sign the input message and return the signature
    pub fn sign(&self, input: &[u8]) -> Result<Vec<u8>, TokenAcquisitionError> {
        let mut signature = vec![0; self.key.public().modulus_len()];
        self.key
            .sign(&RSA_PKCS1_SHA256, &self.rng, input, &mut signature)
            .map_err(|_| TokenAcquisitionError::Signing("failed to sign with credentials key"))?;
        Ok(signature)
    }

    #[cfg(test)]
    pub(crate) fn public_key(&self) -> &[u8] {
        self.key.public().as_ref()
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").finish()
    }
}

/// Cap on response bodies read from token endpoints and the metadata server
pub(crate) const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

#[cfg(test)]
mod tests {
    use httptest::{matchers::*, responders::*, Expectation, Server};
    use hyper::Method;

    use super::*;
    use crate::credential_source::fixtures::PRIVATE_KEY;

    fn get(url: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::GET)
            .uri(url)
            .body(Full::from(Bytes::new()))
            .unwrap()
    }

    #[test]
    fn token_response_expiry() {
        let s = r#"{"access_token":"abc123","expires_in":100,"token_type":"Bearer"}"#;
        let response: TokenResponse = serde_json::from_str(s).unwrap();
        let now = Utc::now();
        let token = response.into_token(now);

        assert_eq!(token.as_str(), "abc123");
        assert_eq!(token.expires_at(), now + TimeDelta::seconds(100));

        let s = r#"{"access_token":"abc123","expires_in":100}"#;
        let response: TokenResponse = serde_json::from_str(s).unwrap();
        assert_eq!(response.access_token, "abc123");
    }

    #[test]
    fn freshness_boundary() {
        let now = Utc::now();
        let token = Token::new("t".into(), now + TimeDelta::seconds(100));
        let skew = TimeDelta::seconds(30);

        assert!(token.is_fresh_at(now + TimeDelta::seconds(69), skew));
        assert!(!token.is_fresh_at(now + TimeDelta::seconds(70), skew));
    }

    #[test]
    fn debug_hides_token() {
        let token = Token::new("super-secret".into(), Utc::now());
        let debug = format!("{token:?}");
        assert!(!debug.contains("super-secret"), "{debug}");
    }

    #[test]
    fn oauth_error_detail() {
        let body = br#"{"error":"invalid_grant","error_description":"Invalid JWT Signature."}"#;
        assert_eq!(error_detail(body), "invalid_grant: Invalid JWT Signature.");
        assert_eq!(error_detail(br#"{"error":"invalid_scope"}"#), "invalid_scope");
        assert_eq!(error_detail(b"  not json\n"), "not json");
    }

    #[test]
    fn signer_rejects_garbage() {
        let err = Signer::new("not a key").unwrap_err();
        assert!(matches!(err, CredentialLoadError::Malformed { .. }), "{err:?}");
    }

    #[test]
    fn signature_verifies() {
        let signer = Signer::new(PRIVATE_KEY).unwrap();
        let signature = signer.sign(b"payload").unwrap();

        let key = ring::signature::UnparsedPublicKey::new(
            &ring::signature::RSA_PKCS1_2048_8192_SHA256,
            signer.public_key(),
        );
        key.verify(b"payload", &signature).unwrap();
    }

    #[tokio::test]
    async fn fetch_maps_error_status() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/token")).respond_with(
                status_code(400)
                    .body(r#"{"error":"invalid_grant","error_description":"bad assertion"}"#),
            ),
        );

        let client = HttpClient::new().unwrap();
        let err = client
            .fetch(
                get(&server.url_str("/token")),
                Duration::from_secs(5),
                "test",
            )
            .await
            .unwrap_err();

        match err {
            TokenAcquisitionError::HttpStatus { status, detail } => {
                assert_eq!(status, 400);
                assert_eq!(detail, "invalid_grant: bad assertion");
            }
            err => panic!("unexpected error: {err:?}"),
        }
    }

    #[tokio::test]
    async fn send_times_out() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/slow"))
                .respond_with(delay_and_then(Duration::from_secs(2), status_code(200))),
        );

        let client = HttpClient::new().unwrap();
        let timeout = Duration::from_millis(100);
        let err = client
            .send(get(&server.url_str("/slow")), timeout)
            .await
            .unwrap_err();

        assert!(matches!(err, TokenAcquisitionError::Timeout(t) if t == timeout), "{err:?}");
    }

    #[tokio::test]
    async fn send_caps_body_size() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/big"))
                .respond_with(status_code(200).body(vec![b'x'; MAX_RESPONSE_BYTES + 1])),
        );

        let client = HttpClient::new().unwrap();
        let err = client
            .send(get(&server.url_str("/big")), Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, TokenAcquisitionError::ResponseTooLarge(_)), "{err:?}");
    }

    #[tokio::test]
    async fn token_rejects_malformed_body() {
        let server = Server::run();
        server.expect(
            Expectation::matching(request::method_path("GET", "/token"))
                .respond_with(status_code(200).body(r#"{"token":"nope"}"#)),
        );

        let client = HttpClient::new().unwrap();
        let err = client
            .token(get(&server.url_str("/token")), Duration::from_secs(5), "test")
            .await
            .err()
            .unwrap();

        assert!(matches!(err, TokenAcquisitionError::Decoding { .. }), "{err:?}");
    }
}
