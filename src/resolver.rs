use std::path::PathBuf;

use http::HeaderValue;
use tracing::{debug, instrument, Level};

use crate::config::{Config, CREDENTIALS_ENV};
use crate::credential_source::{CredentialShape, CredentialSource};
use crate::error::CredentialLoadError;
use crate::metadata_service_account::{metadata_request, METADATA_FLAVOR, METADATA_FLAVOR_VALUE};
use crate::types::HttpClient;
use crate::Error;

/// Where to look for credentials
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Strategy {
    /// Read the file at the given path as the declared shape
    FilePath(PathBuf, CredentialShape),
    /// Parse the value of `GOOGLE_APPLICATION_CREDENTIALS` as inline JSON
    EnvironmentJson,
    /// Discover credentials from the environment
    ///
    /// Tries the following approaches, in order:
    ///
    /// 1. If `GOOGLE_APPLICATION_CREDENTIALS` holds a JSON document, use it.
    /// 2. If it holds anything else, read the file at that path.
    /// 3. Read `.config/gcloud/application_default_credentials.json` from the home directory,
    ///    if it exists. This file is created by `gcloud auth application-default login`.
    /// 4. Probe the metadata server; if it answers, get tokens from it.
    #[default]
    Ambient,
    /// Use the metadata server without checking that it is reachable
    MetadataServer,
}

/// Turns a [`Strategy`] into a [`CredentialSource`]
#[derive(Debug)]
pub struct Resolver {
    client: HttpClient,
    config: Config,
}

impl Resolver {
    /// Create a resolver reading its settings from `config`
    pub fn new(config: Config) -> Result<Self, Error> {
        Ok(Self::with_client(HttpClient::new()?, config))
    }

    pub(crate) fn with_client(client: HttpClient, config: Config) -> Self {
        Self { client, config }
    }

    /// Resolve `strategy` to credential material
    ///
    /// Only [`Strategy::Ambient`] falls back to another source, and only when a source is
    /// absent. A source that exists but cannot be parsed is always an error.
    #[instrument(level = Level::DEBUG, skip(self))]
    pub async fn resolve(&self, strategy: &Strategy) -> Result<CredentialSource, CredentialLoadError> {
        match strategy {
            Strategy::FilePath(path, shape) => CredentialSource::from_file(path, Some(*shape)).await,
            Strategy::EnvironmentJson => match self.config.credentials() {
                Some(value) if is_inline_json(value) => CredentialSource::from_json(value),
                Some(_) => Err(CredentialLoadError::NotFound(format!(
                    "{CREDENTIALS_ENV} does not contain a JSON document"
                ))),
                None => Err(CredentialLoadError::NotFound(format!("{CREDENTIALS_ENV} is not set"))),
            },
            Strategy::Ambient => self.ambient().await,
            Strategy::MetadataServer => Ok(self.metadata_source()),
        }
    }

    async fn ambient(&self) -> Result<CredentialSource, CredentialLoadError> {
        if let Some(value) = self.config.credentials() {
            if is_inline_json(value) {
                debug!("using inline credentials from {CREDENTIALS_ENV}");
                return CredentialSource::from_json(value);
            }

            debug!(path = value, "using credentials file from {CREDENTIALS_ENV}");
            return CredentialSource::from_file(value, None).await;
        }

        if let Some(path) = self.config.well_known_file() {
            match CredentialSource::from_file(path, None).await {
                Ok(source) => {
                    debug!(?path, "using application default credentials file");
                    return Ok(source);
                }
                Err(CredentialLoadError::NotFound(_)) => {
                    debug!(?path, "no application default credentials file")
                }
                Err(err) => return Err(err),
            }
        }

        if self.probe_metadata_server().await {
            return Ok(self.metadata_source());
        }

        Err(CredentialLoadError::NotFound(format!(
            "{CREDENTIALS_ENV} is not set, no application default credentials file at {} and the metadata server at {} is unreachable",
            self.config
                .well_known_file()
                .map_or_else(|| "<unknown>".into(), |path| path.display().to_string()),
            self.config.metadata_base_url(),
        )))
    }

    /// Check whether the metadata server answers, retrying a few times
    ///
    /// A response only counts if it has a success status and carries the
    /// `Metadata-Flavor: Google` header.
    pub async fn probe_metadata_server(&self) -> bool {
        if self.config.skip_metadata_probe() {
            debug!("metadata server probe disabled");
            return false;
        }

        let url = format!("{}/", self.config.metadata_base_url());
        let timeout = self.config.probe_timeout();
        for attempt in 1..=self.config.probe_attempts() {
            let req = match metadata_request(&url) {
                Ok(req) => req,
                Err(err) => {
                    debug!(?err, %url, "invalid metadata server URL");
                    return false;
                }
            };

            match self.client.send(req, timeout).await {
                Ok(rsp)
                    if rsp.status().is_success()
                        && echoes_flavor(rsp.headers().get(METADATA_FLAVOR)) =>
                {
                    debug!(attempt, %url, "metadata server is reachable");
                    return true;
                }
                Ok(rsp) => {
                    debug!(attempt, status = ?rsp.status(), "unexpected response from metadata server")
                }
                Err(err) => debug!(attempt, ?err, "metadata server probe failed"),
            }
        }

        false
    }

    fn metadata_source(&self) -> CredentialSource {
        CredentialSource::MetadataServer {
            base_url: self.config.metadata_base_url(),
        }
    }

    pub(crate) fn client(&self) -> &HttpClient {
        &self.client
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }
}

fn is_inline_json(value: &str) -> bool {
    value.trim_start().starts_with('{')
}

fn echoes_flavor(value: Option<&HeaderValue>) -> bool {
    value.is_some_and(|value| value.as_bytes() == METADATA_FLAVOR_VALUE.as_bytes())
}
