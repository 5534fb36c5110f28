use std::sync::Arc;

use tracing::{debug, instrument, Level};

use crate::authorized_user::AuthorizedUser;
use crate::config::Config;
use crate::credential_source::CredentialSource;
use crate::custom_service_account::CustomServiceAccount;
use crate::metadata_service_account::MetadataServiceAccount;
use crate::resolver::{Resolver, Strategy};
use crate::types::HttpClient;
use crate::{Error, TokenProvider};

/// Configures and creates a [`TokenProvider`]
///
/// ```rust,no_run
/// # async fn get_token() -> Result<(), gcp_credentials::Error> {
/// use gcp_credentials::{Builder, Strategy};
///
/// let provider = Builder::new(Strategy::Ambient)
///     .scopes(["https://www.googleapis.com/auth/cloud-platform"])
///     .build()
///     .await?;
/// let token = provider.token().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct Builder {
    strategy: Strategy,
    scopes: Vec<String>,
    audience: Option<String>,
    config: Option<Config>,
}

impl Builder {
    /// Start building a provider for credentials found through `strategy`
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// OAuth scopes to request
    ///
    /// Service accounts without scopes sign their own tokens for the [audience](Self::audience).
    pub fn scopes<S: Into<String>>(mut self, scopes: impl IntoIterator<Item = S>) -> Self {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Base URL of the API self-signed service account tokens are meant for,
    /// e.g. `https://storage.googleapis.com/`
    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Use `config` instead of reading the process environment
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Resolve the credentials and create the matching provider
    #[instrument(level = Level::DEBUG, skip_all)]
    pub async fn build(self) -> Result<Arc<dyn TokenProvider>, Error> {
        debug!(strategy = ?self.strategy, scopes = ?self.scopes, "initializing token provider");
        let config = self.config.clone().unwrap_or_else(Config::from_env);
        let resolver = Resolver::new(config)?;
        let source = resolver.resolve(&self.strategy).await?;
        self.provider(source, resolver.client().clone(), resolver.config())
    }

    /// Create a provider for credentials that were resolved elsewhere
    pub fn build_for(self, source: CredentialSource) -> Result<Arc<dyn TokenProvider>, Error> {
        let config = self.config.clone().unwrap_or_else(Config::from_env);
        self.provider(source, HttpClient::new()?, &config)
    }

    fn provider(
        self,
        source: CredentialSource,
        client: HttpClient,
        config: &Config,
    ) -> Result<Arc<dyn TokenProvider>, Error> {
        let provider: Arc<dyn TokenProvider> = match source {
            CredentialSource::ServiceAccount(key) => {
                debug!("using CustomServiceAccount");
                Arc::new(CustomServiceAccount::with_client(
                    client,
                    key,
                    self.scopes,
                    self.audience,
                    config,
                )?)
            }
            CredentialSource::AuthorizedUser(credentials) => {
                debug!("using AuthorizedUser");
                Arc::new(AuthorizedUser::with_client(client, credentials, config))
            }
            CredentialSource::MetadataServer { base_url } => {
                debug!("using MetadataServiceAccount");
                Arc::new(MetadataServiceAccount::with_client(
                    client,
                    &base_url,
                    &self.scopes,
                    config,
                ))
            }
        };

        Ok(provider)
    }
}
