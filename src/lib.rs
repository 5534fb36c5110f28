//! Google Cloud credential resolution and cached access tokens
//!
//! This library finds the credentials a process should use to call Google Cloud Platform (GCP)
//! APIs and turns them into bearer tokens. Once created, a token provider hands out tokens
//! until shortly before they expire and then fetches a new one.
//!
//! The library supports the following credential sources:
//!
//! 1. A service account key, either inline JSON or a file path in the
//!    `GOOGLE_APPLICATION_CREDENTIALS` environment variable, or an explicit file.
//! 2. User credentials in `.config/gcloud/application_default_credentials.json`, as created by
//!    `gcloud auth application-default login`.
//! 3. The default service account of the instance, obtained from the metadata server.
//!
//! For the discovery order, see [`Strategy::Ambient`].
//!
//! A [`TokenProvider`] handles caching tokens for their lifetime; it will not make a request if
//! an appropriate token is already cached. Concurrent callers that find the cache empty share a
//! single request. Therefore, the caller should not cache tokens.
//!
//! ## Simple usage
//!
//! The default way to use this library is to discover the credentials using [`provider()`].
//!
//! ```rust,no_run
//! # async fn get_token() -> Result<(), gcp_credentials::Error> {
//! let scopes = &["https://www.googleapis.com/auth/cloud-platform"];
//! let provider = gcp_credentials::provider(scopes).await?;
//! let token = provider.token().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Supplying service account credentials
//!
//! When running outside of GCP (for example, on a development machine), it can be useful to
//! supply service account credentials from a specific file. Use a [`Builder`] with
//! [`Strategy::FilePath`] for that:
//!
//! ```rust,no_run
//! # use std::path::PathBuf;
//! #
//! # async fn get_token() -> Result<(), gcp_credentials::Error> {
//! use gcp_credentials::{Builder, CredentialShape, Strategy};
//!
//! let path = PathBuf::from("service-account.json");
//! let provider = Builder::new(Strategy::FilePath(path, CredentialShape::ServiceAccount))
//!     .scopes(["https://www.googleapis.com/auth/cloud-platform"])
//!     .build()
//!     .await?;
//! let token = provider.token().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Service accounts can also sign their own tokens for a single API, which avoids the request
//! to the OAuth token endpoint. Leave the scopes empty and set the API's base URL as the
//! audience:
//!
//! ```rust,no_run
//! # async fn get_token() -> Result<(), gcp_credentials::Error> {
//! use gcp_credentials::{Builder, Strategy};
//!
//! let provider = Builder::new(Strategy::Ambient)
//!     .audience("https://storage.googleapis.com/")
//!     .build()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Getting tokens in multi-thread or async environments
//!
//! Using a `OnceCell` makes it easy to reuse the [`TokenProvider`] across different
//! threads or async tasks.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::sync::OnceCell;
//! use gcp_credentials::TokenProvider;
//!
//! static TOKEN_PROVIDER: OnceCell<Arc<dyn TokenProvider>> = OnceCell::const_new();
//!
//! async fn token_provider() -> &'static Arc<dyn TokenProvider> {
//!     TOKEN_PROVIDER
//!         .get_or_init(|| async {
//!             gcp_credentials::provider(&["https://www.googleapis.com/auth/cloud-platform"])
//!                 .await
//!                 .expect("unable to initialize token provider")
//!         })
//!         .await
//! }
//! ```

#![warn(unreachable_pub)]

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{instrument, Level};

mod authorized_user;
pub use authorized_user::AuthorizedUser;

mod builder;
pub use builder::Builder;

mod cache;

mod config;
pub use config::{
    Config, CREDENTIALS_ENV, METADATA_HOST_ENV, NO_METADATA_CHECK_ENV, PROJECT_ID_ENVS,
};

mod credential_source;
pub use credential_source::{CredentialShape, CredentialSource, ServiceAccountKey, UserCredentials};

mod custom_service_account;
pub use custom_service_account::CustomServiceAccount;

mod error;
pub use error::{CredentialLoadError, Error, TokenAcquisitionError};

mod jwt;

mod metadata_service_account;
pub use metadata_service_account::MetadataServiceAccount;

mod resolver;
pub use resolver::{Resolver, Strategy};

mod types;
pub use types::{Signer, Token};

/// Finds credentials in the environment and creates a token provider for them
///
/// Reads the environment once, then discovers credentials as described for
/// [`Strategy::Ambient`]. Use a [`Builder`] for other strategies or to supply settings
/// without going through environment variables.
#[instrument(level = Level::DEBUG)]
pub async fn provider(scopes: &[&str]) -> Result<Arc<dyn TokenProvider>, Error> {
    tracing::debug!("initializing gcp_credentials");
    Builder::new(Strategy::Ambient)
        .scopes(scopes.iter().copied())
        .config(Config::from_env())
        .build()
        .await
}

/// A trait for an authentication context that can provide tokens
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Get a valid token
    ///
    /// Tokens are cached until shortly before they expire, so this method will only fetch a
    /// fresh token once the current token is about to expire. Call it before every request
    /// instead of holding on to a token.
    async fn token(&self) -> Result<Arc<Token>, Error>;

    /// Get the project ID for the authentication context
    async fn project_id(&self) -> Result<Arc<str>, Error>;
}

#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
