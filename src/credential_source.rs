use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Deserializer};
use tokio::fs;
use tracing::debug;

use crate::error::CredentialLoadError;
use crate::types::Signer;

/// Credential material a token provider is built around
///
/// Resolved once by the [`Resolver`](crate::Resolver) and immutable afterwards.
#[derive(Debug)]
pub enum CredentialSource {
    /// A service account key, as created by
    /// `gcloud iam service-accounts keys create key.json --iam-account=...`
    ServiceAccount(ServiceAccountKey),
    /// User credentials with a refresh token, as created by
    /// `gcloud auth application-default login`
    AuthorizedUser(UserCredentials),
    /// No secret material; tokens come from the metadata server at `base_url`
    MetadataServer {
        /// Base URL of the metadata server, e.g. `http://metadata.google.internal`
        base_url: String,
    },
}

impl CredentialSource {
    /// Parse a credential document, choosing the shape from its `type` field
    pub fn from_json(s: &str) -> Result<Self, CredentialLoadError> {
        #[derive(Deserialize)]
        struct Kind {
            #[serde(rename = "type")]
            kind: Option<String>,
        }

        let Kind { kind } = serde_json::from_str(s)
            .map_err(|err| CredentialLoadError::malformed("credentials are not valid JSON", err))?;

        match kind.as_deref() {
            Some(SERVICE_ACCOUNT_TYPE) => Ok(Self::ServiceAccount(s.parse()?)),
            Some(AUTHORIZED_USER_TYPE) => Ok(Self::AuthorizedUser(s.parse()?)),
            Some(other) => Err(CredentialLoadError::UnsupportedShape(other.to_owned())),
            None => Err(CredentialLoadError::malformed(
                "credentials do not declare a type",
                "missing field `type`",
            )),
        }
    }

    /// Parse a credential document as the given shape, ignoring its `type` field
    pub fn from_json_as(s: &str, shape: CredentialShape) -> Result<Self, CredentialLoadError> {
        match shape {
            CredentialShape::ServiceAccount => Ok(Self::ServiceAccount(s.parse()?)),
            CredentialShape::AuthorizedUser => Ok(Self::AuthorizedUser(s.parse()?)),
        }
    }

    /// Read a credential file; `shape` overrides detection from the `type` field
    pub async fn from_file(
        path: impl AsRef<Path>,
        shape: Option<CredentialShape>,
    ) -> Result<Self, CredentialLoadError> {
        let path = path.as_ref();
        debug!(?path, ?shape, "reading credentials file");
        let contents = read_credentials_file(path).await?;
        match shape {
            Some(shape) => Self::from_json_as(&contents, shape),
            None => Self::from_json(&contents),
        }
    }

    /// The project ID embedded in the credential material, if any
    pub fn project_id(&self) -> Option<&Arc<str>> {
        match self {
            Self::ServiceAccount(key) => key.project_id.as_ref(),
            Self::AuthorizedUser(user) => user.quota_project_id.as_ref(),
            Self::MetadataServer { .. } => None,
        }
    }
}

/// The declared shape of a credential file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialShape {
    /// A service account key (`"type": "service_account"`)
    ServiceAccount,
    /// User credentials with a refresh token (`"type": "authorized_user"`)
    AuthorizedUser,
}

/// A service account key with its private key parsed into a [`Signer`]
pub struct ServiceAccountKey {
    pub(crate) client_email: String,
    pub(crate) private_key_id: String,
    pub(crate) token_uri: String,
    pub(crate) project_id: Option<Arc<str>>,
    pub(crate) signer: Arc<Signer>,
}

impl ServiceAccountKey {
    /// The service account's email address
    pub fn client_email(&self) -> &str {
        &self.client_email
    }

    /// The RSA PKCS1 SHA256 [`Signer`] built from the key's private key
    pub fn signer(&self) -> &Signer {
        &self.signer
    }
}

impl<'de> Deserialize<'de> for ServiceAccountKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            client_email: String,
            private_key: String,
            private_key_id: String,
            token_uri: String,
            project_id: Option<Arc<str>>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let signer = Signer::new(&raw.private_key).map_err(|err| {
            serde::de::Error::custom(format!("failed to create signer from private key: {err}"))
        })?;

        Ok(Self {
            client_email: raw.client_email,
            private_key_id: raw.private_key_id,
            token_uri: raw.token_uri,
            project_id: raw.project_id,
            signer: Arc::new(signer),
        })
    }
}

impl FromStr for ServiceAccountKey {
    type Err = CredentialLoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s).map_err(|err| {
            CredentialLoadError::malformed("failed to deserialize service account key", err)
        })
    }
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

/// User credentials holding an OAuth refresh token
#[derive(Deserialize)]
pub struct UserCredentials {
    pub(crate) client_id: String,
    pub(crate) client_secret: String,
    pub(crate) refresh_token: String,
    pub(crate) quota_project_id: Option<Arc<str>>,
    pub(crate) token_uri: Option<String>,
}

impl UserCredentials {
    /// The OAuth client ID the refresh token was issued to
    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl FromStr for UserCredentials {
    type Err = CredentialLoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s).map_err(|err| {
            CredentialLoadError::malformed("failed to deserialize user credentials", err)
        })
    }
}

impl fmt::Debug for UserCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserCredentials")
            .field("client_id", &self.client_id)
            .field("quota_project_id", &self.quota_project_id)
            .finish_non_exhaustive()
    }
}

pub(crate) async fn read_credentials_file(path: &Path) -> Result<String, CredentialLoadError> {
    fs::read_to_string(path).await.map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => {
            CredentialLoadError::NotFound(format!("no credentials file at {}", path.display()))
        }
        _ => CredentialLoadError::Io("failed to read credentials file", err),
    })
}

const SERVICE_ACCOUNT_TYPE: &str = "service_account";
const AUTHORIZED_USER_TYPE: &str = "authorized_user";
