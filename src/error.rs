use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Enumerates all possible errors returned by this library.
#[derive(Error, Debug)]
pub enum Error {
    /// The credential source could not be located or parsed
    #[error(transparent)]
    CredentialLoad(#[from] CredentialLoadError),

    /// A token could not be obtained from an otherwise valid credential
    #[error(transparent)]
    TokenAcquisition(#[from] TokenAcquisitionError),

    /// The library was asked to do something the credential cannot support
    #[error("{0}")]
    Str(&'static str),

    /// An I/O error while setting up the HTTP transport
    #[error("{0}")]
    Io(&'static str, #[source] std::io::Error),
}

/// Failure to turn a credential source into credential material
///
/// Outside of the ambient discovery order these are terminal: no other source is tried once
/// an explicit source fails to load.
#[derive(Error, Debug)]
pub enum CredentialLoadError {
    /// The source does not exist (file missing, environment variable unset, nothing discovered)
    #[error("credentials not found: {0}")]
    NotFound(String),

    /// The source exists but is not a valid credential document
    ///
    /// Covers invalid JSON, missing required fields and unusable private keys.
    #[error("malformed credentials: {context}")]
    Malformed {
        context: &'static str,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// The credential document declares a `type` this library does not handle
    #[error("unsupported credential type `{0}`")]
    UnsupportedShape(String),

    /// Reading the credential file failed for a reason other than it being absent
    #[error("{0}")]
    Io(&'static str, #[source] std::io::Error),
}

impl CredentialLoadError {
    pub(crate) fn malformed(
        context: &'static str,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self::Malformed {
            context,
            source: source.into(),
        }
    }
}

/// Failure to produce a bearer token
///
/// This type is cheap to clone so the outcome of a single refresh can be handed to every
/// caller that waited on it.
#[derive(Error, Debug, Clone)]
pub enum TokenAcquisitionError {
    /// The request could not be sent or the response could not be read
    #[error("{context}")]
    Network {
        context: &'static str,
        #[source]
        source: Arc<dyn StdError + Send + Sync>,
    },

    /// The request did not complete within the allotted time
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The token endpoint answered with a non-success status
    ///
    /// `detail` carries the upstream OAuth error (`error: error_description`) when the body
    /// could be decoded as one, or the raw body otherwise.
    #[error("token endpoint returned {status}: {detail}")]
    HttpStatus { status: u16, detail: String },

    /// Signing a JWT with the credential's private key failed
    #[error("signing failed: {0}")]
    Signing(&'static str),

    /// The response body did not have the expected shape
    #[error("{context}")]
    Decoding {
        context: &'static str,
        #[source]
        source: Arc<serde_json::Error>,
    },

    /// The response body exceeded the size cap
    #[error("response body exceeded {0} bytes")]
    ResponseTooLarge(usize),

    /// The refresh task ended without publishing a result
    #[error("token refresh was interrupted")]
    Interrupted,
}

impl TokenAcquisitionError {
    pub(crate) fn network(
        context: &'static str,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Network {
            context,
            source: Arc::new(source),
        }
    }

    pub(crate) fn decoding(context: &'static str, source: serde_json::Error) -> Self {
        Self::Decoding {
            context,
            source: Arc::new(source),
        }
    }
}
