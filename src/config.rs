use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

/// Environment variable holding either inline credential JSON or a path to a credential file
pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";
/// Environment variable overriding the metadata server host
pub const METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";
/// Environment variable that disables probing for the metadata server
pub const NO_METADATA_CHECK_ENV: &str = "NO_GCE_CHECK";
/// Environment variables consulted, in order, for a fallback project ID
pub const PROJECT_ID_ENVS: [&str; 2] = ["PROJECT_ID", "GOOGLE_PROJECT_ID"];

/// Settings read from the process environment
///
/// [`Config::from_env()`] captures the environment once; the resolver and the token providers
/// only ever consult this snapshot. The `with_*` setters override individual values, which is
/// mostly useful for embedding and tests.
#[derive(Clone)]
pub struct Config {
    credentials: Option<String>,
    metadata_host: String,
    skip_metadata_probe: bool,
    project_id: Option<Arc<str>>,
    well_known_file: Option<PathBuf>,
    probe_attempts: u8,
    probe_timeout: Duration,
    request_timeout: Duration,
}

impl Config {
    /// Capture the relevant environment variables
    pub fn from_env() -> Self {
        let credentials = env::var(CREDENTIALS_ENV).ok().filter(|v| !v.is_empty());
        let metadata_host = env::var(METADATA_HOST_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_METADATA_HOST.to_owned());
        let skip_metadata_probe = env::var(NO_METADATA_CHECK_ENV)
            .map(|v| is_truthy(&v))
            .unwrap_or(false);
        let project_id = PROJECT_ID_ENVS
            .iter()
            .find_map(|name| env::var(name).ok().filter(|v| !v.is_empty()))
            .map(Arc::from);

        let config = Self {
            credentials,
            metadata_host,
            skip_metadata_probe,
            project_id,
            well_known_file: well_known_file(),
            ..Self::default()
        };

        debug!(?config, "read configuration from environment");
        config
    }

    /// Use `value` as if it were the contents of `GOOGLE_APPLICATION_CREDENTIALS`
    pub fn with_credentials(mut self, value: impl Into<String>) -> Self {
        self.credentials = Some(value.into());
        self
    }

    /// Use `host` instead of `metadata.google.internal`
    ///
    /// The host may carry a port and an explicit `http://` scheme.
    pub fn with_metadata_host(mut self, host: impl Into<String>) -> Self {
        self.metadata_host = host.into();
        self
    }

    /// Never probe for the metadata server during ambient discovery
    pub fn with_metadata_probe_disabled(mut self, disabled: bool) -> Self {
        self.skip_metadata_probe = disabled;
        self
    }

    /// Project ID reported when the credential itself does not carry one
    pub fn with_project_id(mut self, project_id: impl Into<Arc<str>>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Location of the gcloud application default credentials file
    ///
    /// `None` disables that step of ambient discovery.
    pub fn with_well_known_file(mut self, path: Option<PathBuf>) -> Self {
        self.well_known_file = path;
        self
    }

    /// Number of metadata server probe attempts and the timeout for each of them
    pub fn with_probe(mut self, attempts: u8, timeout: Duration) -> Self {
        self.probe_attempts = attempts;
        self.probe_timeout = timeout;
        self
    }

    /// Timeout applied to every token request
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub(crate) fn credentials(&self) -> Option<&str> {
        self.credentials.as_deref()
    }

    /// Base URL of the metadata server, without a trailing slash
    pub fn metadata_base_url(&self) -> String {
        let host = self.metadata_host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            host.to_owned()
        } else {
            format!("http://{host}")
        }
    }

    pub(crate) fn skip_metadata_probe(&self) -> bool {
        self.skip_metadata_probe
    }

    pub(crate) fn project_id(&self) -> Option<&Arc<str>> {
        self.project_id.as_ref()
    }

    pub(crate) fn well_known_file(&self) -> Option<&Path> {
        self.well_known_file.as_deref()
    }

    pub(crate) fn probe_attempts(&self) -> u8 {
        self.probe_attempts
    }

    pub(crate) fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    pub(crate) fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}

impl Default for Config {
    /// An empty environment: no credentials, default metadata host, default timeouts
    fn default() -> Self {
        Self {
            credentials: None,
            metadata_host: DEFAULT_METADATA_HOST.to_owned(),
            skip_metadata_probe: false,
            project_id: None,
            well_known_file: None,
            probe_attempts: PROBE_ATTEMPTS,
            probe_timeout: PROBE_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Inline JSON may contain a private key.
        let credentials = self.credentials.as_deref().map(|value| {
            if value.trim_start().starts_with('{') {
                "<inline JSON>"
            } else {
                value
            }
        });

        f.debug_struct("Config")
            .field("credentials", &credentials)
            .field("metadata_host", &self.metadata_host)
            .field("skip_metadata_probe", &self.skip_metadata_probe)
            .field("project_id", &self.project_id)
            .field("well_known_file", &self.well_known_file)
            .field("probe_attempts", &self.probe_attempts)
            .field("probe_timeout", &self.probe_timeout)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    value == "1" || value.eq_ignore_ascii_case("true")
}

#[cfg(not(windows))]
fn well_known_file() -> Option<PathBuf> {
    let mut path = home::home_dir()?;
    path.push(".config");
    path.push(WELL_KNOWN_FILE);
    Some(path)
}

#[cfg(windows)]
fn well_known_file() -> Option<PathBuf> {
    let mut path = PathBuf::from(env::var_os("APPDATA")?);
    path.push(WELL_KNOWN_FILE);
    Some(path)
}

const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const WELL_KNOWN_FILE: &str = "gcloud/application_default_credentials.json";
const PROBE_ATTEMPTS: u8 = 5;
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
