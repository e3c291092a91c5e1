//! Sender configuration.

use crate::auth::Credentials;
use crate::connection::ClientOptions;
use crate::error::{Error, Result};
use crate::types::AuthMechanism;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Whether and how to authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "AuthValue", into = "AuthValue")]
pub enum AuthSetting {
    /// Do not authenticate.
    #[default]
    Disabled,
    /// Use the strongest mechanism both sides support.
    Best,
    /// Use this mechanism.
    Mechanism(AuthMechanism),
}

impl AuthSetting {
    /// Returns true unless authentication is disabled.
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Returns the explicitly requested mechanism.
    #[must_use]
    pub const fn mechanism(self) -> Option<AuthMechanism> {
        match self {
            Self::Mechanism(mechanism) => Some(mechanism),
            Self::Disabled | Self::Best => None,
        }
    }
}

/// JSON form of [`AuthSetting`]: `false`, `true` or a mechanism name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum AuthValue {
    Flag(bool),
    Name(String),
}

impl TryFrom<AuthValue> for AuthSetting {
    type Error = String;

    fn try_from(value: AuthValue) -> std::result::Result<Self, Self::Error> {
        match value {
            AuthValue::Flag(false) => Ok(Self::Disabled),
            AuthValue::Flag(true) => Ok(Self::Best),
            AuthValue::Name(name) => AuthMechanism::parse(&name)
                .map(Self::Mechanism)
                .ok_or_else(|| format!("unknown authentication mechanism: {name}")),
        }
    }
}

impl From<AuthSetting> for AuthValue {
    fn from(setting: AuthSetting) -> Self {
        match setting {
            AuthSetting::Disabled => Self::Flag(false),
            AuthSetting::Best => Self::Flag(true),
            AuthSetting::Mechanism(mechanism) => Self::Name(mechanism.as_str().to_string()),
        }
    }
}

/// SMTP sender configuration.
///
/// Every field has a default, so a JSON file only needs the fields it
/// changes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server host name, IP address or Unix socket path; `ssl://` or
    /// `tls://` selects implicit TLS.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Authentication mode.
    pub auth: AuthSetting,
    /// Login name.
    pub username: String,
    /// Password.
    pub password: String,
    /// Name sent with EHLO/HELO.
    pub local_hostname: String,
    /// Read/write timeout in seconds; absent or 0 waits indefinitely.
    pub timeout_seconds: Option<u64>,
    /// Trace the SMTP conversation.
    pub debug: bool,
    /// Keep the connection open between messages.
    pub persist: bool,
    /// Use PIPELINING when the server supports it.
    pub pipelining: bool,
    /// ESMTP parameters appended to MAIL FROM, e.g. `XVERP`.
    pub extension_params: BTreeMap<String, Option<String>>,
    /// Upgrade with STARTTLS before authenticating, when offered.
    pub starttls: bool,
    /// Authorization identity for PLAIN and DIGEST-MD5.
    pub authorization_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: crate::DEFAULT_PORT,
            auth: AuthSetting::Disabled,
            username: String::new(),
            password: String::new(),
            local_hostname: "localhost".to_string(),
            timeout_seconds: None,
            debug: false,
            persist: false,
            pipelining: false,
            extension_params: BTreeMap::new(),
            starttls: true,
            authorization_id: String::new(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("auth", &self.auth)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("local_hostname", &self.local_hostname)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("debug", &self.debug)
            .field("persist", &self.persist)
            .field("pipelining", &self.pipelining)
            .field("extension_params", &self.extension_params)
            .field("starttls", &self.starttls)
            .field("authorization_id", &self.authorization_id)
            .finish()
    }
}

impl Config {
    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(host: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(host)
    }

    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for malformed JSON, an unknown mechanism
    /// name, or an invalid combination of settings.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, or any error from
    /// [`Config::from_json`].
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Self::from_json(&json)
    }

    /// Checks settings that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        if self.port == 0 && !self.host.starts_with('/') {
            return Err(Error::Config("port must not be 0".into()));
        }
        if self.local_hostname.contains(char::is_whitespace) {
            return Err(Error::Config("local_hostname must not contain whitespace".into()));
        }
        if self.auth.is_enabled() && self.username.is_empty() {
            return Err(Error::Config("auth requires a username".into()));
        }
        if let Some(key) = self
            .extension_params
            .keys()
            .find(|key| key.is_empty() || key.contains(|c: char| c.is_whitespace() || c == '='))
        {
            return Err(Error::Config(format!("invalid extension keyword: {key:?}")));
        }
        Ok(())
    }

    /// Returns the timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Returns the protocol engine settings.
    #[must_use]
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            local_name: self.local_hostname.clone(),
            pipelining: self.pipelining,
            timeout: self.timeout(),
            debug: self.debug,
            ..ClientOptions::default()
        }
    }

    /// Returns the login credentials.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials {
            username: self.username.clone(),
            password: self.password.clone(),
            authorization_id: self.authorization_id.clone(),
        }
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Creates a builder for `host` with all other settings at their defaults.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            config: Config {
                host: host.into(),
                ..Config::default()
            },
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets the authentication mode.
    #[must_use]
    pub const fn auth(mut self, auth: AuthSetting) -> Self {
        self.config.auth = auth;
        self
    }

    /// Sets the login name and password.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.username = username.into();
        self.config.password = password.into();
        self
    }

    /// Sets the authorization identity.
    #[must_use]
    pub fn authorization_id(mut self, authorization_id: impl Into<String>) -> Self {
        self.config.authorization_id = authorization_id.into();
        self
    }

    /// Sets the name sent with EHLO/HELO.
    #[must_use]
    pub fn local_hostname(mut self, local_hostname: impl Into<String>) -> Self {
        self.config.local_hostname = local_hostname.into();
        self
    }

    /// Sets the read/write timeout (whole seconds).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_seconds = Some(timeout.as_secs());
        self
    }

    /// Enables conversation tracing.
    #[must_use]
    pub const fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Keeps the connection open between messages.
    #[must_use]
    pub const fn persist(mut self, persist: bool) -> Self {
        self.config.persist = persist;
        self
    }

    /// Enables pipelining when offered.
    #[must_use]
    pub const fn pipelining(mut self, pipelining: bool) -> Self {
        self.config.pipelining = pipelining;
        self
    }

    /// Controls STARTTLS before authentication.
    #[must_use]
    pub const fn starttls(mut self, starttls: bool) -> Self {
        self.config.starttls = starttls;
        self
    }

    /// Adds a MAIL FROM parameter.
    #[must_use]
    pub fn extension_param(mut self, keyword: impl Into<String>, value: Option<String>) -> Self {
        self.config.extension_params.insert(keyword.into(), value);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> Config {
        self.config
    }
}
