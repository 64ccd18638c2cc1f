//! Client configuration.
//!
//! [`RealtimeConfig`] is assembled through [`RealtimeConfigBuilder`], which
//! validates everything up front. [`RealtimeSettings`] is the TOML file form
//! for deployments that keep connection settings on disk.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use parley_proto::{ConnectionParameters, ResolvedCredential};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::{BoxError, Credential};
use crate::error::{Error, Result};
use crate::reconnect::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, ReconnectPolicy};

/// Default timeout for opening a connection.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(30_000);

const ALLOWED_SCHEMES: [&str; 4] = ["ws", "wss", "http", "https"];

/// Who connects, and to which workflow.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionTarget {
    /// Workflow id.
    pub workflow_id: String,
    /// Participant id.
    pub participant_id: String,
    /// Optional scope.
    pub scope: Option<String>,
    /// Optional heartbeat interval.
    pub heartbeat_interval: Option<Duration>,
}

impl ConnectionTarget {
    /// Target a workflow as a participant.
    #[must_use]
    pub fn new(workflow_id: impl Into<String>, participant_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            participant_id: participant_id.into(),
            scope: None,
            heartbeat_interval: None,
        }
    }

    /// Set the scope.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Check that the ids are present and the interval is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.workflow_id.trim().is_empty() {
            return Err(Error::Configuration("workflow_id cannot be empty".to_string()));
        }
        if self.participant_id.trim().is_empty() {
            return Err(Error::Configuration(
                "participant_id cannot be empty".to_string(),
            ));
        }
        if self.heartbeat_interval == Some(Duration::ZERO) {
            return Err(Error::Configuration(
                "heartbeat interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the parameters for one connection attempt.
    #[must_use]
    pub fn parameters(
        &self,
        tenant_id: &str,
        credential: ResolvedCredential,
    ) -> ConnectionParameters {
        ConnectionParameters {
            tenant_id: tenant_id.to_string(),
            workflow_id: self.workflow_id.clone(),
            participant_id: self.participant_id.clone(),
            scope: self.scope.clone(),
            heartbeat_interval: self.heartbeat_interval,
            credential,
        }
    }
}

/// Validated client configuration.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Tenant id.
    pub tenant_id: String,
    /// Backend endpoint.
    pub endpoint: Url,
    /// The single credential source.
    pub credential: Credential,
    /// Initial connection target.
    pub target: ConnectionTarget,
    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,
    /// Timeout for opening a connection.
    pub connection_timeout: Duration,
}

impl RealtimeConfig {
    /// Start building a configuration.
    #[must_use]
    pub fn builder() -> RealtimeConfigBuilder {
        RealtimeConfigBuilder::default()
    }
}

/// Builder for [`RealtimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RealtimeConfigBuilder {
    tenant_id: Option<String>,
    endpoint: Option<String>,
    credentials: Vec<Credential>,
    target: ConnectionTarget,
    max_attempts: Option<u32>,
    base_delay: Option<Duration>,
    connection_timeout: Option<Duration>,
    auto_reconnect: Option<bool>,
}

impl RealtimeConfigBuilder {
    /// Set the tenant id.
    #[must_use]
    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Set the backend endpoint (`ws`, `wss`, `http` or `https`).
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Authenticate with a static API key.
    #[must_use]
    pub fn api_key(self, key: impl Into<String>) -> Self {
        self.credential(Credential::ApiKey(key.into()))
    }

    /// Authenticate with a static bearer token.
    #[must_use]
    pub fn static_token(self, token: impl Into<String>) -> Self {
        self.credential(Credential::StaticToken(token.into()))
    }

    /// Authenticate with a token fetched before every connection attempt.
    #[must_use]
    pub fn token_callback<F, Fut>(self, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<String, BoxError>> + Send + 'static,
    {
        self.credential(Credential::callback(callback))
    }

    /// Add a credential source. Configuring more than one fails at
    /// [`build`](Self::build).
    #[must_use]
    pub fn credential(mut self, credential: Credential) -> Self {
        self.credentials.push(credential);
        self
    }

    /// Replace the whole connection target.
    #[must_use]
    pub fn target(mut self, target: ConnectionTarget) -> Self {
        self.target = target;
        self
    }

    /// Set the workflow id.
    #[must_use]
    pub fn workflow(mut self, workflow_id: impl Into<String>) -> Self {
        self.target.workflow_id = workflow_id.into();
        self
    }

    /// Set the participant id.
    #[must_use]
    pub fn participant(mut self, participant_id: impl Into<String>) -> Self {
        self.target.participant_id = participant_id.into();
        self
    }

    /// Set the scope.
    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.target.scope = Some(scope.into());
        self
    }

    /// Ask the client to send heartbeats at this interval.
    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.target.heartbeat_interval = Some(interval);
        self
    }

    /// Maximum reconnection attempts (default 5).
    #[must_use]
    pub const fn reconnect_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay before the first reconnection attempt (default 5000 ms).
    #[must_use]
    pub const fn reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Timeout for opening a connection (default 30000 ms).
    #[must_use]
    pub const fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Enable or disable automatic reconnection (default enabled).
    #[must_use]
    pub const fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = Some(enabled);
        self
    }

    /// Validate and build the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if a required value is missing, more
    /// than one credential source is set, or a value is out of range.
    pub fn build(self) -> Result<RealtimeConfig> {
        let tenant_id = self
            .tenant_id
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| Error::Configuration("tenant_id is required".to_string()))?;

        let endpoint = self
            .endpoint
            .ok_or_else(|| Error::Configuration("endpoint is required".to_string()))?;
        let endpoint = parse_endpoint(&endpoint)?;

        let mut credentials = self.credentials.into_iter();
        let credential = credentials.next().ok_or_else(|| {
            Error::Configuration(
                "a credential is required (api key, static token or token callback)".to_string(),
            )
        })?;
        if credentials.next().is_some() {
            return Err(Error::Configuration(
                "exactly one credential source may be configured".to_string(),
            ));
        }
        match &credential {
            Credential::ApiKey(value) | Credential::StaticToken(value)
                if value.trim().is_empty() =>
            {
                return Err(Error::Configuration(format!(
                    "{} cannot be empty",
                    credential.source_name()
                )));
            }
            _ => {}
        }

        self.target.validate()?;

        let base_delay = self.base_delay.unwrap_or(DEFAULT_BASE_DELAY);
        if base_delay.is_zero() {
            return Err(Error::Configuration(
                "reconnect base delay must be greater than 0".to_string(),
            ));
        }
        let connection_timeout = self
            .connection_timeout
            .unwrap_or(DEFAULT_CONNECTION_TIMEOUT);
        if connection_timeout.is_zero() {
            return Err(Error::Configuration(
                "connection timeout must be greater than 0".to_string(),
            ));
        }

        Ok(RealtimeConfig {
            tenant_id,
            endpoint,
            credential,
            target: self.target,
            reconnect: ReconnectPolicy {
                enabled: self.auto_reconnect.unwrap_or(true),
                max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
                base_delay,
            },
            connection_timeout,
        })
    }
}

/// Parse an endpoint and check its scheme.
///
/// # Errors
///
/// Returns [`Error::Configuration`] if the URL is malformed or the scheme is
/// not one of `ws`, `wss`, `http`, `https`.
pub fn parse_endpoint(endpoint: &str) -> Result<Url> {
    let url = Url::parse(endpoint)
        .map_err(|e| Error::Configuration(format!("invalid endpoint '{endpoint}': {e}")))?;
    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(Error::Configuration(format!(
            "endpoint scheme must be one of ws, wss, http, https (got '{}')",
            url.scheme()
        )));
    }
    Ok(url)
}

/// Reconnection section of [`RealtimeSettings`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectSettings {
    /// Whether to reconnect automatically.
    pub enabled: bool,
    /// Maximum attempts.
    pub max_attempts: u32,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
        }
    }
}

const fn default_connection_timeout_ms() -> u64 {
    DEFAULT_CONNECTION_TIMEOUT.as_millis() as u64
}

/// Connection settings as stored in a TOML file.
///
/// A token callback cannot live in a file; leave both `api_key` and `token`
/// unset and add the callback to the builder returned by
/// [`into_builder`](Self::into_builder).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RealtimeSettings {
    /// Tenant id.
    pub tenant_id: String,
    /// Backend endpoint.
    pub endpoint: String,
    /// Static API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Static bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Workflow id.
    pub workflow_id: String,
    /// Participant id.
    pub participant_id: String,
    /// Optional scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Heartbeat interval in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_ms: Option<u64>,
    /// Connection timeout in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Reconnection settings.
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

impl RealtimeSettings {
    /// Load settings from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Configuration(format!(
                "failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse settings from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Self = toml::from_str(content)
            .map_err(|e| Error::Configuration(format!("invalid TOML: {e}")))?;

        settings.validate()?;
        Ok(settings)
    }

    /// Serialize to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("failed to serialize settings: {e}")))
    }

    /// Validate the settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(Error::Configuration("tenant_id cannot be empty".to_string()));
        }
        parse_endpoint(&self.endpoint)?;

        if self.api_key.is_some() && self.token.is_some() {
            return Err(Error::Configuration(
                "api_key and token are mutually exclusive".to_string(),
            ));
        }

        self.target().validate()?;

        if self.connection_timeout_ms == 0 {
            return Err(Error::Configuration(
                "connection_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(Error::Configuration(
                "reconnect.base_delay_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn target(&self) -> ConnectionTarget {
        ConnectionTarget {
            workflow_id: self.workflow_id.clone(),
            participant_id: self.participant_id.clone(),
            scope: self.scope.clone(),
            heartbeat_interval: self.heartbeat_interval_ms.map(Duration::from_millis),
        }
    }

    /// Convert into a builder, carrying the file's credential if it has one.
    #[must_use]
    pub fn into_builder(self) -> RealtimeConfigBuilder {
        let mut builder = RealtimeConfig::builder()
            .tenant_id(self.tenant_id.clone())
            .endpoint(self.endpoint.clone())
            .target(self.target())
            .reconnect_max_attempts(self.reconnect.max_attempts)
            .reconnect_base_delay(Duration::from_millis(self.reconnect.base_delay_ms))
            .connection_timeout(Duration::from_millis(self.connection_timeout_ms))
            .auto_reconnect(self.reconnect.enabled);
        if let Some(key) = self.api_key {
            builder = builder.api_key(key);
        }
        if let Some(token) = self.token {
            builder = builder.static_token(token);
        }
        builder
    }
}
