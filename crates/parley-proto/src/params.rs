//! Per-attempt connection parameters.

use std::fmt;
use std::time::Duration;

/// How a resolved secret is presented to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Long-lived API key.
    ApiKey,
    /// Bearer token (static or produced by a callback).
    BearerToken,
}

/// A credential resolved for exactly one connection attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    kind: CredentialKind,
    secret: String,
}

impl ResolvedCredential {
    /// Wrap an API key.
    #[must_use]
    pub fn api_key(secret: impl Into<String>) -> Self {
        Self {
            kind: CredentialKind::ApiKey,
            secret: secret.into(),
        }
    }

    /// Wrap a bearer token.
    #[must_use]
    pub fn bearer(secret: impl Into<String>) -> Self {
        Self {
            kind: CredentialKind::BearerToken,
            secret: secret.into(),
        }
    }

    /// The credential kind.
    #[must_use]
    pub const fn kind(&self) -> CredentialKind {
        self.kind
    }

    /// The raw secret.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// The HTTP header carrying this credential.
    #[must_use]
    pub fn header(&self) -> (&'static str, String) {
        match self.kind {
            CredentialKind::ApiKey => ("x-api-key", self.secret.clone()),
            CredentialKind::BearerToken => ("authorization", format!("Bearer {}", self.secret)),
        }
    }
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("kind", &self.kind)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Everything a transport needs to open one connection.
///
/// Built fresh for every attempt so rotated credentials and updated targets
/// take effect on reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParameters {
    /// Tenant namespace.
    pub tenant_id: String,
    /// Workflow to attach to.
    pub workflow_id: String,
    /// Participant identity.
    pub participant_id: String,
    /// Optional scope narrowing the subscription.
    pub scope: Option<String>,
    /// Optional client heartbeat interval.
    pub heartbeat_interval: Option<Duration>,
    /// Credential resolved for this attempt.
    pub credential: ResolvedCredential,
}

impl ConnectionParameters {
    /// Query parameters identifying the session. The credential is never
    /// included; transports attach it as a header.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("tenantId", self.tenant_id.clone()),
            ("workflowId", self.workflow_id.clone()),
            ("participantId", self.participant_id.clone()),
        ];
        if let Some(scope) = &self.scope {
            pairs.push(("scope", scope.clone()));
        }
        if let Some(interval) = self.heartbeat_interval {
            pairs.push(("heartbeatIntervalMs", interval.as_millis().to_string()));
        }
        pairs
    }
}
