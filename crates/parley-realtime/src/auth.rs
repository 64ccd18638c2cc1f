//! Credential sources and their per-attempt resolution.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use parley_proto::ResolvedCredential;

use crate::error::{Error, Result};

/// Error type a token callback may fail with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Future returned by a token callback.
pub type TokenFuture = Pin<Box<dyn Future<Output = std::result::Result<String, BoxError>> + Send>>;

/// Async callback producing a fresh bearer token.
pub type TokenCallback = Arc<dyn Fn() -> TokenFuture + Send + Sync>;

/// The single active credential source.
#[derive(Clone)]
pub enum Credential {
    /// Static API key.
    ApiKey(String),
    /// Static bearer token.
    StaticToken(String),
    /// Bearer token fetched on every connection attempt.
    TokenCallback(TokenCallback),
}

impl Credential {
    /// Build a callback credential from an async closure.
    pub fn callback<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<String, BoxError>> + Send + 'static,
    {
        Self::TokenCallback(Arc::new(move || -> TokenFuture { Box::pin(f()) }))
    }

    /// Short name of the active source, safe to log.
    #[must_use]
    pub const fn source_name(&self) -> &'static str {
        match self {
            Self::ApiKey(_) => "api_key",
            Self::StaticToken(_) => "static_token",
            Self::TokenCallback(_) => "token_callback",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&self.source_name()).finish()
    }
}

/// Resolves the current credential for a connection attempt.
///
/// Nothing is cached: each call to [`AuthProvider::resolve`] re-reads static
/// values and re-invokes the callback.
#[derive(Debug, Clone)]
pub struct AuthProvider {
    credential: Credential,
}

impl AuthProvider {
    /// Create a provider for the given credential.
    #[must_use]
    pub const fn new(credential: Credential) -> Self {
        Self { credential }
    }

    /// The active credential source.
    #[must_use]
    pub const fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Replace the credential with an API key.
    pub fn set_api_key(&mut self, key: impl Into<String>) {
        self.credential = Credential::ApiKey(key.into());
    }

    /// Replace the credential with a static token.
    pub fn set_static_token(&mut self, token: impl Into<String>) {
        self.credential = Credential::StaticToken(token.into());
    }

    /// Replace the credential with a callback.
    pub fn set_callback(&mut self, callback: TokenCallback) {
        self.credential = Credential::TokenCallback(callback);
    }

    /// Replace the credential wholesale.
    pub fn set(&mut self, credential: Credential) {
        self.credential = credential;
    }

    /// Resolve the credential for one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthResolution`] if the callback fails or panics, or
    /// any source yields an empty secret.
    pub async fn resolve(&self) -> Result<ResolvedCredential> {
        resolve_credential(&self.credential).await
    }
}

/// Resolve a credential without holding a provider borrow across the await.
pub(crate) async fn resolve_credential(credential: &Credential) -> Result<ResolvedCredential> {
    let resolved = match credential {
        Credential::ApiKey(key) => ResolvedCredential::api_key(key.clone()),
        Credential::StaticToken(token) => ResolvedCredential::bearer(token.clone()),
        Credential::TokenCallback(callback) => {
            let token = AssertUnwindSafe(async { callback().await })
                .catch_unwind()
                .await
                .map_err(|_| Error::AuthResolution("token callback panicked".to_string()))?
                .map_err(|e| Error::AuthResolution(e.to_string()))?;
            ResolvedCredential::bearer(token)
        }
    };

    if resolved.secret().trim().is_empty() {
        return Err(Error::AuthResolution(format!(
            "{} resolved to an empty credential",
            credential.source_name()
        )));
    }
    Ok(resolved)
}
