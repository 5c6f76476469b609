//! Credential challenges.
//!
//! # Design
//! `CredentialResolver` is the capability the task consults when a server
//! demands credentials. It yields a single-use `AuthorizationToken` or fails
//! with `AuthFailed`; the task then delivers the original `401` instead.
//!
//! `BasicAuthResolver` collects candidates from a `CredentialSource` and,
//! when given a transport, verifies each one with a request of its own
//! before handing the token back. A candidate is accepted when that
//! verification does not come back `401`.

use std::sync::Arc;

use base64::Engine;
use tracing::{debug, warn};
use url::Url;

use crate::cancel::CancelToken;
use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::http::{HttpRequest, AUTHORIZATION};
use crate::prompt::{AccountStore, CredentialSource};
use crate::transport::Transport;

const UNAUTHORIZED: u16 = 401;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Opaque `Authorization` header value. Attached to one hop, then dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthorizationToken(String);

impl AuthorizationToken {
    /// `Basic base64(username:password)`.
    pub fn basic(credentials: &Credentials) -> Self {
        let pair = format!("{}:{}", credentials.username, credentials.password);
        Self(format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(pair)
        ))
    }

    /// Wrap a header value negotiated earlier, e.g. by a previous fetch.
    pub fn from_header_value(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_header_value(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthorizationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = self.0.split_whitespace().next().unwrap_or_default();
        write!(f, "AuthorizationToken({scheme} <redacted>)")
    }
}

pub trait CredentialResolver {
    /// Produce a token for `url`, or `AuthFailed` when the user cancels or
    /// every candidate is rejected. `Cancelled` when `cancel` fires first.
    fn resolve(&self, url: &Url, cancel: &CancelToken) -> Result<AuthorizationToken, FetchError>;
}

impl<R: CredentialResolver + ?Sized> CredentialResolver for &R {
    fn resolve(&self, url: &Url, cancel: &CancelToken) -> Result<AuthorizationToken, FetchError> {
        (**self).resolve(url, cancel)
    }
}

impl<R: CredentialResolver + ?Sized> CredentialResolver for Box<R> {
    fn resolve(&self, url: &Url, cancel: &CancelToken) -> Result<AuthorizationToken, FetchError> {
        (**self).resolve(url, cancel)
    }
}

impl<R: CredentialResolver + ?Sized> CredentialResolver for Arc<R> {
    fn resolve(&self, url: &Url, cancel: &CancelToken) -> Result<AuthorizationToken, FetchError> {
        (**self).resolve(url, cancel)
    }
}

/// Resolver for headless contexts: every challenge fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialResolver for NoCredentials {
    fn resolve(&self, url: &Url, _cancel: &CancelToken) -> Result<AuthorizationToken, FetchError> {
        Err(FetchError::auth_failed(url))
    }
}

/// Basic-auth resolver over a credential source.
pub struct BasicAuthResolver<S> {
    source: S,
    verifier: Option<Box<dyn Transport + Send + Sync>>,
    store: Option<Arc<dyn AccountStore>>,
    config: FetchConfig,
}

impl<S: CredentialSource> BasicAuthResolver<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            verifier: None,
            store: None,
            config: FetchConfig::default(),
        }
    }

    /// Verify every candidate with a request through `transport` before
    /// accepting it. Without a verifier the first candidate is accepted.
    pub fn with_verification(mut self, transport: impl Transport + Send + Sync + 'static) -> Self {
        self.verifier = Some(Box::new(transport));
        self
    }

    /// Save accepted credentials as the last used account.
    pub fn with_store(mut self, store: Arc<dyn AccountStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_config(mut self, config: FetchConfig) -> Self {
        self.config = config;
        self
    }

    fn verify(&self, url: &Url, token: &AuthorizationToken) -> Result<bool, FetchError> {
        let Some(transport) = &self.verifier else {
            return Ok(true);
        };
        let mut request = HttpRequest::get(url.clone(), &self.config);
        request.push_header(AUTHORIZATION, token.as_header_value());
        let response = transport.execute(&request)?;
        debug!(%url, status = response.head.status, "verification response");
        Ok(response.head.status != UNAUTHORIZED)
    }
}

impl<S: CredentialSource> CredentialResolver for BasicAuthResolver<S> {
    fn resolve(&self, url: &Url, cancel: &CancelToken) -> Result<AuthorizationToken, FetchError> {
        for attempt in 0..self.config.max_auth_attempts {
            cancel.check()?;
            let credentials = self.source.credentials(url, attempt, cancel)?;
            let token = AuthorizationToken::basic(&credentials);
            let accepted = self.verify(url, &token)?;
            self.source.report(url, &credentials, accepted);
            if accepted {
                if let Some(store) = &self.store {
                    store.save_last_account(url, &credentials);
                }
                debug!(%url, username = %credentials.username, attempt, "credentials accepted");
                return Ok(token);
            }
            warn!(%url, username = %credentials.username, attempt, "credentials rejected");
        }
        Err(FetchError::auth_failed(url))
    }
}
