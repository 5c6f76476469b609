//! Credential sources: where usernames and passwords come from.
//!
//! # Design
//! The fetch worker must not own any UI. `CredentialPrompt` is the worker's
//! end of a synchronous request/response channel; the UI thread receives a
//! `PromptRequest`, shows whatever it likes, and answers it. The worker
//! blocks on the reply (no polling) until the UI answers, the request is
//! dropped, or the fetch is cancelled.
//!
//! `CachedAccount` puts a previously saved account in front of any other
//! source. Saving is the job of whoever decides credentials worked; the
//! store itself is an external boundary, `MemoryAccountStore` is the
//! in-process default.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};

use tracing::debug;
use url::Url;

use crate::auth::Credentials;
use crate::cancel::CancelToken;
use crate::error::FetchError;
use crate::http::host_header;

pub trait CredentialSource {
    /// Candidate credentials for `url`. `attempt` counts from zero; a
    /// non-zero attempt means the previous candidate was rejected.
    fn credentials(
        &self,
        url: &Url,
        attempt: u32,
        cancel: &CancelToken,
    ) -> Result<Credentials, FetchError>;

    /// Outcome of the last candidate handed out for `url`.
    fn report(&self, _url: &Url, _credentials: &Credentials, _accepted: bool) {}
}

impl<S: CredentialSource + ?Sized> CredentialSource for &S {
    fn credentials(
        &self,
        url: &Url,
        attempt: u32,
        cancel: &CancelToken,
    ) -> Result<Credentials, FetchError> {
        (**self).credentials(url, attempt, cancel)
    }

    fn report(&self, url: &Url, credentials: &Credentials, accepted: bool) {
        (**self).report(url, credentials, accepted)
    }
}

impl<S: CredentialSource + ?Sized> CredentialSource for Arc<S> {
    fn credentials(
        &self,
        url: &Url,
        attempt: u32,
        cancel: &CancelToken,
    ) -> Result<Credentials, FetchError> {
        (**self).credentials(url, attempt, cancel)
    }

    fn report(&self, url: &Url, credentials: &Credentials, accepted: bool) {
        (**self).report(url, credentials, accepted)
    }
}

enum PromptReply {
    Credentials(Credentials),
    Dismissed,
    Cancelled,
}

/// A pending "need credentials for URL" message, answered by the UI.
///
/// Dropping it unanswered counts as the user dismissing the prompt.
pub struct PromptRequest {
    url: Url,
    attempt: u32,
    reply: Option<mpsc::Sender<PromptReply>>,
}

impl PromptRequest {
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Zero for the first prompt of a challenge, then one per rejection.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn respond(mut self, credentials: Credentials) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(PromptReply::Credentials(credentials));
        }
    }

    pub fn dismiss(mut self) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(PromptReply::Dismissed);
        }
    }
}

impl Drop for PromptRequest {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(PromptReply::Dismissed);
        }
    }
}

impl std::fmt::Debug for PromptRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptRequest")
            .field("url", &self.url.as_str())
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Worker side of the prompt channel.
#[derive(Clone)]
pub struct CredentialPrompt {
    requests: mpsc::Sender<PromptRequest>,
}

/// Create a prompt channel. The receiver belongs to the UI thread.
pub fn prompt_channel() -> (CredentialPrompt, mpsc::Receiver<PromptRequest>) {
    let (requests, inbox) = mpsc::channel();
    (CredentialPrompt { requests }, inbox)
}

impl CredentialSource for CredentialPrompt {
    fn credentials(
        &self,
        url: &Url,
        attempt: u32,
        cancel: &CancelToken,
    ) -> Result<Credentials, FetchError> {
        let (reply, answer) = mpsc::channel();
        let wake = reply.clone();
        let _wake_guard = cancel.on_cancel(move || {
            let _ = wake.send(PromptReply::Cancelled);
        });

        debug!(%url, attempt, "prompting for credentials");
        self.requests
            .send(PromptRequest {
                url: url.clone(),
                attempt,
                reply: Some(reply),
            })
            .map_err(|_| FetchError::auth_failed(url))?;

        match answer.recv() {
            Ok(PromptReply::Credentials(credentials)) => Ok(credentials),
            Ok(PromptReply::Cancelled) => Err(FetchError::Cancelled),
            Ok(PromptReply::Dismissed) | Err(_) => Err(FetchError::auth_failed(url)),
        }
    }
}

pub trait AccountStore: Send + Sync {
    fn last_account(&self, url: &Url) -> Option<Credentials>;
    fn save_last_account(&self, url: &Url, credentials: &Credentials);
}

/// Accounts keyed by host and port, kept for the life of the process.
#[derive(Debug, Default)]
pub struct MemoryAccountStore {
    accounts: Mutex<HashMap<String, Credentials>>,
}

impl AccountStore for MemoryAccountStore {
    fn last_account(&self, url: &Url) -> Option<Credentials> {
        let accounts = self.accounts.lock().ok()?;
        accounts.get(&host_header(url)).cloned()
    }

    fn save_last_account(&self, url: &Url, credentials: &Credentials) {
        if let Ok(mut accounts) = self.accounts.lock() {
            accounts.insert(host_header(url), credentials.clone());
        }
    }
}

/// Tries the saved account first, then falls back to `inner`.
pub struct CachedAccount<S> {
    store: Arc<dyn AccountStore>,
    inner: S,
}

impl<S> CachedAccount<S> {
    pub fn new(store: Arc<dyn AccountStore>, inner: S) -> Self {
        Self { store, inner }
    }
}

impl<S: CredentialSource> CredentialSource for CachedAccount<S> {
    fn credentials(
        &self,
        url: &Url,
        attempt: u32,
        cancel: &CancelToken,
    ) -> Result<Credentials, FetchError> {
        if attempt == 0 {
            if let Some(saved) = self.store.last_account(url) {
                debug!(%url, username = %saved.username, "using saved account");
                return Ok(saved);
            }
        }
        self.inner.credentials(url, attempt, cancel)
    }

    fn report(&self, url: &Url, credentials: &Credentials, accepted: bool) {
        self.inner.report(url, credentials, accepted)
    }
}
