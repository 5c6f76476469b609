//! Bridge between an embedded browser surface and the credential layer.
//!
//! # Design
//! Some servers log users in through a web page instead of a bare `401`.
//! The host forwards its browser callbacks as `BrowserEvent`s; the bridge
//! keeps a shared `LoginModel` up to date, keeps navigation inside the same
//! surface, and answers HTTP auth requests from a `CredentialSource` on a
//! background thread so the UI thread never blocks on a prompt.
//!
//! Credentials handed to the browser are only a candidate. The account is
//! reported and persisted when the page content changes afterwards; a
//! second auth request in between means the candidate was rejected.
//!
//! The session owns its event queue. Host callbacks post through
//! `LoginEvents`; the answering thread and the session's `CancelToken` post
//! into the same queue, so `run` settles even when the browser stays silent
//! after a challenge is cancelled.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use tracing::{debug, info, warn};
use url::Url;

use crate::auth::Credentials;
use crate::cancel::CancelToken;
use crate::error::FetchError;
use crate::prompt::{AccountStore, CredentialSource};

/// What the bridge needs from the browser view.
pub trait BrowserSurface {
    fn load_url(&self, url: &str);
}

/// An HTTP auth request the browser is waiting on. Answer it exactly once.
pub trait PendingChallenge: Send {
    fn proceed(self: Box<Self>, credentials: &Credentials);
    fn cancel(self: Box<Self>);
}

pub enum BrowserEvent {
    PageFinished {
        url: String,
    },
    AuthRequested {
        host: String,
        realm: String,
        challenge: Box<dyn PendingChallenge>,
    },
    NavigationRequested {
        url: String,
    },
    ContentChanged,
}

impl std::fmt::Debug for BrowserEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrowserEvent::PageFinished { url } => {
                f.debug_struct("PageFinished").field("url", url).finish()
            }
            BrowserEvent::AuthRequested { host, realm, .. } => f
                .debug_struct("AuthRequested")
                .field("host", host)
                .field("realm", realm)
                .finish_non_exhaustive(),
            BrowserEvent::NavigationRequested { url } => f
                .debug_struct("NavigationRequested")
                .field("url", url)
                .finish(),
            BrowserEvent::ContentChanged => f.write_str("ContentChanged"),
        }
    }
}

/// State observed by the host's UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginModel {
    pub current_url: Option<String>,
    pub content_version: u64,
}

pub type SharedLoginModel = Arc<Mutex<LoginModel>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Succeeded(Credentials),
    StillPending,
    Cancelled,
}

enum Signal {
    Browser(BrowserEvent),
    Settled,
}

/// Host side of a login session's event queue.
#[derive(Clone)]
pub struct LoginEvents {
    tx: Sender<Signal>,
}

impl LoginEvents {
    /// Queue a browser callback. Returns `false` once the session is gone.
    pub fn send(&self, event: BrowserEvent) -> bool {
        self.tx.send(Signal::Browser(event)).is_ok()
    }
}

impl std::fmt::Debug for LoginEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginEvents").finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Progress {
    pending_account: Option<Credentials>,
    cancelled: bool,
}

pub struct InteractiveLogin<B, S> {
    surface: B,
    source: Arc<S>,
    model: SharedLoginModel,
    progress: Arc<Mutex<Progress>>,
    target: Option<Url>,
    auth_requests: u32,
    cancel: CancelToken,
    inbox: Receiver<Signal>,
    wake: Sender<Signal>,
}

impl<B, S> InteractiveLogin<B, S>
where
    B: BrowserSurface,
    S: CredentialSource + Send + Sync + 'static,
{
    pub fn new(surface: B, source: Arc<S>) -> Self {
        let (wake, inbox) = mpsc::channel();
        Self {
            surface,
            source,
            model: SharedLoginModel::default(),
            progress: Arc::default(),
            target: None,
            auth_requests: 0,
            cancel: CancelToken::new(),
            inbox,
            wake,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sender for the host's browser callbacks, consumed by `run`.
    pub fn events(&self) -> LoginEvents {
        LoginEvents {
            tx: self.wake.clone(),
        }
    }

    pub fn model(&self) -> SharedLoginModel {
        Arc::clone(&self.model)
    }

    /// The login target: the first page loaded in the surface.
    pub fn target(&self) -> Option<&Url> {
        self.target.as_ref()
    }

    /// Load the login page.
    pub fn open(&mut self, url: &str) -> Result<(), FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::invalid_url(url, e))?;
        info!(url = %parsed, "opening login page");
        self.target = Some(parsed);
        self.surface.load_url(url);
        Ok(())
    }

    pub fn handle(&mut self, event: BrowserEvent) -> LoginOutcome {
        debug!(?event, "browser event");
        match event {
            BrowserEvent::PageFinished { url } => {
                if self.target.is_none() {
                    self.target = Url::parse(&url).ok();
                }
                lock(&self.model).current_url = Some(url);
            }
            BrowserEvent::AuthRequested {
                host, challenge, ..
            } => self.answer_challenge(&host, challenge),
            BrowserEvent::NavigationRequested { url } => self.surface.load_url(&url),
            BrowserEvent::ContentChanged => {
                lock(&self.model).content_version += 1;
                let account = lock(&self.progress).pending_account.take();
                if let Some(account) = account {
                    if let Some(url) = &self.target {
                        self.source.report(url, &account, true);
                    }
                    info!(username = %account.username, "login succeeded");
                    return LoginOutcome::Succeeded(account);
                }
            }
        }
        self.status()
    }

    /// Handle queued events until the login succeeds or is cancelled. A
    /// successful account is saved in `store` under the login target.
    ///
    /// Returns `Cancelled` as soon as an auth request is abandoned or the
    /// session's token is cancelled, without waiting for another browser
    /// event.
    pub fn run(&mut self, store: &dyn AccountStore) -> LoginOutcome {
        let wake = self.wake.clone();
        let _cancel_hook = self.cancel.on_cancel(move || {
            let _ = wake.send(Signal::Settled);
        });
        loop {
            let outcome = match self.inbox.recv() {
                Ok(Signal::Browser(event)) => self.handle(event),
                Ok(Signal::Settled) => self.status(),
                Err(_) => LoginOutcome::Cancelled,
            };
            match outcome {
                LoginOutcome::StillPending => continue,
                LoginOutcome::Succeeded(account) => {
                    if let Some(url) = &self.target {
                        store.save_last_account(url, &account);
                    }
                    return LoginOutcome::Succeeded(account);
                }
                LoginOutcome::Cancelled => return LoginOutcome::Cancelled,
            }
        }
    }

    fn status(&self) -> LoginOutcome {
        if self.cancel.is_cancelled() || lock(&self.progress).cancelled {
            LoginOutcome::Cancelled
        } else {
            LoginOutcome::StillPending
        }
    }

    fn answer_challenge(&mut self, host: &str, challenge: Box<dyn PendingChallenge>) {
        let url = match self.target.clone() {
            Some(url) => url,
            None => match Url::parse(&format!("https://{host}/")) {
                Ok(url) => url,
                Err(e) => {
                    warn!(host, error = %e, "auth request for unusable host");
                    challenge.cancel();
                    lock(&self.progress).cancelled = true;
                    return;
                }
            },
        };

        let rejected = lock(&self.progress).pending_account.take();
        if let Some(rejected) = rejected {
            self.source.report(&url, &rejected, false);
        }

        let attempt = self.auth_requests;
        self.auth_requests += 1;
        let source = Arc::clone(&self.source);
        let progress = Arc::clone(&self.progress);
        let cancel = self.cancel.clone();
        let wake = self.wake.clone();
        thread::spawn(move || match source.credentials(&url, attempt, &cancel) {
            Ok(credentials) => {
                // record before proceeding so the content change cannot race ahead
                lock(&progress).pending_account = Some(credentials.clone());
                challenge.proceed(&credentials);
            }
            Err(e) => {
                debug!(%url, error = %e, "auth request abandoned");
                lock(&progress).cancelled = true;
                challenge.cancel();
                let _ = wake.send(Signal::Settled);
            }
        });
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
