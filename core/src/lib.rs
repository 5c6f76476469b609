//! Authenticated HTTP fetch engine for a mobile GeoPackage client.
//!
//! # Overview
//! Fetches tiles, features, and service documents from servers that may
//! redirect, set session cookies, demand basic credentials, or send users
//! through a login page. One `FetchTask` is one logical fetch: it follows the
//! whole redirect/auth chain on a worker thread and reports a single result.
//!
//! # Design
//! - `machine::RedirectAuthMachine` is the sans-IO core. It emits
//!   `HttpRequest` values, consumes `ResponseHead` values, and never touches
//!   the network, so a foreign host can drive it as easily as a `Transport`.
//! - `task::FetchTask` drives the machine through a `Transport` and a
//!   `CredentialResolver`, and delivers to a consuming `ResponseHandler`.
//! - Credentials come from a `CredentialSource`: a UI prompt over a channel,
//!   a saved account, or anything else. The worker never owns UI.
//! - `login::InteractiveLogin` covers servers that authenticate through a
//!   web page rendered by the host.

pub mod auth;
pub mod cancel;
pub mod config;
pub mod cookies;
pub mod decoder;
pub mod error;
pub mod http;
pub mod login;
pub mod machine;
pub mod prompt;
pub mod task;
pub mod transport;

pub use auth::{AuthorizationToken, BasicAuthResolver, CredentialResolver, Credentials, NoCredentials};
pub use cancel::{CancelHook, CancelToken};
pub use config::FetchConfig;
pub use error::FetchError;
pub use http::{FetchRequest, HttpRequest, ResponseHead};
pub use login::{
    BrowserEvent, BrowserSurface, InteractiveLogin, LoginEvents, LoginModel, LoginOutcome,
    PendingChallenge,
};
pub use machine::{ChallengeReason, RedirectAuthMachine, State, Step};
pub use prompt::{
    prompt_channel, AccountStore, CachedAccount, CredentialPrompt, CredentialSource,
    MemoryAccountStore, PromptRequest,
};
pub use task::{FetchOutcome, FetchResponse, FetchTask, ResponseHandler};
pub use transport::{Transport, TransportResponse};
pub use url::Url;
#[cfg(feature = "ureq")]
pub use transport::UreqTransport;
