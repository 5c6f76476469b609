//! Error types for the fetch engine.
//!
//! # Design
//! Transport-level failures abort the whole logical fetch. Credential and
//! redirect handling recover locally; `AuthFailed` only travels between the
//! resolver and the task and is turned back into the original `401` response
//! before it reaches the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    /// The request URL could not be parsed.
    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Connection refused, DNS failure, broken pipe, or any other I/O failure
    /// while exchanging a hop.
    #[error("transport error: {0}")]
    Transport(String),

    /// A connect or read timeout elapsed.
    #[error("request timed out")]
    Timeout,

    /// A redirect response carried no usable `Location`.
    #[error("malformed redirect: {location:?}")]
    MalformedRedirect { location: Option<String> },

    #[error("too many redirects (limit {limit})")]
    TooManyRedirects { limit: u32 },

    /// The credential challenge ended without accepted credentials.
    #[error("authentication failed for {url}")]
    AuthFailed { url: String },

    #[error("fetch cancelled")]
    Cancelled,

    /// The configuration document could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FetchError {
    pub(crate) fn invalid_url(url: &str, err: impl std::fmt::Display) -> Self {
        FetchError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn auth_failed(url: &url::Url) -> Self {
        FetchError::AuthFailed {
            url: url.to_string(),
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => FetchError::Timeout,
            _ => FetchError::Transport(e.to_string()),
        }
    }
}
