//! Executes single hops on the wire.
//!
//! # Design
//! A `Transport` performs exactly one physical exchange and never follows
//! redirects; the state machine decides what happens next. The returned body
//! owns the connection, so dropping a `TransportResponse` tears the hop down.
//!
//! `UreqTransport` is the production implementation (feature `ureq`). Tests
//! and foreign hosts plug in their own.

use std::sync::Arc;

use crate::decoder::BodyReader;
use crate::error::FetchError;
use crate::http::{HttpRequest, ResponseHead};

/// Response to one hop: head for the state machine, body for the caller.
pub struct TransportResponse {
    pub head: ResponseHead,
    pub body: BodyReader,
}

impl TransportResponse {
    pub fn new(head: ResponseHead, body: BodyReader) -> Self {
        Self { head, body }
    }

    /// A response with an empty body.
    pub fn empty(head: ResponseHead) -> Self {
        Self {
            head,
            body: Box::new(std::io::empty()),
        }
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

pub trait Transport {
    /// Perform one GET exchange. Redirect statuses come back as data.
    fn execute(&self, request: &HttpRequest) -> Result<TransportResponse, FetchError>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn execute(&self, request: &HttpRequest) -> Result<TransportResponse, FetchError> {
        (**self).execute(request)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn execute(&self, request: &HttpRequest) -> Result<TransportResponse, FetchError> {
        (**self).execute(request)
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn execute(&self, request: &HttpRequest) -> Result<TransportResponse, FetchError> {
        (**self).execute(request)
    }
}

#[cfg(feature = "ureq")]
mod ureq_impl {
    use tracing::warn;

    use super::*;
    use crate::config::FetchConfig;
    use crate::http::HOST;

    /// Blocking transport backed by a `ureq::Agent`.
    ///
    /// Redirect following and status-as-error are disabled so every status
    /// reaches the state machine. The agent is built without compression
    /// features, leaving `Content-Encoding` handling to the decoder.
    #[derive(Clone)]
    pub struct UreqTransport {
        agent: ureq::Agent,
    }

    impl UreqTransport {
        pub fn new(config: &FetchConfig) -> Self {
            let agent = ureq::Agent::config_builder()
                .http_status_as_error(false)
                .max_redirects(0)
                .max_redirects_will_error(false)
                .timeout_connect(Some(config.connect_timeout()))
                .timeout_recv_response(Some(config.read_timeout()))
                .timeout_recv_body(Some(config.read_timeout()))
                .build()
                .new_agent();
            Self { agent }
        }
    }

    impl Default for UreqTransport {
        fn default() -> Self {
            Self::new(&FetchConfig::default())
        }
    }

    impl Transport for UreqTransport {
        fn execute(&self, request: &HttpRequest) -> Result<TransportResponse, FetchError> {
            let mut builder = self.agent.get(request.url.as_str());
            for (name, value) in &request.headers {
                // ureq derives Host from the URL itself
                if name.eq_ignore_ascii_case(HOST) {
                    continue;
                }
                builder = builder.header(name.as_str(), value.as_str());
            }

            let response = builder.call().map_err(|e| {
                warn!(url = %request.url, error = %e, "hop failed");
                map_error(e)
            })?;

            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect();
            let body: BodyReader = Box::new(response.into_body().into_reader());

            Ok(TransportResponse {
                head: ResponseHead { status, headers },
                body,
            })
        }
    }

    fn map_error(err: ureq::Error) -> FetchError {
        match err {
            ureq::Error::Timeout(_) => FetchError::Timeout,
            ureq::Error::Io(e) => e.into(),
            other => FetchError::Transport(other.to_string()),
        }
    }
}

#[cfg(feature = "ureq")]
pub use ureq_impl::UreqTransport;
