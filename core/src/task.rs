//! One logical fetch, driven off the caller's thread.
//!
//! # Design
//! `FetchTask` owns a `RedirectAuthMachine` and feeds it responses from a
//! `Transport` until the machine delivers or fails. Each hop's response is
//! dropped before the next hop goes out, so at most one connection is open
//! per fetch. Credential challenges go to the `CredentialResolver`; a failed
//! challenge is not an error and ends with the original `401` instead.
//!
//! The result reaches a `ResponseHandler` exactly once. The handler is taken
//! by value, so a second delivery does not type-check.

use std::io::{self, Read};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, info_span, warn};
use url::Url;
use uuid::Uuid;

use crate::auth::{AuthorizationToken, CredentialResolver};
use crate::cancel::CancelToken;
use crate::config::FetchConfig;
use crate::decoder::{self, BodyReader};
use crate::error::FetchError;
use crate::http::FetchRequest;
use crate::machine::{RedirectAuthMachine, Step};
use crate::transport::{Transport, TransportResponse};

/// Final response of a fetch.
///
/// `body` is only present for a `200`, already gzip-decoded when the server
/// said so. `authorization` is the last token that went on the wire, for
/// callers that fetch further pages with it.
pub struct FetchResponse {
    pub status: u16,
    pub url: Url,
    pub body: Option<BodyReader>,
    pub authorization: Option<AuthorizationToken>,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    /// Read the whole body. Empty when there is none.
    pub fn into_bytes(self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        if let Some(mut body) = self.body {
            body.read_to_end(&mut out)?;
        }
        Ok(out)
    }
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("body", &self.body.is_some())
            .field("authorization", &self.authorization)
            .finish()
    }
}

#[derive(Debug)]
pub enum FetchOutcome {
    Success(FetchResponse),
    Failure(FetchError),
}

impl FetchOutcome {
    pub fn into_result(self) -> Result<FetchResponse, FetchError> {
        match self {
            FetchOutcome::Success(response) => Ok(response),
            FetchOutcome::Failure(cause) => Err(cause),
        }
    }
}

impl From<Result<FetchResponse, FetchError>> for FetchOutcome {
    fn from(result: Result<FetchResponse, FetchError>) -> Self {
        match result {
            Ok(response) => FetchOutcome::Success(response),
            Err(cause) => FetchOutcome::Failure(cause),
        }
    }
}

/// Receives the result of a fetch. Exactly one method is called, once.
pub trait ResponseHandler {
    fn handle_response(self, response: FetchResponse);
    fn handle_exception(self, cause: FetchError);
}

impl<F: FnOnce(FetchOutcome)> ResponseHandler for F {
    fn handle_response(self, response: FetchResponse) {
        self(FetchOutcome::Success(response))
    }

    fn handle_exception(self, cause: FetchError) {
        self(FetchOutcome::Failure(cause))
    }
}

pub struct FetchTask<T, R> {
    id: Uuid,
    request: FetchRequest,
    transport: T,
    resolver: R,
    config: FetchConfig,
    cancel: CancelToken,
}

impl<T: Transport, R: CredentialResolver> FetchTask<T, R> {
    pub fn new(request: FetchRequest, transport: T, resolver: R) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            transport,
            resolver,
            config: FetchConfig::default(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_config(mut self, config: FetchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Correlation id, also recorded on the `fetch` tracing span.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// A handle that cancels this fetch from any thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the fetch on the current thread.
    pub fn execute(self) -> Result<FetchResponse, FetchError> {
        let span = info_span!("fetch", id = %self.id, url = %self.request.url());
        let _guard = span.enter();
        let result = self.drive();
        match &result {
            Ok(response) => info!(status = response.status, url = %response.url, "fetch complete"),
            Err(e) => warn!(error = %e, "fetch failed"),
        }
        result
    }

    /// Run the fetch on the current thread and hand the result to `handler`.
    /// A panic inside the transport or resolver is reported as a transport
    /// error rather than skipping the handler.
    pub fn run<H: ResponseHandler>(self, handler: H) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.execute()))
            .unwrap_or_else(|_| Err(FetchError::Transport("fetch worker panicked".to_string())));
        match result {
            Ok(response) => handler.handle_response(response),
            Err(cause) => handler.handle_exception(cause),
        }
    }

    /// Run the fetch on a named worker thread.
    ///
    /// If the thread cannot be started the handler has already received the
    /// failure when this returns `Err`.
    pub fn spawn<H>(self, handler: H) -> io::Result<JoinHandle<()>>
    where
        T: Send + 'static,
        R: Send + 'static,
        H: ResponseHandler + Send + 'static,
    {
        let name = format!("fetch-{}", self.id);
        let slot = Arc::new(Mutex::new(Some((self, handler))));
        let worker_slot = Arc::clone(&slot);
        let spawned = thread::Builder::new().name(name).spawn(move || {
            if let Some((task, handler)) = take(&worker_slot) {
                task.run(handler);
            }
        });
        spawned.inspect_err(|e| {
            if let Some((_, handler)) = take(&slot) {
                handler.handle_exception(FetchError::Transport(format!(
                    "could not start fetch worker: {e}"
                )));
            }
        })
    }

    fn drive(&self) -> Result<FetchResponse, FetchError> {
        let mut machine = RedirectAuthMachine::new(&self.request, &self.config)?;
        let mut request = machine.start();
        loop {
            self.cancel.check()?;
            debug!(url = %request.url, hops = machine.hops(), "connecting");
            let response = self.transport.execute(&request)?;
            let mut step = machine.on_response(&response.head)?;
            let mut response: Option<TransportResponse> = Some(response);
            loop {
                match step {
                    Step::Send(next) => {
                        drop(response.take());
                        request = next;
                        break;
                    }
                    Step::Challenge { url, reason } => {
                        drop(response.take());
                        debug!(%url, ?reason, "credential challenge");
                        step = match self.resolver.resolve(&url, &self.cancel) {
                            Ok(token) => Step::Send(machine.authorize(token)),
                            Err(FetchError::AuthFailed { .. }) => {
                                warn!(%url, "no accepted credentials");
                                machine.challenge_failed()
                            }
                            Err(e) => return Err(e),
                        };
                    }
                    Step::Deliver { status, decode } => {
                        let body = match (decode, response.take()) {
                            (true, Some(r)) => Some(decoder::wrap(r.body, &r.head.headers)),
                            _ => None,
                        };
                        return Ok(FetchResponse {
                            status,
                            url: machine.current_url().clone(),
                            body,
                            authorization: machine.finish(),
                        });
                    }
                }
            }
        }
    }
}

fn take<V>(slot: &Mutex<Option<V>>) -> Option<V> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::mpsc;

    use super::*;
    use crate::auth::{Credentials, NoCredentials};
    use crate::http::{header_values, HttpRequest, ResponseHead, AUTHORIZATION, COOKIE};

    /// Answers hops from a queue and records every request it saw.
    #[derive(Default)]
    struct Scripted {
        responses: Mutex<VecDeque<Result<(ResponseHead, &'static [u8]), FetchError>>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl Scripted {
        fn new() -> Self {
            Self::default()
        }

        fn then(self, head: ResponseHead) -> Self {
            self.then_body(head, b"")
        }

        fn then_body(self, head: ResponseHead, body: &'static [u8]) -> Self {
            self.responses.lock().unwrap().push_back(Ok((head, body)));
            self
        }

        fn then_fail(self, err: FetchError) -> Self {
            self.responses.lock().unwrap().push_back(Err(err));
            self
        }

        fn seen(&self) -> Vec<HttpRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Transport for Scripted {
        fn execute(&self, request: &HttpRequest) -> Result<TransportResponse, FetchError> {
            self.seen.lock().unwrap().push(request.clone());
            match self.responses.lock().unwrap().pop_front() {
                Some(Ok((head, body))) => Ok(TransportResponse::new(
                    head,
                    Box::new(Cursor::new(body.to_vec())),
                )),
                Some(Err(e)) => Err(e),
                None => Ok(TransportResponse::empty(ResponseHead::new(302).with_header("Location", "/again"))),
            }
        }
    }

    /// Hands out a fixed token and counts how often it was asked.
    struct Fixed {
        token: AuthorizationToken,
        calls: Mutex<u32>,
    }

    impl Fixed {
        fn new() -> Self {
            Self {
                token: AuthorizationToken::basic(&Credentials::new("u", "p")),
                calls: Mutex::new(0),
            }
        }
    }

    impl CredentialResolver for Fixed {
        fn resolve(&self, _url: &Url, _cancel: &CancelToken) -> Result<AuthorizationToken, FetchError> {
            *self.calls.lock().unwrap() += 1;
            Ok(self.token.clone())
        }
    }

    fn redirect(status: u16, location: &str) -> ResponseHead {
        ResponseHead::new(status).with_header("Location", location)
    }

    #[test]
    fn follows_redirect_chain_to_final_body() {
        let transport = Scripted::new()
            .then(redirect(301, "http://b.test/one"))
            .then(redirect(302, "http://c.test/two"))
            .then(redirect(303, "http://d.test/tile.png"))
            .then_body(ResponseHead::new(200), b"png");
        let response = FetchTask::new(FetchRequest::new("http://a.test/start"), &transport, NoCredentials)
            .execute()
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.url.as_str(), "http://d.test/tile.png");
        assert!(response.authorization.is_none());
        assert_eq!(response.into_bytes().unwrap(), b"png");
        assert_eq!(transport.seen().len(), 4);
    }

    #[test]
    fn relative_redirect_targets_original_host() {
        let transport = Scripted::new()
            .then(redirect(302, "http://b.test/hop"))
            .then(redirect(302, "/x"))
            .then(ResponseHead::new(200));
        FetchTask::new(FetchRequest::new("http://a.test/start"), &transport, NoCredentials)
            .execute()
            .unwrap();
        assert_eq!(transport.seen()[2].url.as_str(), "http://a.test/x");
    }

    #[test]
    fn unauthorized_is_retried_once_with_token() {
        let transport = Scripted::new()
            .then(ResponseHead::new(401))
            .then_body(ResponseHead::new(200), b"secret");
        let resolver = Fixed::new();
        let response = FetchTask::new(FetchRequest::new("http://a.test/p"), &transport, &resolver)
            .execute()
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.authorization, Some(resolver.token.clone()));

        let seen = transport.seen();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].header(AUTHORIZATION).is_none());
        assert_eq!(seen[1].header(AUTHORIZATION), Some("Basic dTpw"));
        assert_eq!(seen[1].url, seen[0].url);
        assert_eq!(*resolver.calls.lock().unwrap(), 1);
    }

    #[test]
    fn repeated_unauthorized_delivers_401_without_body() {
        let transport = Scripted::new()
            .then(ResponseHead::new(401))
            .then_body(ResponseHead::new(401), b"denied");
        let resolver = Fixed::new();
        let response = FetchTask::new(FetchRequest::new("http://a.test/p"), &transport, &resolver)
            .execute()
            .unwrap();
        assert_eq!(response.status, 401);
        assert!(response.body.is_none());
        assert_eq!(*resolver.calls.lock().unwrap(), 1);
    }

    #[test]
    fn failed_challenge_is_a_401_response_not_an_error() {
        let transport = Scripted::new().then(ResponseHead::new(401));
        let response = FetchTask::new(FetchRequest::new("http://a.test/p"), &transport, NoCredentials)
            .execute()
            .unwrap();
        assert_eq!(response.status, 401);
        assert!(response.body.is_none());
        assert_eq!(transport.seen().len(), 1);
    }

    #[test]
    fn every_cookie_reaches_the_next_hop() {
        let transport = Scripted::new()
            .then(
                redirect(302, "/tiles")
                    .with_header("Set-Cookie", "sid=1; Path=/")
                    .with_header("Set-Cookie", "region=emea"),
            )
            .then(ResponseHead::new(200));
        FetchTask::new(FetchRequest::new("http://a.test/login"), &transport, NoCredentials)
            .execute()
            .unwrap();
        let seen = transport.seen();
        let cookies: Vec<&str> = header_values(&seen[1].headers, COOKIE).collect();
        assert_eq!(cookies, vec!["sid=1; Path=/", "region=emea"]);
    }

    #[test]
    fn endless_redirects_fail_once_the_limit_is_passed() {
        let transport = Scripted::new();
        let config = FetchConfig {
            max_redirects: 4,
            ..FetchConfig::default()
        };
        let err = FetchTask::new(FetchRequest::new("http://a.test/loop"), &transport, NoCredentials)
            .with_config(config)
            .execute()
            .unwrap_err();
        assert!(matches!(err, FetchError::TooManyRedirects { limit: 4 }));
        assert_eq!(transport.seen().len(), 5);
    }

    #[test]
    fn malformed_redirect_fails() {
        let transport = Scripted::new().then(ResponseHead::new(302));
        let err = FetchTask::new(FetchRequest::new("http://a.test/x"), &transport, NoCredentials)
            .execute()
            .unwrap_err();
        assert!(matches!(err, FetchError::MalformedRedirect { .. }));
    }

    #[test]
    fn gzip_body_is_decoded_for_200_only() {
        use flate2::{write::GzEncoder, Compression};
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"geojson").unwrap();
        let compressed: &'static [u8] = Box::leak(encoder.finish().unwrap().into_boxed_slice());

        let transport = Scripted::new()
            .then_body(ResponseHead::new(200).with_header("Content-Encoding", "gzip"), compressed);
        let response = FetchTask::new(FetchRequest::new("http://a.test/x"), &transport, NoCredentials)
            .execute()
            .unwrap();
        assert_eq!(response.into_bytes().unwrap(), b"geojson");

        let transport = Scripted::new().then_body(ResponseHead::new(500), b"oops");
        let response = FetchTask::new(FetchRequest::new("http://a.test/x"), &transport, NoCredentials)
            .execute()
            .unwrap();
        assert_eq!(response.status, 500);
        assert!(response.body.is_none());
    }

    #[test]
    fn invalid_url_fails_before_any_hop() {
        let transport = Scripted::new();
        let err = FetchTask::new(FetchRequest::new("::"), &transport, NoCredentials)
            .execute()
            .unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl { .. }));
        assert!(transport.seen().is_empty());
    }

    #[test]
    fn cancelled_fetch_never_connects() {
        let transport = Scripted::new().then(ResponseHead::new(200));
        let task = FetchTask::new(FetchRequest::new("http://a.test/x"), &transport, NoCredentials);
        task.cancel_token().cancel();
        let err = task.execute().unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
        assert!(transport.seen().is_empty());
    }

    #[test]
    fn handler_sees_mid_chain_failure_exactly_once() {
        let transport = Arc::new(
            Scripted::new()
                .then(redirect(302, "/next"))
                .then_fail(FetchError::Transport("connection reset".to_string())),
        );
        let (tx, rx) = mpsc::channel();
        FetchTask::new(FetchRequest::new("http://a.test/x"), Arc::clone(&transport), NoCredentials)
            .spawn(move |outcome: FetchOutcome| tx.send(outcome).unwrap())
            .unwrap()
            .join()
            .unwrap();

        let outcomes: Vec<FetchOutcome> = rx.iter().collect();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(
            &outcomes[0],
            FetchOutcome::Failure(FetchError::Transport(msg)) if msg.contains("reset")
        ));
    }

    #[test]
    fn panicking_transport_still_reports() {
        struct Boom;
        impl Transport for Boom {
            fn execute(&self, _request: &HttpRequest) -> Result<TransportResponse, FetchError> {
                panic!("boom");
            }
        }
        let (tx, rx) = mpsc::channel();
        FetchTask::new(FetchRequest::new("http://a.test/x"), Boom, NoCredentials)
            .run(move |outcome: FetchOutcome| tx.send(outcome).unwrap());
        assert!(matches!(rx.recv().unwrap(), FetchOutcome::Failure(FetchError::Transport(_))));
    }

    struct Recorder(mpsc::Sender<&'static str>);

    impl ResponseHandler for Recorder {
        fn handle_response(self, _response: FetchResponse) {
            self.0.send("response").unwrap();
        }

        fn handle_exception(self, _cause: FetchError) {
            self.0.send("exception").unwrap();
        }
    }

    #[test]
    fn custom_handler_gets_response() {
        let transport = Scripted::new().then(ResponseHead::new(204));
        let (tx, rx) = mpsc::channel();
        FetchTask::new(FetchRequest::new("http://a.test/x"), &transport, NoCredentials).run(Recorder(tx));
        assert_eq!(rx.iter().collect::<Vec<_>>(), vec!["response"]);
    }
}
