//! The redirect/auth state machine behind one logical fetch.
//!
//! # Design
//! The machine is sans-IO: it hands out `HttpRequest` values and consumes
//! `ResponseHead` values, and its caller (the task, or a foreign host)
//! performs the exchange and keeps the body. Each `on_response` yields the
//! next `Step`:
//!
//! - `Send`: issue this hop next (a followed redirect, or a retry).
//! - `Challenge`: obtain a token for `url`, then call `authorize` or
//!   `challenge_failed`.
//! - `Deliver`: the fetch is over; `decode` says whether the body is wanted.
//!
//! Redirects are followed explicitly so that cookies and credentials can be
//! re-applied on every hop. The number of followed redirects is bounded by
//! `FetchConfig::max_redirects`.

use tracing::{debug, info};
use url::Url;

use crate::auth::AuthorizationToken;
use crate::config::FetchConfig;
use crate::cookies::{self, CookieSet};
use crate::error::FetchError;
use crate::http::{FetchRequest, Headers, HttpRequest, ResponseHead, ALLOW, AUTHORIZATION, COOKIE, LOCATION};

const OK: u16 = 200;
const UNAUTHORIZED: u16 = 401;

fn is_redirect(status: u16) -> bool {
    matches!(status, 301..=303)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    Connected,
    Redirecting,
    ChallengingAuth,
    Delivering,
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeReason {
    /// The current hop answered `401`.
    Unauthorized,
    /// A redirect declared its target a login endpoint via `Allow: Authorization`.
    LoginRedirect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Send(HttpRequest),
    Challenge { url: Url, reason: ChallengeReason },
    Deliver { status: u16, decode: bool },
}

#[derive(Debug)]
pub struct RedirectAuthMachine {
    config: FetchConfig,
    original: Url,
    current: Url,
    extra_headers: Headers,
    token: Option<AuthorizationToken>,
    negotiated: Option<AuthorizationToken>,
    cookies: Option<CookieSet>,
    redirects: u32,
    state: State,
    challenge: Option<ChallengeReason>,
    last_status: u16,
    credential_retry: bool,
}

impl RedirectAuthMachine {
    pub fn new(request: &FetchRequest, config: &FetchConfig) -> Result<Self, FetchError> {
        let original =
            Url::parse(request.url()).map_err(|e| FetchError::invalid_url(request.url(), e))?;
        if !matches!(original.scheme(), "http" | "https") {
            return Err(FetchError::invalid_url(
                request.url(),
                format!("unsupported scheme {}", original.scheme()),
            ));
        }
        Ok(Self {
            config: config.clone(),
            current: original.clone(),
            original,
            extra_headers: request.headers().to_vec(),
            token: request.authorization().cloned(),
            negotiated: None,
            cookies: None,
            redirects: 0,
            state: State::Connecting,
            challenge: None,
            last_status: 0,
            credential_retry: false,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Redirects followed so far.
    pub fn hops(&self) -> u32 {
        self.redirects
    }

    pub fn current_url(&self) -> &Url {
        &self.current
    }

    pub fn cookies(&self) -> Option<&CookieSet> {
        self.cookies.as_ref()
    }

    /// The first hop.
    pub fn start(&mut self) -> HttpRequest {
        self.state = State::Connecting;
        self.build_request()
    }

    pub fn on_response(&mut self, head: &ResponseHead) -> Result<Step, FetchError> {
        self.state = State::Connected;
        self.last_status = head.status;
        let credential_retry = std::mem::take(&mut self.credential_retry);
        debug!(url = %self.current, status = head.status, "response");

        if let Some(cookies) = cookies::extract(&head.headers) {
            debug!(names = ?cookies.names(), "session cookies captured");
            self.cookies = Some(cookies);
        }

        if head.status == UNAUTHORIZED && !credential_retry {
            self.state = State::ChallengingAuth;
            self.challenge = Some(ChallengeReason::Unauthorized);
            return Ok(Step::Challenge {
                url: self.current.clone(),
                reason: ChallengeReason::Unauthorized,
            });
        }

        if is_redirect(head.status) {
            let next = self.resolve_location(head)?;
            self.redirects += 1;
            if self.redirects > self.config.max_redirects {
                self.state = State::Terminal;
                return Err(FetchError::TooManyRedirects {
                    limit: self.config.max_redirects,
                });
            }
            info!(from = %self.current, to = %next, status = head.status, "following redirect");
            self.current = next;

            if allows_authorization(head) {
                debug!(url = %self.current, "redirect target requires login");
                self.state = State::ChallengingAuth;
                self.challenge = Some(ChallengeReason::LoginRedirect);
                return Ok(Step::Challenge {
                    url: self.current.clone(),
                    reason: ChallengeReason::LoginRedirect,
                });
            }

            self.state = State::Redirecting;
            return Ok(Step::Send(self.build_request()));
        }

        self.state = State::Delivering;
        Ok(Step::Deliver {
            status: head.status,
            decode: head.status == OK,
        })
    }

    /// Re-issue the challenged hop carrying `token`. A `401` answer to this
    /// hop is delivered as-is.
    pub fn authorize(&mut self, token: AuthorizationToken) -> HttpRequest {
        self.challenge = None;
        self.token = Some(token);
        self.credential_retry = true;
        self.state = State::Connecting;
        self.build_request()
    }

    /// The resolver gave up. A `401` is delivered as received; a login
    /// redirect is followed without credentials.
    pub fn challenge_failed(&mut self) -> Step {
        match self.challenge.take() {
            Some(ChallengeReason::LoginRedirect) => {
                self.state = State::Redirecting;
                Step::Send(self.build_request())
            }
            _ => {
                self.state = State::Delivering;
                Step::Deliver {
                    status: self.last_status,
                    decode: false,
                }
            }
        }
    }

    /// Mark the fetch finished and hand out the last token that went on the
    /// wire, for callers that reuse it on follow-up requests.
    pub fn finish(&mut self) -> Option<AuthorizationToken> {
        self.state = State::Terminal;
        self.negotiated.take()
    }

    fn resolve_location(&self, head: &ResponseHead) -> Result<Url, FetchError> {
        let location = head
            .header(LOCATION)
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or(FetchError::MalformedRedirect { location: None })?;
        resolve_redirect(&self.original, location)
    }

    fn build_request(&mut self) -> HttpRequest {
        let mut request = HttpRequest::get(self.current.clone(), &self.config);
        request.headers.extend(self.extra_headers.iter().cloned());
        if let Some(token) = self.token.take() {
            request.push_header(AUTHORIZATION, token.as_header_value());
            self.negotiated = Some(token);
        } else if let Some(cookies) = &self.cookies {
            for cookie in cookies.iter() {
                request.push_header(COOKIE, cookie);
            }
        }
        request
    }
}

/// Resolve a `Location` value. Absolute values are taken as they are; anything
/// else is resolved against the scheme and authority of `original`, never
/// against an intermediate hop.
pub fn resolve_redirect(original: &Url, location: &str) -> Result<Url, FetchError> {
    let malformed = || FetchError::MalformedRedirect {
        location: Some(location.to_string()),
    };
    let resolved = match Url::parse(location) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let mut origin = original.clone();
            origin.set_path("/");
            origin.set_query(None);
            origin.set_fragment(None);
            origin.join(location).map_err(|_| malformed())?
        }
        Err(_) => return Err(malformed()),
    };
    if !matches!(resolved.scheme(), "http" | "https") {
        return Err(malformed());
    }
    Ok(resolved)
}

/// Whether an `Allow` header lists `authorization`.
fn allows_authorization(head: &ResponseHead) -> bool {
    head.header_values(ALLOW)
        .flat_map(|v| v.split(','))
        .any(|method| method.trim().eq_ignore_ascii_case("authorization"))
}
