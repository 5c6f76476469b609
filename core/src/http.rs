//! HTTP types for the host-does-IO pattern.
//!
//! # Design
//! The state machine never touches the network: it emits `HttpRequest`
//! values and consumes `ResponseHead` values. Whoever executes the request
//! (a `Transport`, or a foreign host through the C ABI) keeps the body.
//!
//! Headers are ordered `(name, value)` pairs rather than a map so repeated
//! fields like `Set-Cookie` and `Cookie` survive untouched.

use url::Url;

use crate::auth::AuthorizationToken;
use crate::config::FetchConfig;

pub const AUTHORIZATION: &str = "Authorization";
pub const COOKIE: &str = "Cookie";
pub const SET_COOKIE: &str = "Set-Cookie";
pub const LOCATION: &str = "Location";
pub const ALLOW: &str = "Allow";
pub const CONTENT_ENCODING: &str = "Content-Encoding";
pub const HOST: &str = "Host";

pub type Headers = Vec<(String, String)>;

/// What the caller asks for: a URL, extra headers for every hop, and
/// optionally a token negotiated earlier that goes on the first hop only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    url: String,
    headers: Headers,
    authorization: Option<AuthorizationToken>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            authorization: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_authorization(mut self, token: AuthorizationToken) -> Self {
        self.authorization = Some(token);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn authorization(&self) -> Option<&AuthorizationToken> {
        self.authorization.as_ref()
    }
}

/// One GET hop described as plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: Url,
    pub headers: Headers,
}

impl HttpRequest {
    /// A GET for `url` carrying the descriptive header set from `config`.
    pub fn get(url: Url, config: &FetchConfig) -> Self {
        let headers = descriptive_headers(&url, config);
        Self { url, headers }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }

    pub fn push_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }
}

/// Status line and headers of a response. The body stays with the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        header(&self.headers, name)
    }

    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        header_values(&self.headers, name)
    }
}

/// First value of `name`, matched case-insensitively.
pub fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Every value of `name` in arrival order, matched case-insensitively.
pub fn header_values<'a>(
    headers: &'a [(String, String)],
    name: &'a str,
) -> impl Iterator<Item = &'a str> + 'a {
    headers
        .iter()
        .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Host header value: the host, plus the port when it is not the scheme default.
pub fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

fn descriptive_headers(url: &Url, config: &FetchConfig) -> Headers {
    vec![
        ("User-Agent".to_string(), config.user_agent.clone()),
        ("Accept".to_string(), config.accept.clone()),
        ("Accept-Encoding".to_string(), "gzip, deflate, br".to_string()),
        ("Accept-Language".to_string(), config.accept_language.clone()),
        ("Connection".to_string(), "keep-alive".to_string()),
        (HOST.to_string(), host_header(url)),
    ]
}
