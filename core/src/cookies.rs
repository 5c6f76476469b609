//! Session cookie capture for one logical fetch.
//!
//! Cookies are kept verbatim, attributes included, and replayed as one
//! `Cookie` header per entry. A newer `Set-Cookie` set replaces the old one
//! wholesale; nothing is merged and nothing outlives the fetch.

use crate::http::{header_values, SET_COOKIE};

/// Ordered cookie strings from the most recent response that set any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieSet(Vec<String>);

impl CookieSet {
    pub fn new(cookies: Vec<String>) -> Self {
        Self(cookies)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Cookie names only, for logging without leaking values.
    pub fn names(&self) -> Vec<&str> {
        self.iter()
            .map(|c| c.split_once('=').map_or(c, |(name, _)| name).trim())
            .collect()
    }
}

/// Every non-empty `Set-Cookie` value in `headers`, or `None` when there is
/// nothing to replace the live set with.
pub fn extract(headers: &[(String, String)]) -> Option<CookieSet> {
    let cookies: Vec<String> = header_values(headers, SET_COOKIE)
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    if cookies.is_empty() {
        None
    } else {
        Some(CookieSet(cookies))
    }
}
