//! `#[repr(C)]` types for the FFI boundary.
//!
//! # Design
//! Handles (`FfiFetchHandle`, `FfiBody`) are opaque: C only ever holds
//! pointers to them and hands them back. Callback tables and error codes are
//! plain C data. Conversions from core types live here to keep `lib.rs`
//! focused on the `extern "C"` surface.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_void};
use std::sync::Mutex;
use std::thread::JoinHandle;

use fetch_core::decoder::BodyReader;
use fetch_core::{CancelToken, FetchError};

/// Opaque handle to a running fetch. Shared by `fetch_cancel` and
/// `fetch_wait`, which may run on different host threads.
pub struct FfiFetchHandle {
    pub(crate) cancel: CancelToken,
    pub(crate) worker: Mutex<Option<JoinHandle<()>>>,
}

impl FfiFetchHandle {
    pub(crate) fn new(cancel: CancelToken, worker: JoinHandle<()>) -> Self {
        Self {
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Take the worker for joining. `None` once another wait has taken it.
    pub(crate) fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Opaque readable response body, owned by the C caller once delivered.
pub struct FfiBody {
    pub(crate) inner: BodyReader,
}

/// Error categories reported through `on_exception`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiErrorCode {
    InvalidUrl = 1,
    Transport = 2,
    Timeout = 3,
    MalformedRedirect = 4,
    TooManyRedirects = 5,
    AuthFailed = 6,
    Cancelled = 7,
    Config = 8,
    NullArg = 9,
    Panic = 10,
    InvalidArgument = 11,
}

impl From<&FetchError> for FfiErrorCode {
    fn from(err: &FetchError) -> Self {
        match err {
            FetchError::InvalidUrl { .. } => FfiErrorCode::InvalidUrl,
            FetchError::Transport(_) => FfiErrorCode::Transport,
            FetchError::Timeout => FfiErrorCode::Timeout,
            FetchError::MalformedRedirect { .. } => FfiErrorCode::MalformedRedirect,
            FetchError::TooManyRedirects { .. } => FfiErrorCode::TooManyRedirects,
            FetchError::AuthFailed { .. } => FfiErrorCode::AuthFailed,
            FetchError::Cancelled => FfiErrorCode::Cancelled,
            FetchError::Config(_) => FfiErrorCode::Config,
        }
    }
}

/// Filled in by `on_credentials`. Both strings must stay valid until the
/// callback returns; they are copied before it is called again.
#[repr(C)]
pub struct FfiCredentials {
    pub username: *const c_char,
    pub password: *const c_char,
}

impl Default for FfiCredentials {
    fn default() -> Self {
        Self {
            username: std::ptr::null(),
            password: std::ptr::null(),
        }
    }
}

impl FfiCredentials {
    /// Copy both strings out. `None` if either is null or not UTF-8.
    pub(crate) fn to_core(&self) -> Option<fetch_core::Credentials> {
        if self.username.is_null() || self.password.is_null() {
            return None;
        }
        let username = unsafe { CStr::from_ptr(self.username) }.to_str().ok()?;
        let password = unsafe { CStr::from_ptr(self.password) }.to_str().ok()?;
        Some(fetch_core::Credentials::new(username, password))
    }
}

/// Called once with the final response. `body` is null unless the status is
/// 200; otherwise the caller owns it and frees it with `fetch_body_free`.
/// `authorization` is the negotiated header value or null; the caller owns
/// it and frees it with `fetch_free_string`.
pub type FfiOnResponse =
    extern "C" fn(user_data: *mut c_void, status: u16, body: *mut FfiBody, authorization: *mut c_char);

/// Called once when the fetch fails. `message` is only valid during the call.
pub type FfiOnException =
    extern "C" fn(user_data: *mut c_void, code: FfiErrorCode, message: *const c_char);

/// Called on the worker thread when a server asks for credentials. Return
/// false to decline, which ends the challenge and delivers the `401`.
pub type FfiOnCredentials = extern "C" fn(
    user_data: *mut c_void,
    url: *const c_char,
    attempt: u32,
    out: *mut FfiCredentials,
) -> bool;

/// Callback table passed to `fetch_start`. All callbacks run on the worker
/// thread, so `user_data` must be safe to use from there.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FfiFetchCallbacks {
    pub user_data: *mut c_void,
    pub on_response: Option<FfiOnResponse>,
    pub on_exception: Option<FfiOnException>,
    pub on_credentials: Option<FfiOnCredentials>,
}

/// Callback table moved onto the worker thread.
#[derive(Clone, Copy)]
pub(crate) struct Callbacks(pub(crate) FfiFetchCallbacks);

// SAFETY: the C caller guarantees `user_data` may be used from the worker
// thread for as long as the fetch runs.
unsafe impl Send for Callbacks {}
unsafe impl Sync for Callbacks {}

impl Callbacks {
    pub(crate) fn response(&self, status: u16, body: Option<BodyReader>, authorization: Option<String>) {
        let body = match body {
            Some(inner) => Box::into_raw(Box::new(FfiBody { inner })),
            None => std::ptr::null_mut(),
        };
        let authorization = authorization.map_or(std::ptr::null_mut(), into_c_string);
        match self.0.on_response {
            Some(cb) => cb(self.0.user_data, status, body, authorization),
            None => {
                // nobody takes ownership, release here
                if !body.is_null() {
                    drop(unsafe { Box::from_raw(body) });
                }
                if !authorization.is_null() {
                    drop(unsafe { CString::from_raw(authorization) });
                }
            }
        }
    }

    pub(crate) fn exception(&self, code: FfiErrorCode, message: &str) {
        if let Some(cb) = self.0.on_exception {
            let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
            cb(self.0.user_data, code, message.as_ptr());
        }
    }
}

/// Heap-allocate a C string. Interior NULs are replaced so nothing is lost
/// silently.
pub(crate) fn into_c_string(s: String) -> *mut c_char {
    CString::new(s.replace('\0', " "))
        .unwrap_or_default()
        .into_raw()
}
