//! C-ABI wrapper around `fetch-core`.
//!
//! # Overview
//! Lets the mobile host start authenticated fetches through `extern "C"`
//! functions. Each fetch runs on its own worker thread and reports back
//! through a table of C callbacks, including the credential prompt.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - `fetch_start` always ends in exactly one of `on_response` or
//!   `on_exception`. When it returns null no worker was started and the
//!   failure has already been reported.
//! - The C caller owns every pointer handed to it and releases it with the
//!   matching `fetch_*_free` function.

pub mod types;

use std::ffi::{CStr, CString};
use std::io::{ErrorKind, Read};
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};

use fetch_core::{
    AuthorizationToken, BasicAuthResolver, CancelToken, CredentialSource, Credentials, FetchConfig,
    FetchError, FetchRequest, FetchResponse, FetchTask, ResponseHandler, UreqTransport, Url,
};
use tracing::warn;

use types::*;

/// Prompts through `on_credentials` on the worker thread.
struct FfiCredentialSource {
    callbacks: Callbacks,
}

impl CredentialSource for FfiCredentialSource {
    fn credentials(
        &self,
        url: &Url,
        attempt: u32,
        cancel: &CancelToken,
    ) -> Result<Credentials, FetchError> {
        cancel.check()?;
        let declined = || FetchError::AuthFailed {
            url: url.to_string(),
        };
        let Some(prompt) = self.callbacks.0.on_credentials else {
            return Err(declined());
        };
        let c_url = CString::new(url.as_str()).map_err(|_| declined())?;
        let mut out = FfiCredentials::default();
        if !prompt(self.callbacks.0.user_data, c_url.as_ptr(), attempt, &mut out) {
            return Err(declined());
        }
        out.to_core().ok_or_else(declined)
    }
}

struct FfiHandler(Callbacks);

impl ResponseHandler for FfiHandler {
    fn handle_response(self, response: FetchResponse) {
        let authorization = response
            .authorization
            .map(|token| token.as_header_value().to_string());
        self.0.response(response.status, response.body, authorization);
    }

    fn handle_exception(self, cause: FetchError) {
        self.0.exception(FfiErrorCode::from(&cause), &cause.to_string());
    }
}

/// Borrow a C string as `&str`. `None` for null or non-UTF-8 input.
fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

// ---------------------------------------------------------------------------
// Fetch lifecycle
// ---------------------------------------------------------------------------

/// Start fetching `url` on a worker thread.
///
/// `authorization` (nullable) is a header value from an earlier fetch and is
/// sent on the first hop. `config_json` (nullable) overrides `FetchConfig`
/// fields, e.g. `{"max_redirects": 5}`.
///
/// Returns a handle to free with `fetch_handle_free`, or null after reporting
/// the failure through `on_exception`.
#[unsafe(no_mangle)]
pub extern "C" fn fetch_start(
    url: *const c_char,
    authorization: *const c_char,
    config_json: *const c_char,
    callbacks: FfiFetchCallbacks,
) -> *mut FfiFetchHandle {
    let callbacks = Callbacks(callbacks);
    catch_unwind(AssertUnwindSafe(|| {
        if url.is_null() {
            callbacks.exception(FfiErrorCode::NullArg, "url is null");
            return std::ptr::null_mut();
        }
        let Some(url) = c_str(url) else {
            callbacks.exception(FfiErrorCode::InvalidUrl, "url is not valid UTF-8");
            return std::ptr::null_mut();
        };

        let config = if config_json.is_null() {
            FetchConfig::default()
        } else {
            match c_str(config_json)
                .ok_or_else(|| FetchError::Config("config is not valid UTF-8".to_string()))
                .and_then(FetchConfig::from_json)
            {
                Ok(config) => config,
                Err(e) => {
                    warn!(error = %e, "rejected fetch config");
                    callbacks.exception(FfiErrorCode::Config, &e.to_string());
                    return std::ptr::null_mut();
                }
            }
        };

        let mut request = FetchRequest::new(url);
        if !authorization.is_null() {
            let Some(token) = c_str(authorization) else {
                callbacks.exception(FfiErrorCode::InvalidArgument, "authorization is not valid UTF-8");
                return std::ptr::null_mut();
            };
            request = request.with_authorization(AuthorizationToken::from_header_value(token));
        }

        let resolver = BasicAuthResolver::new(FfiCredentialSource { callbacks })
            .with_verification(UreqTransport::new(&config))
            .with_config(config.clone());
        let task = FetchTask::new(request, UreqTransport::new(&config), resolver).with_config(config);
        let cancel = task.cancel_token();
        match task.spawn(FfiHandler(callbacks)) {
            Ok(worker) => Box::into_raw(Box::new(FfiFetchHandle::new(cancel, worker))),
            Err(e) => {
                warn!(error = %e, "fetch worker did not start");
                std::ptr::null_mut()
            }
        }
    }))
    .unwrap_or_else(|_| {
        callbacks.exception(FfiErrorCode::Panic, "panic while starting fetch");
        std::ptr::null_mut()
    })
}

/// Ask a running fetch to stop. It ends with `on_exception(Cancelled)` unless
/// it already finished. Safe to call with null and more than once.
#[unsafe(no_mangle)]
pub extern "C" fn fetch_cancel(handle: *const FfiFetchHandle) {
    if !handle.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            unsafe { &*handle }.cancel.cancel();
        }));
    }
}

/// Block until the fetch's callback has returned. Safe to call with null,
/// more than once, and concurrently with `fetch_cancel`. When two threads
/// wait at once, one joins the worker and the other returns immediately.
#[unsafe(no_mangle)]
pub extern "C" fn fetch_wait(handle: *const FfiFetchHandle) {
    if !handle.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            if let Some(worker) = unsafe { &*handle }.take_worker() {
                let _ = worker.join();
            }
        }));
    }
}

/// Free a handle from `fetch_start`. A fetch still running keeps going and
/// still invokes its callback. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn fetch_handle_free(handle: *mut FfiFetchHandle) {
    if !handle.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(handle) });
        }));
    }
}

// ---------------------------------------------------------------------------
// Response body
// ---------------------------------------------------------------------------

/// Read up to `len` bytes into `buf`. Returns the count read, 0 at the end of
/// the body, or -1 on error or null arguments.
#[unsafe(no_mangle)]
pub extern "C" fn fetch_body_read(body: *mut FfiBody, buf: *mut u8, len: usize) -> isize {
    if body.is_null() || buf.is_null() {
        return -1;
    }
    if len == 0 {
        return 0;
    }
    catch_unwind(AssertUnwindSafe(|| {
        let body = unsafe { &mut *body };
        let buf = unsafe { std::slice::from_raw_parts_mut(buf, len.min(isize::MAX as usize)) };
        loop {
            match body.inner.read(buf) {
                Ok(n) => return n as isize,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "body read failed");
                    return -1;
                }
            }
        }
    }))
    .unwrap_or(-1)
}

/// Free a body delivered to `on_response`. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn fetch_body_free(body: *mut FfiBody) {
    if !body.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(body) });
        }));
    }
}

/// Free a string handed out by this library. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn fetch_free_string(s: *mut c_char) {
    if !s.is_null() {
        let _ = catch_unwind(|| {
            drop(unsafe { CString::from_raw(s) });
        });
    }
}
