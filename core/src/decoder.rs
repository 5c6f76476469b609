//! Response body decoding.

use std::io::Read;

use flate2::read::GzDecoder;

use crate::http::{header, CONTENT_ENCODING};

/// A readable response body. Dropping it releases the connection.
pub type BodyReader = Box<dyn Read + Send>;

/// Wrap `body` in a gzip decoder when `Content-Encoding` is exactly `gzip`.
/// Any other encoding is passed through untouched.
pub fn wrap(body: BodyReader, headers: &[(String, String)]) -> BodyReader {
    match header(headers, CONTENT_ENCODING) {
        Some("gzip") => Box::new(GzDecoder::new(body)),
        _ => body,
    }
}
