//! Canned HTTP/1.1 responses
//!
//! Every response carries an explicit `Content-Length`; chunked encoding is
//! never produced.

use bytes::{BufMut, Bytes, BytesMut};

pub const ACCEPTED: &[u8] = b"HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\n\r\n";
pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n";
pub const PAYLOAD_TOO_LARGE: &[u8] =
    b"HTTP/1.1 413 Payload Too Large\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// Write accepted into the buffer, no body
pub fn accepted() -> Bytes {
    Bytes::from_static(ACCEPTED)
}

/// Fixed rejection
pub fn bad_request() -> Bytes {
    Bytes::from_static(BAD_REQUEST)
}

pub fn payload_too_large() -> Bytes {
    Bytes::from_static(PAYLOAD_TOO_LARGE)
}

/// JSON response with the given status line
///
/// With `include_body == false` the headers still advertise the body length,
/// which is what a `HEAD` request expects.
pub fn json(status: u16, reason: &str, body: &[u8], include_body: bool) -> Bytes {
    let head = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    let mut out = BytesMut::with_capacity(head.len() + body.len());
    out.put_slice(head.as_bytes());
    if include_body {
        out.put_slice(body);
    }
    out.freeze()
}

/// Reason phrase for the status codes this proxy emits
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
