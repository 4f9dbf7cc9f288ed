//! Framing errors for HTTP/1.1 request parsing
//!
//! Incomplete input is never an error here: the reader reports it by
//! returning the buffer unchanged. These variants cover requests that can
//! never become valid no matter how many more bytes arrive.

use thiserror::Error;

/// Errors raised while turning buffered bytes into a [`crate::Frame`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Request line is not `METHOD TARGET VERSION`
    #[error("Malformed request line: {line:?}")]
    MalformedRequestLine { line: String },

    /// Request line or header block contains invalid UTF-8
    #[error("Request head is not valid UTF-8 (offset {offset})")]
    NotUtf8 { offset: usize },

    /// Header block grew past the configured limit without a terminator
    #[error("Request head exceeds {limit} bytes (buffered {buffered})")]
    HeadersTooLarge { buffered: usize, limit: usize },

    /// Declared body length exceeds the configured limit
    #[error("Declared body of {declared} bytes exceeds limit of {limit}")]
    BodyTooLarge { declared: usize, limit: usize },
}

impl FrameError {
    /// Create a malformed request line error
    pub fn malformed(line: impl Into<String>) -> Self {
        Self::MalformedRequestLine { line: line.into() }
    }

    /// Whether the peer should receive `413` rather than `400`
    pub fn is_too_large(&self) -> bool {
        matches!(self, Self::BodyTooLarge { .. })
    }
}
