//! Typed view of one complete request
//!
//! A [`Frame`] borrows from the connection buffer and lives only for the
//! duration of a single read event. Only the request line and the declared
//! body length are interpreted; every other header is ignored.

use crate::error::FrameError;
use crate::reader::{declared_length, HEADER_TERMINATOR};

/// Write verb accepted for ingestion
pub const METHOD_POST: &str = "POST";
/// Read verb accepted on the status path
pub const METHOD_GET: &str = "GET";
/// Header-only read verb accepted on the status path
pub const METHOD_HEAD: &str = "HEAD";

/// One complete request borrowed from the connection buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub method: &'a str,
    /// Path and query exactly as received
    pub target: &'a str,
    pub version: &'a str,
    /// Declared body length, `Some(0)` when explicitly zero
    pub content_length: Option<usize>,
    pub body: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Parse the bytes returned by [`crate::try_extract_frame`]
    pub fn parse(raw: &'a [u8]) -> Result<Self, FrameError> {
        let head_end = raw
            .windows(HEADER_TERMINATOR.len())
            .position(|window| window == HEADER_TERMINATOR)
            .ok_or_else(|| FrameError::malformed(String::from_utf8_lossy(raw)))?;

        let head = &raw[..head_end];
        let line_end = head
            .windows(2)
            .position(|window| window == b"\r\n")
            .unwrap_or(head.len());

        let request_line = std::str::from_utf8(&head[..line_end])
            .map_err(|e| FrameError::NotUtf8 {
                offset: e.valid_up_to(),
            })?;

        let mut parts = request_line.split(' ');
        let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(method), Some(target), Some(version), None)
                if !method.is_empty() && !target.is_empty() && version.starts_with("HTTP/") =>
            {
                (method, target, version)
            }
            _ => return Err(FrameError::malformed(request_line)),
        };

        Ok(Self {
            method,
            target,
            version,
            content_length: declared_length(&head[line_end..]),
            body: &raw[head_end + HEADER_TERMINATOR.len()..],
        })
    }

    pub fn is_post(&self) -> bool {
        self.method == METHOD_POST
    }

    /// Whether the method only reads (`GET` or `HEAD`)
    pub fn is_read(&self) -> bool {
        self.method == METHOD_GET || self.method == METHOD_HEAD
    }

    /// Target path without the query string
    pub fn path(&self) -> &'a str {
        match self.target.find('?') {
            Some(idx) => &self.target[..idx],
            None => self.target,
        }
    }

    /// Raw query string, if any
    pub fn query(&self) -> Option<&'a str> {
        self.target.find('?').map(|idx| &self.target[idx + 1..])
    }
}
