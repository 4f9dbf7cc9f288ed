//! Stream Demultiplexer
//!
//! Owns the per-connection leftover buffer. Each read event appends new
//! bytes, then repeatedly applies [`try_extract_frame`] until no further
//! progress is made or the handler asks for the connection to close. Bytes
//! that do not yet form a whole request stay in the leftover for the next
//! read.
//!
//! ## Limits
//!
//! A head that grows past `max_header_bytes` without a terminator, or a
//! declared body larger than `max_body_bytes`, is handed to the handler as a
//! [`FrameError`] before any body bytes are waited for.

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::error::FrameError;
use crate::frame::Frame;
use crate::reader::{scan_head, try_extract_frame, HeadScan};

/// Size limits applied before a frame is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

impl FrameLimits {
    fn check(&self, window: &[u8]) -> Result<(), FrameError> {
        match scan_head(window) {
            HeadScan::Incomplete if window.len() > self.max_header_bytes => {
                Err(FrameError::HeadersTooLarge {
                    buffered: window.len(),
                    limit: self.max_header_bytes,
                })
            }
            HeadScan::Complete { head_len, .. } if head_len > self.max_header_bytes => {
                Err(FrameError::HeadersTooLarge {
                    buffered: head_len,
                    limit: self.max_header_bytes,
                })
            }
            HeadScan::Complete {
                content_length: Some(declared),
                ..
            } if declared > self.max_body_bytes => Err(FrameError::BodyTooLarge {
                declared,
                limit: self.max_body_bytes,
            }),
            _ => Ok(()),
        }
    }
}

/// Handler verdict for one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub response: Bytes,
    pub close: bool,
}

impl Reply {
    /// Respond and keep reading
    pub fn keep(response: Bytes) -> Self {
        Self {
            response,
            close: false,
        }
    }

    /// Respond, then close the connection
    pub fn close(response: Bytes) -> Self {
        Self {
            response,
            close: true,
        }
    }
}

/// Outcome of one read event
#[derive(Debug, Default)]
pub struct Feed {
    /// Responses to write, in frame order
    pub responses: Vec<Bytes>,
    pub frames: usize,
    pub close: bool,
}

/// Per-connection framing state
#[derive(Debug)]
pub struct FrameDemux {
    leftover: BytesMut,
    limits: FrameLimits,
}

impl FrameDemux {
    pub fn new(limits: FrameLimits) -> Self {
        Self {
            leftover: BytesMut::new(),
            limits,
        }
    }

    /// Bytes held back waiting for the rest of a request
    pub fn pending(&self) -> usize {
        self.leftover.len()
    }

    /// Append `input` and hand every complete frame to `handler`
    ///
    /// The handler sees parse failures too, so the caller decides how each
    /// kind of bad request is answered. Once a reply asks to close, nothing
    /// after it is processed and the leftover is discarded.
    pub fn feed<F>(&mut self, input: &[u8], mut handler: F) -> Feed
    where
        F: FnMut(Result<Frame<'_>, FrameError>) -> Reply,
    {
        self.leftover.extend_from_slice(input);

        let mut feed = Feed::default();
        let mut cursor = 0;

        while cursor < self.leftover.len() {
            let window = &self.leftover[cursor..];

            if let Err(violation) = self.limits.check(window) {
                let reply = handler(Err(violation));
                feed.responses.push(reply.response);
                feed.close = true;
                break;
            }

            let (rest, frame) = try_extract_frame(window);
            let consumed = window.len() - rest.len();
            if consumed == 0 {
                break;
            }
            cursor += consumed;

            let Some(raw) = frame else {
                continue;
            };

            feed.frames += 1;
            let reply = handler(Frame::parse(raw));
            feed.responses.push(reply.response);
            if reply.close {
                feed.close = true;
                break;
            }
        }

        if feed.close {
            self.leftover.clear();
        } else {
            self.leftover.advance(cursor);
        }

        trace!(
            frames = feed.frames,
            leftover = self.leftover.len(),
            "Processed read event"
        );
        feed
    }
}

impl Default for FrameDemux {
    fn default() -> Self {
        Self::new(FrameLimits::default())
    }
}
