//! Frame Reader
//!
//! Stateless extraction of one complete request from the front of a byte
//! buffer. A request is complete once the header terminator has arrived and,
//! when the headers declare a positive `Content-Length`, that many body bytes
//! follow it.
//!
//! The reader never consumes bytes it cannot account for: when the frame is
//! not yet complete the caller gets its own buffer back untouched.

/// Blank line separating the header block from the body
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

const LINE_BREAK: &str = "\r\n";
const CONTENT_LENGTH: &str = "Content-Length";

/// Result of scanning the front of a buffer for a request head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadScan {
    /// No terminator yet
    Incomplete,
    /// Terminator found at offset 0; these bytes carry no request
    Blank(usize),
    /// Head of `head_len` bytes (terminator included)
    Complete {
        head_len: usize,
        content_length: Option<usize>,
    },
}

/// Locate the request head at the front of `buf`
///
/// `content_length` is the first positive declared length, `None` when the
/// head declares none.
pub fn scan_head(buf: &[u8]) -> HeadScan {
    let Some(offset) = find_terminator(buf) else {
        return HeadScan::Incomplete;
    };

    if offset == 0 {
        return HeadScan::Blank(HEADER_TERMINATOR.len());
    }

    HeadScan::Complete {
        head_len: offset + HEADER_TERMINATOR.len(),
        content_length: declared_length(&buf[..offset]).filter(|len| *len > 0),
    }
}

/// Extract one complete frame from the front of `buf`
///
/// Returns `(remainder, frame)`:
/// - empty input gives `(empty, None)`
/// - a leading blank line is skipped and gives `(rest, None)`
/// - an incomplete head or body gives `(buf, None)` with `buf` unchanged
/// - otherwise the frame bytes and everything after them
///
/// A head without a positive `Content-Length` is a frame with no body.
pub fn try_extract_frame(buf: &[u8]) -> (&[u8], Option<&[u8]>) {
    if buf.is_empty() {
        return (buf, None);
    }

    match scan_head(buf) {
        HeadScan::Incomplete => (buf, None),
        HeadScan::Blank(skip) => (&buf[skip..], None),
        HeadScan::Complete {
            head_len,
            content_length,
        } => {
            let total = head_len + content_length.unwrap_or(0);
            if buf.len() < total {
                return (buf, None);
            }
            let (frame, rest) = buf.split_at(total);
            (rest, Some(frame))
        }
    }
}

/// First parseable `Content-Length` value in a header block, zero included
///
/// The header block is split on CRLF; any line starting with the exact
/// `Content-Length` prefix contributes the token after its last space.
/// Lines whose token is not a number are skipped. A positive value always
/// wins over an earlier zero.
pub fn declared_length(head: &[u8]) -> Option<usize> {
    let text = String::from_utf8_lossy(head);
    let mut zero_seen = false;

    for line in text.split(LINE_BREAK) {
        if !line.starts_with(CONTENT_LENGTH) {
            continue;
        }
        let token = line.rsplit(' ').next().unwrap_or_default();
        match token.trim().parse::<usize>() {
            Ok(0) => zero_seen = true,
            Ok(len) => return Some(len),
            Err(_) => continue,
        }
    }

    zero_seen.then_some(0)
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSERT: &[u8] =
        b"POST /?query=INSERT%20INTO%20t%20VALUES HTTP/1.1\r\nContent-Length: 3\r\n\r\n(1)";

    #[test]
    fn test_empty_buffer() {
        let (rest, frame) = try_extract_frame(b"");
        assert!(rest.is_empty());
        assert!(frame.is_none());
    }

    #[test]
    fn test_complete_frame() {
        let (rest, frame) = try_extract_frame(INSERT);
        assert!(rest.is_empty());
        assert_eq!(frame, Some(INSERT));
    }

    #[test]
    fn test_incomplete_head_returns_input() {
        let partial = &INSERT[..20];
        let (rest, frame) = try_extract_frame(partial);
        assert_eq!(rest, partial);
        assert!(frame.is_none());
    }

    #[test]
    fn test_short_body_returns_input() {
        let buf = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nabc";
        let (rest, frame) = try_extract_frame(buf);
        assert_eq!(rest, &buf[..]);
        assert!(frame.is_none());
    }

    #[test]
    fn test_leading_blank_line_skipped() {
        let mut buf = b"\r\n\r\n".to_vec();
        buf.extend_from_slice(INSERT);
        let (rest, frame) = try_extract_frame(&buf);
        assert_eq!(rest, INSERT);
        assert!(frame.is_none());
    }

    #[test]
    fn test_pipelined_remainder() {
        let mut buf = INSERT.to_vec();
        buf.extend_from_slice(b"POST /next");
        let (rest, frame) = try_extract_frame(&buf);
        assert_eq!(frame, Some(INSERT));
        assert_eq!(rest, b"POST /next");
    }

    #[test]
    fn test_headers_only_frame() {
        let buf = b"GET /status HTTP/1.1\r\nHost: x\r\n\r\nPOST";
        let (rest, frame) = try_extract_frame(buf);
        assert_eq!(frame, Some(&buf[..buf.len() - 4]));
        assert_eq!(rest, b"POST");
    }

    #[test]
    fn test_declared_length_rules() {
        assert_eq!(declared_length(b"Host: a\r\nContent-Length: 12"), Some(12));
        assert_eq!(declared_length(b"Content-Length: abc\r\nContent-Length: 4"), Some(4));
        assert_eq!(declared_length(b"Content-Length: 0\r\nContent-Length: 7"), Some(7));
        assert_eq!(declared_length(b"Content-Length: 0"), Some(0));
        assert_eq!(declared_length(b"content-length: 9"), None);
        assert_eq!(declared_length(b"Host: a"), None);
    }

    #[test]
    fn test_scan_head_reports_positive_length_only() {
        let buf = b"POST / HTTP/1.1\r\nContent-Length: 0\r\n\r\n";
        assert_eq!(
            scan_head(buf),
            HeadScan::Complete {
                head_len: buf.len(),
                content_length: None
            }
        );
    }
}
