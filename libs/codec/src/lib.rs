//! # Proxyhouse Request Codec
//!
//! ## Purpose
//!
//! Framing layer for the ingestion listener. Turns the raw byte stream of a
//! connection into discrete HTTP/1.1 requests despite partial reads and
//! pipelining, and provides the fixed responses written back.
//!
//! ## Architecture Role
//!
//! ```text
//! socket bytes → [FrameDemux] → try_extract_frame → Frame → classifier
//!                     ↑                                        ↓
//!                 leftover                              response bytes
//! ```
//!
//! ## What This Crate Contains
//! - `try_extract_frame`: stateless single-frame extraction
//! - `Frame`: borrowed request view (method, target, declared length, body)
//! - `FrameDemux`: per-connection leftover buffer and extraction loop
//! - canned `202`/`400`/`413` responses and JSON status responses
//!
//! ## What This Crate Does NOT Contain
//! - Socket handling (belongs in the proxy service)
//! - Request semantics such as batching keys or method policy
//! - General HTTP compliance: only `Content-Length` framing is understood,
//!   chunked transfer encoding is not

pub mod demux;
pub mod error;
pub mod frame;
pub mod reader;
pub mod response;

pub use demux::{Feed, FrameDemux, FrameLimits, Reply};
pub use error::FrameError;
pub use frame::Frame;
pub use reader::{declared_length, scan_head, try_extract_frame, HeadScan, HEADER_TERMINATOR};
