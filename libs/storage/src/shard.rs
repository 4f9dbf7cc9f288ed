//! Shard identifiers
//!
//! A shard name is a single leading character followed by the creation time
//! in nanoseconds: `1..9` for a retry level, `x` once the record stopped
//! being retried automatically. Sorting identifiers sorts by level first,
//! then by age, with terminal shards last.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Leading character of a terminal shard
pub const TERMINAL_MARKER: char = 'x';

/// Retry state encoded in a shard name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShardKind {
    /// Retried automatically at this level (1..=9)
    Retryable(u8),
    /// Never retried automatically
    Terminal,
}

impl ShardKind {
    /// Kind for a record persisted at `level` under `ceiling`
    ///
    /// Reaching the ceiling makes the shard terminal.
    pub fn for_level(level: u8, ceiling: u8) -> Self {
        if level >= ceiling {
            Self::Terminal
        } else {
            Self::Retryable(level.max(1))
        }
    }

    pub fn level(&self) -> Option<u8> {
        match self {
            Self::Retryable(level) => Some(*level),
            Self::Terminal => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal)
    }

    fn marker(&self) -> char {
        match self {
            Self::Retryable(level) => char::from(b'0' + (*level).min(9)),
            Self::Terminal => TERMINAL_MARKER,
        }
    }

    fn from_marker(marker: char) -> Option<Self> {
        match marker {
            TERMINAL_MARKER => Some(Self::Terminal),
            '1'..='9' => marker.to_digit(10).map(|d| Self::Retryable(d as u8)),
            _ => None,
        }
    }
}

/// Name of one dead-letter shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId {
    pub kind: ShardKind,
    pub created_ns: u64,
}

impl ShardId {
    pub fn new(kind: ShardKind, created_ns: u64) -> Self {
        Self { kind, created_ns }
    }

    /// Parse a file name, `None` for anything that is not a shard
    ///
    /// Only canonical names are accepted: the id must format back to the
    /// exact same file name, otherwise the file could never be opened again.
    pub fn parse(name: &str) -> Option<Self> {
        let mut chars = name.chars();
        let kind = ShardKind::from_marker(chars.next()?)?;
        let digits = chars.as_str();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let created_ns = digits.parse().ok()?;
        let id = Self { kind, created_ns };
        (id.to_string() == name).then_some(id)
    }

    pub fn file_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.marker(), self.created_ns)
    }
}

/// Strictly increasing nanosecond timestamps
///
/// Two calls never return the same value, even within one clock tick.
#[derive(Debug, Default)]
pub struct ShardClock {
    last: AtomicU64,
}

impl ShardClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(prev + 1);
            match self.last.compare_exchange_weak(
                prev,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => prev = actual,
            }
        }
    }
}
