//! Single-file key-value shard format
//!
//! ```text
//! ┌──────────┬───────────────────────────────────────────────────────┐
//! │ PHDLQ001 │ [u32 klen][key][u32 vlen][value][u32 crc32] ...       │
//! └──────────┴───────────────────────────────────────────────────────┘
//! ```
//!
//! Integers are little endian and the checksum covers key then value. A
//! shard is written whole to `<name>.tmp`, synced, then renamed into place,
//! so readers only ever observe complete files. When a record fails its
//! checksum or is cut short, the records before it are still returned.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{Result, StorageError};

pub const SHARD_MAGIC: &[u8; 8] = b"PHDLQ001";
pub const TEMP_SUFFIX: &str = "tmp";

const LEN_FIELD: usize = 4;

/// Records read back from a shard, ordered by key
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardContents {
    records: BTreeMap<String, Vec<u8>>,
}

impl ShardContents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the payload stored under `key`
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.records.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.records.get(key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> impl Iterator<Item = (String, Vec<u8>)> {
        self.records.into_iter()
    }

    /// Serialize into the on-disk layout
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body: usize = self
            .records
            .iter()
            .map(|(k, v)| k.len() + v.len() + 3 * LEN_FIELD)
            .sum();
        let mut out = Vec::with_capacity(SHARD_MAGIC.len() + body);
        out.extend_from_slice(SHARD_MAGIC);

        for (key, value) in &self.records {
            let klen = len_field(key.len())?;
            let vlen = len_field(value.len())?;

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(key.as_bytes());
            hasher.update(value);

            out.extend_from_slice(&klen.to_le_bytes());
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(&vlen.to_le_bytes());
            out.extend_from_slice(value);
            out.extend_from_slice(&hasher.finalize().to_le_bytes());
        }
        Ok(out)
    }

    /// Parse the on-disk layout, keeping the valid prefix of records
    pub fn decode(path: &Path, data: &[u8]) -> Result<Self> {
        let Some(mut rest) = data.strip_prefix(SHARD_MAGIC.as_slice()) else {
            return Err(StorageError::InvalidHeader {
                path: path.to_path_buf(),
            });
        };

        let mut contents = Self::new();
        while !rest.is_empty() {
            match next_record(rest) {
                Some((key, value, consumed)) => {
                    let mut hasher = crc32fast::Hasher::new();
                    hasher.update(key);
                    hasher.update(value);
                    let stored = read_u32(&rest[consumed - LEN_FIELD..]).unwrap_or_default();
                    if hasher.finalize() != stored {
                        warn!(?path, records = contents.len(), "Checksum mismatch, ignoring rest of shard");
                        break;
                    }
                    match std::str::from_utf8(key) {
                        Ok(key) => contents.set(key, value),
                        Err(_) => warn!(?path, "Skipping record with non UTF-8 key"),
                    }
                    rest = &rest[consumed..];
                }
                None => {
                    warn!(?path, trailing = rest.len(), "Truncated record, ignoring rest of shard");
                    break;
                }
            }
        }
        Ok(contents)
    }
}

/// Write `contents` to `dir/name` through a synced temporary file
pub fn write_shard(dir: &Path, name: &str, contents: &ShardContents) -> Result<PathBuf> {
    let bytes = contents.encode()?;
    let final_path = dir.join(name);
    let temp_path = dir.join(format!("{name}.{TEMP_SUFFIX}"));

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .map_err(|e| StorageError::io(&temp_path, e))?;
    file.write_all(&bytes)
        .map_err(|e| StorageError::io(&temp_path, e))?;
    file.sync_all()
        .map_err(|e| StorageError::io(&temp_path, e))?;
    drop(file);

    fs::rename(&temp_path, &final_path).map_err(|e| StorageError::io(&final_path, e))?;
    sync_dir(dir);
    Ok(final_path)
}

/// Read and decode a shard file
pub fn read_shard(path: &Path) -> Result<ShardContents> {
    let data = fs::read(path).map_err(|e| StorageError::io(path, e))?;
    ShardContents::decode(path, &data)
}

fn sync_dir(dir: &Path) {
    // Not every platform can open a directory for syncing
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

fn len_field(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| StorageError::RecordTooLarge { len })
}

fn read_u32(buf: &[u8]) -> Option<u32> {
    let bytes: [u8; LEN_FIELD] = buf.get(..LEN_FIELD)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Split one record off the front: `(key, value, bytes consumed)`
fn next_record(buf: &[u8]) -> Option<(&[u8], &[u8], usize)> {
    let klen = read_u32(buf)? as usize;
    let mut pos = LEN_FIELD;
    let key = buf.get(pos..pos.checked_add(klen)?)?;
    pos += klen;

    let vlen = read_u32(buf.get(pos..)?)? as usize;
    pos += LEN_FIELD;
    let value = buf.get(pos..pos.checked_add(vlen)?)?;
    pos += vlen;

    buf.get(pos..pos + LEN_FIELD)?;
    Some((key, value, pos + LEN_FIELD))
}
