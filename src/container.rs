//! # Field containers
//!
//! Binary files holding an ordered sequence of named, leveled field
//! records. A container has no file header: it is the plain concatenation
//! of its records, so records can be streamed and appended independently.
//!
//! ## Record layout
//!
//! ```text
//! "FREC"            magic
//! record_len  u32   total bytes of this record, magic and trailer included
//! name_len    u8
//! short_name  [u8]  UTF-8
//! level       i32
//! count       u32
//! values      f64 x count
//! "7777"            trailer
//! ```
//!
//! All integers and floats are little-endian.
//!
//! Decoded records keep the exact bytes they were read from. A record is
//! re-encoded only after [`FieldRecord::set_values`], so writing back an
//! untouched record reproduces its input bytes exactly.
//!
//! ## Example
//!
//! ```rust
//! use ifs_ensemble::container::{Container, FieldRecord};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let path = dir.path().join("ICMSHdemoINIT");
//! let t = FieldRecord::new("t", 30, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
//! Container::write(&path, &[t]).unwrap();
//!
//! let container = Container::open(&path).unwrap();
//! assert_eq!(container.mode_count(), Some(4));
//! assert_eq!(container.records()[0].short_name(), "t");
//! ```

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

pub const RECORD_MAGIC: [u8; 4] = *b"FREC";
pub const RECORD_TRAILER: [u8; 4] = *b"7777";

/// magic + record_len + name_len
const PREFIX_LEN: usize = 4 + 4 + 1;
/// level + count
const META_LEN: usize = 4 + 4;

/// Errors raised while decoding, encoding or querying a container.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// File could not be read or written
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Record does not start with the expected magic
    #[error("bad record magic at byte offset {offset}")]
    BadMagic { offset: usize },
    /// File ends in the middle of a record
    #[error("truncated record at byte offset {offset}")]
    Truncated { offset: usize },
    /// Declared record length disagrees with its contents
    #[error("inconsistent record length at byte offset {offset}")]
    BadLength { offset: usize },
    /// Record is not terminated by the trailer
    #[error("missing record trailer at byte offset {offset}")]
    BadTrailer { offset: usize },
    /// Short name is empty, longer than 255 bytes or not UTF-8
    #[error("invalid short name: {0}")]
    InvalidName(String),
    /// Replacement value array has a different length
    #[error("value count mismatch: expected {expected}, got {got}")]
    LengthMismatch { expected: usize, got: usize },
    /// Mode position outside the record's value array
    #[error("mode {mode} out of range for record with {len} values")]
    ModeOutOfRange { mode: usize, len: usize },
    /// No record matches the requested key
    #[error("no record for variable {variable} at level {level}")]
    NotFound { variable: String, level: i32 },
}

/// One named, leveled array of scalar values.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRecord {
    short_name: String,
    level: i32,
    values: Vec<f64>,
    /// Bytes the record was decoded from; cleared on modification.
    raw: Option<Vec<u8>>,
}

impl FieldRecord {
    pub fn new(short_name: &str, level: i32, values: Vec<f64>) -> Result<Self, ContainerError> {
        validate_name(short_name)?;
        if values.len() > u32::MAX as usize {
            return Err(ContainerError::LengthMismatch {
                expected: u32::MAX as usize,
                got: values.len(),
            });
        }
        Ok(FieldRecord {
            short_name: short_name.to_string(),
            level,
            values,
            raw: None,
        })
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn value(&self, mode: usize) -> Result<f64, ContainerError> {
        self.values
            .get(mode)
            .copied()
            .ok_or(ContainerError::ModeOutOfRange {
                mode,
                len: self.values.len(),
            })
    }

    pub fn matches(&self, variable: &str, level: i32) -> bool {
        self.short_name == variable && self.level == level
    }

    /// Replace the value array. The length must not change.
    pub fn set_values(&mut self, values: Vec<f64>) -> Result<(), ContainerError> {
        if values.len() != self.values.len() {
            return Err(ContainerError::LengthMismatch {
                expected: self.values.len(),
                got: values.len(),
            });
        }
        self.values = values;
        self.raw = None;
        Ok(())
    }

    /// Whether this record still holds the bytes it was decoded from.
    pub fn is_pristine(&self) -> bool {
        self.raw.is_some()
    }

    /// Binary encoding of this record.
    pub fn serialize(&self) -> Vec<u8> {
        match &self.raw {
            Some(raw) => raw.clone(),
            None => self.encode(),
        }
    }

    fn encoded_len(&self) -> usize {
        PREFIX_LEN + self.short_name.len() + META_LEN + 8 * self.values.len() + RECORD_TRAILER.len()
    }

    fn encode(&self) -> Vec<u8> {
        let len = self.encoded_len();
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&RECORD_MAGIC);
        out.extend_from_slice(&(len as u32).to_le_bytes());
        out.push(self.short_name.len() as u8);
        out.extend_from_slice(self.short_name.as_bytes());
        out.extend_from_slice(&self.level.to_le_bytes());
        out.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&RECORD_TRAILER);
        out
    }

    fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        match &self.raw {
            Some(raw) => w.write_all(raw),
            None => w.write_all(&self.encode()),
        }
    }
}

fn validate_name(name: &str) -> Result<(), ContainerError> {
    if name.is_empty() || name.len() > u8::MAX as usize {
        return Err(ContainerError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Decode every record in `bytes`, in order.
pub fn decode_records(bytes: &[u8]) -> Result<Vec<FieldRecord>, ContainerError> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let (record, len) = decode_record(bytes, offset)?;
        records.push(record);
        offset += len;
    }
    Ok(records)
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

fn decode_record(bytes: &[u8], offset: usize) -> Result<(FieldRecord, usize), ContainerError> {
    let rest = &bytes[offset..];
    if rest.len() < PREFIX_LEN {
        return Err(ContainerError::Truncated { offset });
    }
    if rest[..4] != RECORD_MAGIC {
        return Err(ContainerError::BadMagic { offset });
    }
    let record_len = read_u32(rest, 4) as usize;
    if record_len > rest.len() {
        return Err(ContainerError::Truncated { offset });
    }
    let rec = &rest[..record_len];
    let name_len = rec.get(8).copied().ok_or(ContainerError::BadLength { offset })? as usize;
    let meta_at = PREFIX_LEN + name_len;
    if rec.len() < meta_at + META_LEN + RECORD_TRAILER.len() {
        return Err(ContainerError::BadLength { offset });
    }
    let short_name = std::str::from_utf8(&rec[PREFIX_LEN..meta_at])
        .map_err(|_| ContainerError::InvalidName(String::from_utf8_lossy(&rec[PREFIX_LEN..meta_at]).into_owned()))?;
    validate_name(short_name)?;
    let level = read_u32(rec, meta_at) as i32;
    let count = read_u32(rec, meta_at + 4) as usize;
    let values_at = meta_at + META_LEN;
    let expected_len = values_at
        .checked_add(count.checked_mul(8).ok_or(ContainerError::BadLength { offset })?)
        .and_then(|n| n.checked_add(RECORD_TRAILER.len()))
        .ok_or(ContainerError::BadLength { offset })?;
    if expected_len != record_len {
        return Err(ContainerError::BadLength { offset });
    }
    if rec[record_len - 4..] != RECORD_TRAILER {
        return Err(ContainerError::BadTrailer { offset });
    }
    let values = rec[values_at..record_len - 4]
        .chunks_exact(8)
        .map(|c| {
            let mut b = [0u8; 8];
            b.copy_from_slice(c);
            f64::from_le_bytes(b)
        })
        .collect();
    let record = FieldRecord {
        short_name: short_name.to_string(),
        level,
        values,
        raw: Some(rec.to_vec()),
    };
    Ok((record, record_len))
}

/// A fully materialised container file.
///
/// The whole file is decoded on open, so memory use is proportional to
/// the container size.
#[derive(Debug, Clone)]
pub struct Container {
    path: PathBuf,
    records: Vec<FieldRecord>,
}

impl Container {
    pub fn open(path: &Path) -> Result<Self, ContainerError> {
        let bytes = fs::read(path).map_err(|source| ContainerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let records = decode_records(&bytes)?;
        Ok(Container {
            path: path.to_path_buf(),
            records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[FieldRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<FieldRecord> {
        self.records
    }

    /// Number of values per record, taken from the first record.
    pub fn mode_count(&self) -> Option<usize> {
        self.records.first().map(|r| r.values().len())
    }

    /// Write `records` in order to a new file at `path`.
    pub fn write(path: &Path, records: &[FieldRecord]) -> Result<(), ContainerError> {
        let io_err = |source| ContainerError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut w = BufWriter::new(File::create(path).map_err(io_err)?);
        for record in records {
            record.write_to(&mut w).map_err(io_err)?;
        }
        w.flush().map_err(io_err)?;
        Ok(())
    }
}

/// Records of one container keyed by `(short_name, level)`.
#[derive(Debug)]
pub struct FieldIndex {
    records: Vec<FieldRecord>,
    keys: HashMap<(String, i32), Vec<usize>>,
}

impl FieldIndex {
    pub fn open(path: &Path) -> Result<Self, ContainerError> {
        Ok(Self::from_records(Container::open(path)?.into_records()))
    }

    pub fn from_records(records: Vec<FieldRecord>) -> Self {
        let mut keys: HashMap<(String, i32), Vec<usize>> = HashMap::new();
        for (idx, r) in records.iter().enumerate() {
            keys.entry((r.short_name.clone(), r.level)).or_default().push(idx);
        }
        FieldIndex { records, keys }
    }

    /// All records matching the key, in file order.
    pub fn select(&self, variable: &str, level: i32) -> Vec<&FieldRecord> {
        self.keys
            .get(&(variable.to_string(), level))
            .map(|idxs| idxs.iter().map(|&i| &self.records[i]).collect())
            .unwrap_or_default()
    }

    pub fn first(&self, variable: &str, level: i32) -> Result<&FieldRecord, ContainerError> {
        self.select(variable, level)
            .into_iter()
            .next()
            .ok_or_else(|| ContainerError::NotFound {
                variable: variable.to_string(),
                level,
            })
    }
}
