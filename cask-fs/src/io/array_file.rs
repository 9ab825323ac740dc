//! The single array file format.
//!
//! ```text
//! | magic (8) | version u32 | header length u32 | JSON header | padding | records |
//! ```
//!
//! The JSON header is padded with spaces so the records always start
//! on a 64 byte boundary, which keeps mapped arrays aligned for any
//! primitive type.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use cask_tarp::{AlignedBuf, ElementLayout, TypedArray};
use memmap2::MmapOptions;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::StoreError;

pub(crate) const ARRAY_MAGIC: &[u8; 8] = b"CASKARR\0";
pub(crate) const ARRAY_VERSION: u32 = 1;
const PREFIX_SIZE: usize = 16;
const DATA_ALIGNMENT: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
struct ArrayHeader {
    layout: ElementLayout,
    rows: u64,
}

/// Encodes an array into the array file format.
pub(crate) fn encode_array(array: &TypedArray) -> Result<Vec<u8>, StoreError> {
    let header = ArrayHeader {
        layout: array.layout().clone(),
        rows: array.len() as u64,
    };
    let mut header = serde_json::to_vec(&header)?;
    let padded_len = (PREFIX_SIZE + header.len()).next_multiple_of(DATA_ALIGNMENT) - PREFIX_SIZE;
    header.resize(padded_len, b' ');

    let records = array.as_bytes();
    let mut buf = Vec::with_capacity(PREFIX_SIZE + header.len() + records.len());
    buf.extend_from_slice(ARRAY_MAGIC);
    buf.extend_from_slice(&ARRAY_VERSION.to_le_bytes());
    buf.extend_from_slice(&(header.len() as u32).to_le_bytes());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(records);
    Ok(buf)
}

/// Writes an array file to the given path, syncing it to disk.
pub(crate) fn write_array(path: &Path, array: &TypedArray) -> Result<(), StoreError> {
    let encoded = encode_array(array)?;
    let mut file = File::create(path)?;
    file.write_all(&encoded)?;
    file.sync_all()?;
    trace!(path = %path.display(), rows = array.len(), bytes = encoded.len(), "Wrote array file");
    Ok(())
}

/// Memory maps an array file, the records are borrowed from the map.
pub(crate) fn read_array_mapped(path: &Path) -> Result<TypedArray, StoreError> {
    let file = File::open(path)?;
    // SAFETY: stores are written once via rename and never modified in place.
    let map = unsafe { MmapOptions::new().map(&file)? };
    let (header, offset) = decode_prefix(path, &map)?;
    let rows = header_rows(path, &header)?;
    TypedArray::from_mapped(header.layout, rows, Arc::new(map), offset)
        .map_err(|e| StoreError::corrupted(path, e.to_string()))
}

/// Reads an array file fully onto the heap.
pub(crate) fn read_array_heap(path: &Path) -> Result<TypedArray, StoreError> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len() as usize;
    let mut buf = AlignedBuf::zeroed(len);
    file.read_exact(buf.as_bytes_mut())?;
    decode_array(path, buf)
}

/// Decodes an array file already held in memory, taking ownership of the buffer.
///
/// `path` is only used to describe the source in errors.
pub(crate) fn decode_array(path: &Path, buf: AlignedBuf) -> Result<TypedArray, StoreError> {
    let (header, offset) = decode_prefix(path, buf.as_bytes())?;
    let rows = header_rows(path, &header)?;
    TypedArray::from_heap(header.layout, rows, buf, offset)
        .map_err(|e| StoreError::corrupted(path, e.to_string()))
}

/// Checks that the bytes hold a well formed array file.
pub(crate) fn validate_array_bytes(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    decode_prefix(path, bytes).map(|_| ())
}

/// Parses the file prefix and header, checking the record region matches the header.
fn decode_prefix(path: &Path, bytes: &[u8]) -> Result<(ArrayHeader, usize), StoreError> {
    if bytes.len() < PREFIX_SIZE || &bytes[..8] != ARRAY_MAGIC {
        return Err(StoreError::corrupted(path, "missing array file magic"));
    }

    let version = u32::from_le_bytes(read_u32(&bytes[8..12]));
    if version != ARRAY_VERSION {
        return Err(StoreError::corrupted(
            path,
            format!("unsupported array file version {version}"),
        ));
    }

    let header_len = u32::from_le_bytes(read_u32(&bytes[12..16])) as usize;
    let offset = PREFIX_SIZE + header_len;
    if offset > bytes.len() {
        return Err(StoreError::corrupted(
            path,
            format!("header of {header_len} bytes is truncated"),
        ));
    }
    if offset % DATA_ALIGNMENT != 0 {
        return Err(StoreError::corrupted(
            path,
            format!("record data at offset {offset} is not {DATA_ALIGNMENT} byte aligned"),
        ));
    }

    let header: ArrayHeader = serde_json::from_slice(&bytes[PREFIX_SIZE..offset])
        .map_err(|e| StoreError::corrupted(path, format!("invalid array header: {e}")))?;

    let record_size = header
        .layout
        .size()
        .ok_or_else(|| StoreError::corrupted(path, format!("layout {} has no fixed size", header.layout)))?;
    let expected = header_rows(path, &header)?
        .checked_mul(record_size)
        .ok_or_else(|| {
            StoreError::corrupted(
                path,
                format!("{} records of {record_size} bytes overflow", header.rows),
            )
        })?;
    let available = bytes.len() - offset;
    if available != expected {
        return Err(StoreError::corrupted(
            path,
            format!(
                "header declares {} records ({expected} bytes) but {available} bytes follow",
                header.rows,
            ),
        ));
    }

    Ok((header, offset))
}

fn header_rows(path: &Path, header: &ArrayHeader) -> Result<usize, StoreError> {
    usize::try_from(header.rows)
        .map_err(|_| StoreError::corrupted(path, format!("row count {} is too large", header.rows)))
}

fn read_u32(bytes: &[u8]) -> [u8; 4] {
    let mut word = [0; 4];
    word.copy_from_slice(bytes);
    word
}
