//! Compressed archives holding several array files.
//!
//! ```text
//! | magic (8) | version u32 | member count u32 |
//! | per member: name length u16 | name | raw length u64 | compressed length u64 |
//! | member payloads in table order |
//! ```
//!
//! Each payload is a complete array file compressed with zstd. Members
//! are decompressed individually so a subset of columns can be read
//! without touching the rest of the archive.

use std::fs::File;
use std::io::{Read, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use cask_tarp::{AlignedBuf, TypedArray};
use memmap2::{Mmap, MmapOptions};
use tracing::{debug, trace};

use crate::io::array_file;
use crate::StoreError;

pub(crate) const ARCHIVE_MAGIC: &[u8; 8] = b"CASKARZ\0";
pub(crate) const ARCHIVE_VERSION: u32 = 1;
const PREFIX_SIZE: usize = 16;
const ENTRY_FIXED_SIZE: usize = 2 + 8 + 8;
const READ_CHUNK_SIZE: usize = 64 << 10;
const PREALLOCATE_RATIO: usize = 8;

/// Compresses the given `(name, array file bytes)` members and writes
/// them as an archive, syncing it to disk.
pub(crate) fn write_archive(
    path: &Path,
    members: &[(String, Vec<u8>)],
    level: i32,
) -> Result<(), StoreError> {
    let mut compressed = Vec::with_capacity(members.len());
    for (name, raw) in members {
        if name.len() > u16::MAX as usize {
            return Err(StoreError::InvalidName(name.clone()));
        }
        compressed.push(zstd::bulk::compress(raw, level)?);
    }

    let mut file = File::create(path)?;
    let mut table = Vec::new();
    table.extend_from_slice(ARCHIVE_MAGIC);
    table.extend_from_slice(&ARCHIVE_VERSION.to_le_bytes());
    table.extend_from_slice(&(members.len() as u32).to_le_bytes());
    for ((name, raw), payload) in members.iter().zip(&compressed) {
        table.extend_from_slice(&(name.len() as u16).to_le_bytes());
        table.extend_from_slice(name.as_bytes());
        table.extend_from_slice(&(raw.len() as u64).to_le_bytes());
        table.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    }
    file.write_all(&table)?;
    for payload in &compressed {
        file.write_all(payload)?;
    }
    file.sync_all()?;

    debug!(
        path = %path.display(),
        members = members.len(),
        raw_bytes = members.iter().map(|(_, raw)| raw.len()).sum::<usize>(),
        compressed_bytes = compressed.iter().map(Vec::len).sum::<usize>(),
        "Wrote archive",
    );
    Ok(())
}

#[derive(Debug)]
struct MemberEntry {
    name: String,
    raw_len: usize,
    payload: Range<usize>,
}

/// A read only view of an archive on disk.
pub(crate) struct ArchiveReader {
    path: PathBuf,
    map: Mmap,
    members: Vec<MemberEntry>,
}

impl ArchiveReader {
    /// Opens an archive and parses its member table.
    pub(crate) fn open(path: &Path) -> Result<Self, StoreError> {
        let file = File::open(path)?;
        // SAFETY: archives are written once via rename and never modified in place.
        let map = unsafe { MmapOptions::new().map(&file)? };
        let members = parse_table(path, &map)?;
        trace!(path = %path.display(), members = members.len(), "Opened archive");

        Ok(Self {
            path: path.to_path_buf(),
            map,
            members,
        })
    }

    /// The member names in table order.
    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|member| member.name.as_str())
    }

    #[inline]
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.members.iter().any(|member| member.name == name)
    }

    /// Decompresses a member into an aligned buffer holding the original array file.
    pub(crate) fn read_raw(&self, name: &str) -> Result<Option<AlignedBuf>, StoreError> {
        let Some(member) = self.members.iter().find(|member| member.name == name) else {
            return Ok(None);
        };

        // The declared length is only trusted as a limit, the buffer grows
        // with the bytes actually decompressed.
        let payload = &self.map[member.payload.clone()];
        let decompress_error =
            |e: std::io::Error| self.corrupted(name, format!("cannot decompress member: {e}"));
        let mut decoder =
            zstd::stream::read::Decoder::with_buffer(payload).map_err(decompress_error)?;

        let capacity = member.raw_len.min(payload.len().saturating_mul(PREALLOCATE_RATIO));
        let mut buf = AlignedBuf::with_capacity(capacity);
        let mut chunk = vec![0; READ_CHUNK_SIZE];
        loop {
            let n = decoder.read(&mut chunk).map_err(decompress_error)?;
            if n == 0 {
                break;
            }
            if buf.len() + n > member.raw_len {
                return Err(self.corrupted(
                    name,
                    format!("member expands past its declared {} bytes", member.raw_len),
                ));
            }
            buf.extend_from_slice(&chunk[..n]);
        }

        if buf.len() != member.raw_len {
            return Err(self.corrupted(
                name,
                format!("member expanded to {} bytes, expected {}", buf.len(), member.raw_len),
            ));
        }
        Ok(Some(buf))
    }

    /// Decompresses and decodes a member array.
    pub(crate) fn read_array(&self, name: &str) -> Result<Option<TypedArray>, StoreError> {
        let Some(buf) = self.read_raw(name)? else {
            return Ok(None);
        };
        array_file::decode_array(&self.member_path(name), buf).map(Some)
    }

    fn member_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    fn corrupted(&self, name: &str, reason: String) -> StoreError {
        StoreError::corrupted(self.member_path(name), reason)
    }
}

fn parse_table(path: &Path, bytes: &[u8]) -> Result<Vec<MemberEntry>, StoreError> {
    let mut cursor = Cursor { path, bytes, pos: 0 };

    if cursor.take(8, "magic")? != ARCHIVE_MAGIC {
        return Err(StoreError::corrupted(path, "missing archive magic"));
    }
    let version = cursor.read_u32("version")?;
    if version != ARCHIVE_VERSION {
        return Err(StoreError::corrupted(
            path,
            format!("unsupported archive version {version}"),
        ));
    }

    let count = cursor.read_u32("member count")? as usize;
    let mut entries = Vec::with_capacity(count.min(bytes.len() / ENTRY_FIXED_SIZE));
    for _ in 0..count {
        let name_len = cursor.read_u16("member name length")? as usize;
        let name = std::str::from_utf8(cursor.take(name_len, "member name")?)
            .map_err(|e| StoreError::corrupted(path, format!("member name is not UTF-8: {e}")))?
            .to_string();
        let raw_len = cursor.read_u64("member length")?;
        let compressed_len = cursor.read_u64("member length")?;
        entries.push((name, raw_len, compressed_len));
    }

    let mut offset = cursor.pos;
    let mut members = Vec::with_capacity(entries.len());
    for (name, raw_len, compressed_len) in entries {
        let end = usize::try_from(compressed_len)
            .ok()
            .and_then(|len| offset.checked_add(len))
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| StoreError::corrupted(path, format!("member {name:?} is truncated")))?;
        let raw_len = usize::try_from(raw_len).map_err(|_| {
            StoreError::corrupted(path, format!("member {name:?} is too large to expand"))
        })?;

        members.push(MemberEntry {
            name,
            raw_len,
            payload: offset..end,
        });
        offset = end;
    }

    if offset != bytes.len() {
        return Err(StoreError::corrupted(
            path,
            format!("{} unexpected bytes after the last member", bytes.len() - offset),
        ));
    }

    Ok(members)
}

struct Cursor<'a> {
    path: &'a Path,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8], StoreError> {
        let end = self.pos + len;
        if end > self.bytes.len() {
            return Err(StoreError::corrupted(
                self.path,
                format!("archive table is truncated reading {what}"),
            ));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u16(&mut self, what: &str) -> Result<u16, StoreError> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self, what: &str) -> Result<u32, StoreError> {
        let mut word = [0; 4];
        word.copy_from_slice(self.take(4, what)?);
        Ok(u32::from_le_bytes(word))
    }

    fn read_u64(&mut self, what: &str) -> Result<u64, StoreError> {
        let mut word = [0; 8];
        word.copy_from_slice(self.take(8, what)?);
        Ok(u64::from_le_bytes(word))
    }
}
