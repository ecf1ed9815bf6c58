//! envfs archive codec
//!
//! An archive is a [`Superblock`] followed by the entry region. The entry region is a
//! sequence of entries, each laid out as:
//!
//! ```text
//! magic:u32 headerlen:u32 size:u32   name:u8[pad4(strlen+1)]
//! magic:u32 mode:u32                 content:u8[pad4(size)]
//! ```
//!
//! and terminated by a header whose magic is [`END_MAGIC`]. `headerlen` covers the padded
//! name and the trailer, so a reader can skip an entry without looking at its name.
//!
//! All multi-byte fields are written in the host's native byte order. Save and load run on
//! the same target, so archives are not meant to move between architectures.
mod superblock;

pub use superblock::*;

use crate::error::{Error, Result};

pub const INODE_MAGIC: u32 = 0x67a8_c78d;
pub const INODE_END_MAGIC: u32 = 0x68a8_c78d;
pub const END_MAGIC: u32 = 0x6a87_d6cd;

/// `magic`, `headerlen`, `size`
pub const INODE_HEADER_SIZE: usize = 12;
/// `magic`, `mode`
pub const INODE_END_SIZE: usize = 8;

const S_IFMT: u32 = 0o170_000;
const S_IFLNK: u32 = 0o120_000;
const PERMISSION_BITS: u32 = 0o7777;
const TOMBSTONE_MODE: u32 = S_IFLNK | 0o777;

/// Rounds `len` up to the next multiple of four.
pub const fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// A file whose content differs from the default environment.
    Regular { content: Vec<u8>, mode: u32 },
    /// A symlink marker. Deleted default files are stored as a dangling link to their
    /// own basename, so the deletion survives the next boot.
    Tombstone { target: String },
}

/// One persisted file of the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Path relative to the environment root, `/`-separated
    pub name: String,
    pub kind: EntryKind,
}

impl Entry {
    pub fn regular(name: impl Into<String>, content: Vec<u8>, mode: u32) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Regular {
                content,
                mode: mode & PERMISSION_BITS,
            },
        }
    }

    pub fn tombstone(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Tombstone {
                target: target.into(),
            },
        }
    }

    pub const fn is_tombstone(&self) -> bool {
        matches!(self.kind, EntryKind::Tombstone { .. })
    }

    /// The `mode` field as stored in the entry trailer.
    pub const fn wire_mode(&self) -> u32 {
        match &self.kind {
            EntryKind::Regular { mode, .. } => *mode,
            EntryKind::Tombstone { .. } => TOMBSTONE_MODE,
        }
    }

    /// The `size` field as stored in the entry header. Tombstone targets are stored
    /// with their terminating NUL.
    pub fn wire_size(&self) -> usize {
        match &self.kind {
            EntryKind::Regular { content, .. } => content.len(),
            EntryKind::Tombstone { target } => target.len() + 1,
        }
    }

    /// Number of bytes this entry occupies in the entry region.
    pub fn encoded_len(&self) -> usize {
        INODE_HEADER_SIZE + pad4(self.name.len() + 1) + INODE_END_SIZE + pad4(self.wire_size())
    }
}

/// Exact length of the entry region [`encode_entries`] produces for `entries`.
pub fn encoded_len(entries: &[Entry]) -> usize {
    entries.iter().map(Entry::encoded_len).sum::<usize>() + INODE_HEADER_SIZE
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_ne_bytes());
}

fn wire_u32(value: usize, what: &str, name: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::format(format!("{what} of '{name}' does not fit the archive")))
}

fn encode_entry(entry: &Entry, buf: &mut Vec<u8>) -> Result<()> {
    let name = entry.name.as_bytes();
    if name.is_empty() || name.contains(&0) {
        return Err(Error::format(format!(
            "cannot store entry with name {:?}",
            entry.name
        )));
    }
    if let EntryKind::Tombstone { target } = &entry.kind {
        if target.as_bytes().contains(&0) {
            return Err(Error::format(format!(
                "link target of '{}' contains a NUL byte",
                entry.name
            )));
        }
    }

    let padded_name = pad4(name.len() + 1);
    let size = entry.wire_size();

    put_u32(buf, INODE_MAGIC);
    put_u32(buf, wire_u32(padded_name + INODE_END_SIZE, "header", &entry.name)?);
    put_u32(buf, wire_u32(size, "size", &entry.name)?);

    let name_start = buf.len();
    buf.extend_from_slice(name);
    buf.resize(name_start + padded_name, 0);

    put_u32(buf, INODE_END_MAGIC);
    put_u32(buf, entry.wire_mode());

    let content_start = buf.len();
    match &entry.kind {
        EntryKind::Regular { content, .. } => buf.extend_from_slice(content),
        EntryKind::Tombstone { target } => {
            buf.extend_from_slice(target.as_bytes());
            buf.push(0);
        }
    }
    buf.resize(content_start + pad4(size), 0);

    tracing::trace!(
        name = %entry.name,
        size,
        mode = format!("{:o}", entry.wire_mode()),
        "Encoded entry"
    );
    Ok(())
}

/// Serializes `entries`, in order, into an envfs entry region.
pub fn encode_entries(entries: &[Entry]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(encoded_len(entries));
    for entry in entries {
        encode_entry(entry, &mut buf)?;
    }

    put_u32(&mut buf, END_MAGIC);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, 0);
    Ok(buf)
}

/// Sequential reader over an entry region that reports the offset of whatever it
/// failed to read.
struct RegionReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RegionReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    const fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                Error::format(format!(
                    "truncated {what} at offset {} ({len} bytes wanted, {} left)",
                    self.pos,
                    self.buf.len() - self.pos
                ))
            })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        let mut word = [0u8; 4];
        word.copy_from_slice(self.take(4, what)?);
        Ok(u32::from_ne_bytes(word))
    }
}

fn decode_entry(reader: &mut RegionReader<'_>, offset: usize) -> Result<Entry> {
    let headerlen = reader.u32("entry header")? as usize;
    let size = reader.u32("entry header")? as usize;

    if headerlen < INODE_END_SIZE + 4 || headerlen % 4 != 0 {
        return Err(Error::format(format!(
            "bad header length {headerlen} in entry at offset {offset}"
        )));
    }

    let name_region = reader.take(headerlen - INODE_END_SIZE, "entry name")?;
    let name_len = name_region
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::format(format!("unterminated name in entry at offset {offset}")))?;
    let name = std::str::from_utf8(&name_region[..name_len])
        .map_err(|e| Error::format(format!("entry name at offset {offset} is not UTF-8: {e}")))?;
    if name.is_empty() {
        return Err(Error::format(format!("empty name in entry at offset {offset}")));
    }

    let end_magic = reader.u32("entry trailer")?;
    if end_magic != INODE_END_MAGIC {
        return Err(Error::format(format!(
            "wrong inode_end magic {end_magic:#010x} in entry '{name}'"
        )));
    }
    let mode = reader.u32("entry trailer")?;

    let content = reader.take(size, "entry content")?;
    reader.take(pad4(size) - size, "entry padding")?;

    let kind = if mode & S_IFMT == S_IFLNK {
        let target = content.split(|b| *b == 0).next().unwrap_or_default();
        let target = std::str::from_utf8(target).map_err(|e| {
            Error::format(format!("link target of '{name}' is not UTF-8: {e}"))
        })?;
        EntryKind::Tombstone {
            target: target.to_owned(),
        }
    } else {
        EntryKind::Regular {
            content: content.to_vec(),
            mode: mode & PERMISSION_BITS,
        }
    };

    tracing::trace!(name, size, mode = format!("{mode:o}"), "Decoded entry");
    Ok(Entry {
        name: name.to_owned(),
        kind,
    })
}

/// Parses an entry region back into entries.
///
/// Decoding stops at the [`END_MAGIC`] header, or when the region ends exactly on an
/// entry boundary (archives written before the terminator existed). Any other magic or a
/// truncated entry is a format error; no partially validated entry is ever returned.
pub fn decode_entries(region: &[u8]) -> Result<Vec<Entry>> {
    let mut reader = RegionReader::new(region);
    let mut entries = Vec::new();

    while !reader.is_empty() {
        let offset = reader.pos;
        match reader.u32("entry header")? {
            END_MAGIC => {
                tracing::trace!(offset, "Reached end of entry region");
                break;
            }
            INODE_MAGIC => entries.push(decode_entry(&mut reader, offset)?),
            magic => {
                return Err(Error::format(format!(
                    "wrong inode magic {magic:#010x} at offset {offset}"
                )));
            }
        }
    }

    Ok(entries)
}

/// Builds a complete archive image: superblock followed by the entry region.
///
/// Force-built-in images carry no entries at all.
pub fn build_image(flags: u32, entries: &[Entry]) -> Result<Vec<u8>> {
    let region = if flags & FLAG_FORCE_BUILT_IN == 0 {
        encode_entries(entries)?
    } else {
        Vec::new()
    };
    let superblock = Superblock::new(flags, &region)?;

    let mut image = Vec::with_capacity(SUPERBLOCK_SIZE + region.len());
    image.extend_from_slice(&superblock.to_bytes());
    image.extend_from_slice(&region);
    Ok(image)
}

/// Returns `true` if `bytes` starts with a 4-byte EFI variable attribute word in front
/// of the superblock.
pub fn has_efi_prefix(bytes: &[u8]) -> bool {
    bytes
        .get(EFI_PREFIX_SIZE..EFI_PREFIX_SIZE + 4)
        .is_some_and(|magic| magic == ENVFS_MAGIC.to_ne_bytes())
}

/// Validates and decodes a complete in-memory archive image, with or without an EFI
/// attribute prefix.
pub fn parse_image(bytes: &[u8]) -> Result<(Superblock, Vec<Entry>)> {
    let bytes = if has_efi_prefix(bytes) {
        &bytes[EFI_PREFIX_SIZE..]
    } else {
        bytes
    };

    let header: &[u8; SUPERBLOCK_SIZE] = bytes
        .get(..SUPERBLOCK_SIZE)
        .and_then(|header| header.try_into().ok())
        .ok_or_else(|| Error::format("image is smaller than a superblock"))?;
    let superblock = Superblock::parse(header)?;

    let region = bytes
        .get(SUPERBLOCK_SIZE..SUPERBLOCK_SIZE + superblock.region_len())
        .ok_or_else(|| Error::format("premature end of image"))?;
    superblock.check_data(region)?;

    let entries = decode_entries(region)?;
    Ok((superblock, entries))
}
