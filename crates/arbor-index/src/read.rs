//! Dircache file reading (format v2).

use bstr::BString;
use arbor_hash::{HashAlgorithm, ObjectId};
use arbor_object::FileMode;

use crate::entry::{IndexEntry, StatData};
use crate::{IndexError, Stage};

/// Magic bytes at the start of every index file.
const INDEX_SIGNATURE: &[u8; 4] = b"DIRC";

/// Parse an index file into its entry list.
pub(crate) fn parse_index(data: &[u8]) -> Result<Vec<IndexEntry>, IndexError> {
    if data.len() < 12 {
        return Err(IndexError::InvalidHeader("index file too short".into()));
    }

    verify_checksum(data)?;

    let mut cursor = 0;

    let sig = &data[cursor..cursor + 4];
    if sig != INDEX_SIGNATURE {
        return Err(IndexError::InvalidHeader(format!(
            "bad signature: expected DIRC, got {:?}",
            sig
        )));
    }
    cursor += 4;

    let version = read_u32(&data[cursor..]);
    cursor += 4;

    if version != 2 {
        return Err(IndexError::UnsupportedVersion(version));
    }

    let entry_count = read_u32(&data[cursor..]) as usize;
    cursor += 4;

    let content_end = data.len() - 20;
    let mut entries = Vec::with_capacity(entry_count);

    for _ in 0..entry_count {
        let (entry, new_cursor) = parse_entry(data, cursor, content_end)?;
        entries.push(entry);
        cursor = new_cursor;
    }

    // Extensions (TREE cache etc.) are skipped; this implementation never
    // writes any.

    Ok(entries)
}

/// Fixed portion of the on-disk entry:
/// ctime(8) + mtime(8) + dev(4) + ino(4) + mode(4) + uid(4) + gid(4) + size(4).
const ONDISK_OFFSET_DATA: usize = 40;

const SHA1_SIZE: usize = 20;

/// Total on-disk entry size, null-padded to 8-byte alignment.
fn ondisk_entry_size(name_len: usize) -> usize {
    (ONDISK_OFFSET_DATA + SHA1_SIZE + 2 + name_len + 8) & !7
}

/// Parse a single cache entry.
fn parse_entry(
    data: &[u8],
    start: usize,
    content_end: usize,
) -> Result<(IndexEntry, usize), IndexError> {
    let mut cursor = start;

    if cursor + 62 > content_end {
        return Err(IndexError::InvalidEntry {
            offset: start,
            reason: "entry too short".into(),
        });
    }

    let stat = StatData {
        ctime_secs: read_u32(&data[cursor..]),
        ctime_nsecs: read_u32(&data[cursor + 4..]),
        mtime_secs: read_u32(&data[cursor + 8..]),
        mtime_nsecs: read_u32(&data[cursor + 12..]),
        dev: read_u32(&data[cursor + 16..]),
        ino: read_u32(&data[cursor + 20..]),
        uid: read_u32(&data[cursor + 28..]),
        gid: read_u32(&data[cursor + 32..]),
        size: read_u32(&data[cursor + 36..]),
    };
    let mode_raw = read_u32(&data[cursor + 24..]);
    cursor += 40;

    let oid = ObjectId::from_bytes(&data[cursor..cursor + 20], HashAlgorithm::Sha1).map_err(
        |_| IndexError::InvalidEntry {
            offset: start,
            reason: "invalid OID".into(),
        },
    )?;
    cursor += 20;

    let flags_raw = read_u16(&data[cursor..]);
    cursor += 2;

    if (flags_raw & 0x4000) != 0 {
        return Err(IndexError::InvalidEntry {
            offset: start,
            reason: "extended flags in v2 index".into(),
        });
    }

    let stage_bits = ((flags_raw >> 12) & 0x03) as u8;
    let stage = Stage::from_u8(stage_bits)?;

    // NUL-terminated path.
    let path_start = cursor;
    let nul_pos = data[path_start..content_end]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| IndexError::InvalidEntry {
            offset: start,
            reason: "missing NUL in path".into(),
        })?;
    let path = BString::from(&data[path_start..path_start + nul_pos]);

    let mut next = start + ondisk_entry_size(nul_pos);
    if next > content_end {
        next = content_end;
    }

    let entry = IndexEntry {
        path,
        oid,
        mode: FileMode::from_raw(mode_raw),
        stage,
        stat,
    };

    Ok((entry, next))
}

/// Verify the trailing SHA-1 checksum.
fn verify_checksum(data: &[u8]) -> Result<(), IndexError> {
    if data.len() < 20 {
        return Err(IndexError::ChecksumMismatch);
    }

    let content = &data[..data.len() - 20];
    let stored = &data[data.len() - 20..];

    let computed = arbor_hash::hasher::Hasher::digest(HashAlgorithm::Sha1, content)
        .map_err(|_| IndexError::ChecksumMismatch)?;

    if computed.as_bytes() != stored {
        return Err(IndexError::ChecksumMismatch);
    }

    Ok(())
}

fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

fn read_u16(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}
