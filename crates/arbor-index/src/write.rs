//! Dircache file writing (format v2) and tree materialization.

use std::io::Write;

use arbor_hash::hasher::Hasher;
use arbor_hash::{HashAlgorithm, ObjectId};
use arbor_object::{FileMode, ObjectType, Tree, TreeEntry};
use arbor_odb::ObjectStore;
use arbor_utils::lockfile::LockFile;

use crate::entry::IndexEntry;
use crate::{IndexError, Stage};

/// Magic bytes at the start of every index file.
const INDEX_SIGNATURE: &[u8; 4] = b"DIRC";

/// Serialize entries into index format v2 (entries must be sorted).
pub(crate) fn serialize_index(entries: &[IndexEntry]) -> Result<Vec<u8>, IndexError> {
    let mut buf = Vec::new();

    buf.extend_from_slice(INDEX_SIGNATURE);
    buf.extend_from_slice(&2u32.to_be_bytes());
    buf.extend_from_slice(&(entries.len() as u32).to_be_bytes());

    for entry in entries {
        write_entry(&mut buf, entry);
    }

    let checksum = Hasher::digest(HashAlgorithm::Sha1, &buf)
        .map_err(|_| IndexError::InvalidHeader("checksum computation failed".into()))?;
    buf.extend_from_slice(checksum.as_bytes());

    Ok(buf)
}

/// Write serialized index data through a held lock and release it.
pub(crate) fn commit_through_lock(mut lock: LockFile, data: &[u8]) -> Result<(), IndexError> {
    let path = lock.path().to_path_buf();
    lock.write_all(data)?;
    lock.commit()
        .map_err(|_| IndexError::LockFailed { path })?;
    Ok(())
}

/// Write a single v2 cache entry.
fn write_entry(buf: &mut Vec<u8>, entry: &IndexEntry) {
    let entry_start = buf.len();

    buf.extend_from_slice(&entry.stat.ctime_secs.to_be_bytes());
    buf.extend_from_slice(&entry.stat.ctime_nsecs.to_be_bytes());
    buf.extend_from_slice(&entry.stat.mtime_secs.to_be_bytes());
    buf.extend_from_slice(&entry.stat.mtime_nsecs.to_be_bytes());
    buf.extend_from_slice(&entry.stat.dev.to_be_bytes());
    buf.extend_from_slice(&entry.stat.ino.to_be_bytes());
    buf.extend_from_slice(&entry.mode.raw().to_be_bytes());
    buf.extend_from_slice(&entry.stat.uid.to_be_bytes());
    buf.extend_from_slice(&entry.stat.gid.to_be_bytes());
    buf.extend_from_slice(&entry.stat.size.to_be_bytes());

    buf.extend_from_slice(entry.oid.as_bytes());

    let name_len = std::cmp::min(entry.path.len(), 0xFFF) as u16;
    let flags: u16 = name_len | ((entry.stage.as_u8() as u16) << 12);
    buf.extend_from_slice(&flags.to_be_bytes());

    buf.extend_from_slice(&entry.path);

    // Null-pad to 8-byte alignment.
    let entry_size = (40 + 20 + 2 + entry.path.len() + 8) & !7;
    let padding = entry_size - (buf.len() - entry_start);
    buf.resize(buf.len() + padding, 0);
}

/// Build nested tree objects from sorted stage-0 entries and return the root
/// tree OID.
pub(crate) fn write_tree_from_entries(
    entries: &[IndexEntry],
    store: &ObjectStore,
) -> Result<ObjectId, IndexError> {
    let stage0: Vec<&IndexEntry> = entries
        .iter()
        .filter(|e| e.stage == Stage::Normal)
        .collect();

    build_tree(&stage0, b"", store)
}

/// Recursively build tree objects from sorted entries sharing `prefix`.
fn build_tree(
    entries: &[&IndexEntry],
    prefix: &[u8],
    store: &ObjectStore,
) -> Result<ObjectId, IndexError> {
    let mut tree_entries: Vec<TreeEntry> = Vec::new();
    let mut i = 0;

    while i < entries.len() {
        let rest = &entries[i].path[prefix.len()..];

        if let Some(slash_pos) = rest.iter().position(|&b| b == b'/') {
            let dir_name = &rest[..slash_pos];

            // Everything whose next component equals dir_name belongs to the
            // subtree; the entries are sorted, so it is one contiguous run.
            let mut sub_prefix = prefix.to_vec();
            sub_prefix.extend_from_slice(dir_name);
            sub_prefix.push(b'/');

            let run_end = entries[i..]
                .iter()
                .position(|e| !e.path.starts_with(&sub_prefix))
                .map(|pos| i + pos)
                .unwrap_or(entries.len());

            let subtree_oid = build_tree(&entries[i..run_end], &sub_prefix, store)?;

            tree_entries.push(TreeEntry {
                mode: FileMode::Tree,
                name: dir_name.into(),
                oid: subtree_oid,
            });

            i = run_end;
        } else {
            tree_entries.push(TreeEntry {
                mode: entries[i].mode,
                name: rest.into(),
                oid: entries[i].oid,
            });
            i += 1;
        }
    }

    let mut tree = Tree::new();
    tree.entries = tree_entries;
    tree.sort();
    Ok(store.write_raw(ObjectType::Tree, &tree.serialize_content())?)
}
