//! Level views for the synchronized tree walk.
//!
//! The merge driver walks one directory level at a time across five
//! sources: the three trees, the dircache, and the working tree. Each
//! source contributes a sorted run of named entries per level; the driver
//! unions them by raw name so a file in one source and a directory of the
//! same name in another occupy a single walk position.

use std::collections::BTreeMap;

use bstr::BString;
use arbor_hash::ObjectId;
use arbor_index::IndexEntry;
use arbor_object::FileMode;
use arbor_odb::ObjectStore;

use crate::MergeError;

/// An entry of one tree at the current level.
#[derive(Debug, Clone)]
pub(crate) struct TreeNode {
    pub name: BString,
    pub mode: FileMode,
    pub oid: ObjectId,
}

impl TreeNode {
    /// Raw mode of an optional slot; 0 encodes absence.
    pub fn raw_mode(slot: Option<&TreeNode>) -> u32 {
        slot.map_or(0, |n| n.mode.raw())
    }

    /// OID of an optional slot; the null OID encodes absence.
    pub fn oid_of(slot: Option<&TreeNode>) -> ObjectId {
        slot.map_or(ObjectId::NULL_SHA1, |n| n.oid)
    }
}

/// Whether a raw mode denotes a present, non-directory entry.
pub(crate) fn non_tree(mode: u32) -> bool {
    mode != 0 && mode != FileMode::Tree.raw()
}

/// Load the level entries of a tree. A null or absent OID is an empty tree.
pub(crate) fn tree_level(
    store: &ObjectStore,
    oid: Option<&ObjectId>,
) -> Result<Vec<TreeNode>, MergeError> {
    let oid = match oid {
        Some(oid) if !oid.is_null() => oid,
        _ => return Ok(Vec::new()),
    };
    let tree = store.read_tree(oid)?;
    Ok(tree
        .entries
        .into_iter()
        .map(|e| TreeNode {
            name: e.name,
            mode: e.mode,
            oid: e.oid,
        })
        .collect())
}

/// The dircache's view of one name at the current level.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct IndexGroup {
    /// Range of entries whose path is exactly `prefix + name` (conflict
    /// stages are adjacent).
    pub file_range: Option<(usize, usize)>,
    /// Range of entries under `prefix + name + "/"`.
    pub dir_range: Option<(usize, usize)>,
}

/// Group the dircache entries of `range` (all sharing `prefix_len` bytes of
/// path prefix) by their next path component.
///
/// A name can surface both as a file and as a directory (the entries are
/// not adjacent in path order then), which is why this goes through a map.
pub(crate) fn index_level(
    entries: &[IndexEntry],
    range: (usize, usize),
    prefix_len: usize,
) -> Vec<(BString, IndexGroup)> {
    let mut groups: BTreeMap<BString, IndexGroup> = BTreeMap::new();

    let mut i = range.0;
    while i < range.1 {
        let rest = &entries[i].path[prefix_len..];
        let (name, is_dir) = match rest.iter().position(|&b| b == b'/') {
            Some(slash) => (BString::from(&rest[..slash]), true),
            None => (BString::from(rest), false),
        };

        // Extend the run of entries sharing this (name, kind).
        let run_start = i;
        let mut run_end = i + 1;
        while run_end < range.1 {
            let r = &entries[run_end].path[prefix_len..];
            let matches = if is_dir {
                r.len() > name.len() && r.starts_with(&name) && r[name.len()] == b'/'
            } else {
                r == &name[..]
            };
            if !matches {
                break;
            }
            run_end += 1;
        }

        let group = groups.entry(name).or_default();
        if is_dir {
            group.dir_range = Some(match group.dir_range {
                Some((lo, _)) => (lo, run_end),
                None => (run_start, run_end),
            });
        } else {
            group.file_range = Some(match group.file_range {
                Some((lo, _)) => (lo, run_end),
                None => (run_start, run_end),
            });
        }

        i = run_end;
    }

    groups.into_iter().collect()
}
