//! Append-only rebuilding of the dircache.

use bstr::BStr;

use crate::{DirCache, IndexEntry, IndexError, Stage, StatData};

/// Accumulates the entries of a new dircache generation.
///
/// Entries are appended in tree-walk order; the final (path, stage) sort is
/// applied once when the builder finishes, so callers that interleave
/// name-conflicting paths cannot corrupt index ordering.
pub struct DirCacheBuilder<'a> {
    cache: &'a mut DirCache,
    entries: Vec<IndexEntry>,
}

impl<'a> DirCacheBuilder<'a> {
    pub(crate) fn new(cache: &'a mut DirCache) -> Self {
        Self {
            cache,
            entries: Vec::new(),
        }
    }

    /// Append a new entry.
    pub fn add(&mut self, entry: IndexEntry) {
        self.entries.push(entry);
    }

    /// Append a clone of an existing entry, preserving stage, mode, oid and
    /// stat data. Returns the clone.
    pub fn keep(&mut self, entry: &IndexEntry) -> IndexEntry {
        let clone = entry.clone();
        self.entries.push(clone.clone());
        clone
    }

    /// Number of entries staged so far.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Refresh the stat data of the stage-0 entry staged for `path`, if
    /// one exists. Used after materializing an entry into the working tree
    /// so the committed dircache is not immediately stale.
    pub fn refresh_stat(&mut self, path: &BStr, stat: StatData) {
        for entry in &mut self.entries {
            if entry.path[..] == path[..] && entry.stage == Stage::Normal {
                entry.stat = stat;
            }
        }
    }

    /// Install the accumulated entries into the dircache without touching
    /// disk. Used for in-core merges.
    pub fn finish(self) {
        self.cache.install(self.entries);
    }

    /// Install the accumulated entries, persist the dircache through its
    /// held lock, and release the lock.
    pub fn commit(self) -> Result<(), IndexError> {
        let cache = self.cache;
        cache.install(self.entries);
        cache.persist_through_lock()
    }
}
