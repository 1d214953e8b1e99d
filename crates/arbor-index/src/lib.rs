//! The dircache (index) for arbor.
//!
//! The dircache maps paths to staged entries and sits between the working
//! tree and the object store. During a merge it is rebuilt through a
//! [`DirCacheBuilder`] while the on-disk file stays locked; committing the
//! builder persists the new content and releases the lock.

mod builder;
pub mod entry;
mod read;
mod write;

use std::path::{Path, PathBuf};

use bstr::BStr;
use arbor_hash::ObjectId;
use arbor_odb::ObjectStore;

pub use builder::DirCacheBuilder;
pub use entry::{IndexEntry, StatData};
pub use error::IndexError;

mod error {
    use std::path::PathBuf;

    #[derive(Debug, thiserror::Error)]
    pub enum IndexError {
        #[error("invalid index header: {0}")]
        InvalidHeader(String),

        #[error("unsupported index version: {0}")]
        UnsupportedVersion(u32),

        #[error("index checksum mismatch")]
        ChecksumMismatch,

        #[error("invalid index entry at offset {offset}: {reason}")]
        InvalidEntry { offset: usize, reason: String },

        #[error("lock failed: {path}")]
        LockFailed { path: PathBuf },

        #[error("index is not locked; nothing to commit")]
        NotLocked,

        #[error("cannot write a tree from an index with unmerged entries")]
        UnmergedEntries,

        #[error(transparent)]
        Io(#[from] std::io::Error),

        #[error(transparent)]
        Odb(#[from] arbor_odb::OdbError),
    }
}

/// Merge stage of a dircache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Fully merged (stage 0).
    Normal,
    /// Common ancestor version of a conflict (stage 1).
    Base,
    /// Our version of a conflict (stage 2).
    Ours,
    /// Their version of a conflict (stage 3).
    Theirs,
}

impl Stage {
    pub fn as_u8(&self) -> u8 {
        match self {
            Stage::Normal => 0,
            Stage::Base => 1,
            Stage::Ours => 2,
            Stage::Theirs => 3,
        }
    }

    pub fn from_u8(n: u8) -> Result<Self, IndexError> {
        match n {
            0 => Ok(Stage::Normal),
            1 => Ok(Stage::Base),
            2 => Ok(Stage::Ours),
            3 => Ok(Stage::Theirs),
            _ => Err(IndexError::InvalidEntry {
                offset: 0,
                reason: format!("invalid stage: {n}"),
            }),
        }
    }
}

/// The dircache.
pub struct DirCache {
    /// Entries sorted by (path, stage).
    entries: Vec<IndexEntry>,
    /// Backing file, absent for a purely in-core cache.
    path: Option<PathBuf>,
    /// Exclusive lock, held between [`DirCache::lock`] and builder commit.
    lock: Option<arbor_utils::lockfile::LockFile>,
}

impl DirCache {
    /// Create an empty in-core dircache with no backing file.
    pub fn new_in_core() -> Self {
        Self {
            entries: Vec::new(),
            path: None,
            lock: None,
        }
    }

    /// Read the dircache from a file without locking it.
    ///
    /// A missing file yields an empty dircache bound to that path.
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let path = path.as_ref();
        let entries = if path.exists() {
            let file = std::fs::File::open(path)?;
            // An empty file cannot be mapped; treat it like a missing index.
            if file.metadata()?.len() == 0 {
                Vec::new()
            } else {
                let data = unsafe { memmap2::Mmap::map(&file) }?;
                read::parse_index(&data)?
            }
        } else {
            Vec::new()
        };
        Ok(Self {
            entries,
            path: Some(path.to_path_buf()),
            lock: None,
        })
    }

    /// Read the dircache and take the exclusive file lock.
    ///
    /// The lock is released when a builder created from this cache commits,
    /// when [`unlock`](DirCache::unlock) is called, or on drop.
    pub fn lock(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let path = path.as_ref();
        let lock = arbor_utils::lockfile::LockFile::acquire(path).map_err(|_| {
            IndexError::LockFailed {
                path: path.to_path_buf(),
            }
        })?;
        let mut cache = Self::read_from(path)?;
        cache.lock = Some(lock);
        Ok(cache)
    }

    /// Whether this cache currently holds the file lock.
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Release the file lock without writing.
    pub fn unlock(&mut self) -> Result<(), IndexError> {
        if let Some(lock) = self.lock.take() {
            lock.rollback()
                .map_err(|_| IndexError::LockFailed {
                    path: self.path.clone().unwrap_or_default(),
                })?;
        }
        Ok(())
    }

    /// Backing file path, if any.
    pub fn file_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// All entries, sorted by (path, stage).
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Get an entry by path and stage.
    pub fn entry(&self, path: &BStr, stage: Stage) -> Option<&IndexEntry> {
        self.entries
            .iter()
            .find(|e| e.path[..] == path[..] && e.stage == stage)
    }

    /// Get the first entry for a path, in stage order.
    pub fn first_entry(&self, path: &BStr) -> Option<&IndexEntry> {
        self.entries.iter().find(|e| e.path[..] == path[..])
    }

    /// Whether any entry sits at a stage above 0.
    pub fn has_unmerged(&self) -> bool {
        self.entries.iter().any(|e| e.stage != Stage::Normal)
    }

    /// Start rebuilding this dircache.
    ///
    /// The builder starts empty; entries the new index should retain must be
    /// re-added (or kept) explicitly.
    pub fn builder(&mut self) -> DirCacheBuilder<'_> {
        DirCacheBuilder::new(self)
    }

    /// Write the stage-0 entries as a nested tree into the object store and
    /// return the root tree OID.
    ///
    /// Fails when unmerged entries are present.
    pub fn write_tree(&self, store: &ObjectStore) -> Result<ObjectId, IndexError> {
        if self.has_unmerged() {
            return Err(IndexError::UnmergedEntries);
        }
        write::write_tree_from_entries(&self.entries, store)
    }

    pub(crate) fn install(&mut self, mut entries: Vec<IndexEntry>) {
        entries.sort_by(cmp_entries);
        self.entries = entries;
    }

    pub(crate) fn persist_through_lock(&mut self) -> Result<(), IndexError> {
        let lock = self.lock.take().ok_or(IndexError::NotLocked)?;
        let data = write::serialize_index(&self.entries)?;
        write::commit_through_lock(lock, &data)
    }
}

/// Sort order for dircache entries: by path bytes, then by stage.
pub(crate) fn cmp_entries(a: &IndexEntry, b: &IndexEntry) -> std::cmp::Ordering {
    a.path
        .cmp(&b.path)
        .then(a.stage.as_u8().cmp(&b.stage.as_u8()))
}
