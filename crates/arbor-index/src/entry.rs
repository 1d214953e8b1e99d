//! Dircache entry types: IndexEntry and StatData.

use bstr::BString;
use arbor_hash::ObjectId;
use arbor_object::FileMode;

use crate::Stage;

/// A single entry in the dircache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Path relative to the work tree root.
    pub path: BString,
    /// Object ID of the blob.
    pub oid: ObjectId,
    /// File mode.
    pub mode: FileMode,
    /// Merge stage (0 = merged, 1 = base, 2 = ours, 3 = theirs).
    pub stage: Stage,
    /// Stat data cached from the file system.
    pub stat: StatData,
}

impl IndexEntry {
    /// Create an entry with empty stat data.
    pub fn new(path: BString, oid: ObjectId, mode: FileMode, stage: Stage) -> Self {
        Self {
            path,
            oid,
            mode,
            stage,
            stat: StatData::default(),
        }
    }

    /// Last-modified time in seconds (0 when never stat'ed).
    pub fn last_modified(&self) -> u32 {
        self.stat.mtime_secs
    }

    /// Cached file length.
    pub fn length(&self) -> u32 {
        self.stat.size
    }
}

/// File system stat data cached in the dircache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatData {
    pub ctime_secs: u32,
    pub ctime_nsecs: u32,
    pub mtime_secs: u32,
    pub mtime_nsecs: u32,
    pub dev: u32,
    pub ino: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
}

impl StatData {
    /// Create from file system metadata.
    #[cfg(unix)]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            ctime_secs: meta.ctime() as u32,
            ctime_nsecs: meta.ctime_nsec() as u32,
            mtime_secs: meta.mtime() as u32,
            mtime_nsecs: meta.mtime_nsec() as u32,
            dev: meta.dev() as u32,
            ino: meta.ino() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            size: meta.len() as u32,
        }
    }

    /// Create from file system metadata (non-Unix fallback).
    #[cfg(not(unix))]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::time::UNIX_EPOCH;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .unwrap_or_default();
        Self {
            ctime_secs: mtime.as_secs() as u32,
            ctime_nsecs: mtime.subsec_nanos(),
            mtime_secs: mtime.as_secs() as u32,
            mtime_nsecs: mtime.subsec_nanos(),
            dev: 0,
            ino: 0,
            uid: 0,
            gid: 0,
            size: meta.len() as u32,
        }
    }

    /// Check whether cached stat data still matches the file on disk.
    ///
    /// A zero-valued field on either side is treated as "unknown" for the
    /// identity fields (ino, dev, uid, gid).
    pub fn matches(&self, meta: &std::fs::Metadata) -> bool {
        let other = Self::from_metadata(meta);

        if self.size != other.size {
            return false;
        }
        if self.mtime_secs != other.mtime_secs || self.mtime_nsecs != other.mtime_nsecs {
            return false;
        }
        if self.ino != 0 && other.ino != 0 && self.ino != other.ino {
            return false;
        }
        if self.dev != 0 && other.dev != 0 && self.dev != other.dev {
            return false;
        }

        true
    }
}
