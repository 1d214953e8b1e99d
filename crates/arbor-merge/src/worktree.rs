//! Working-tree enumeration in lock-step with the tree walk.

use std::ffi::OsStr;
use std::fs::Metadata;
use std::path::{Path, PathBuf};

use bstr::{BStr, BString};
use arbor_hash::{hasher::Hasher, HashAlgorithm, ObjectId};
use arbor_index::IndexEntry;
use arbor_object::FileMode;

use crate::MergeError;

/// Enumerates working-tree entries level by level for the merge walk.
pub struct WorkingTreeIterator {
    root: PathBuf,
    hash_algo: HashAlgorithm,
}

/// One on-disk entry at the current level.
#[derive(Debug)]
pub(crate) struct WorkNode {
    pub name: BString,
    /// On-disk kind: `Tree` for directories, exec bit folded in for files.
    pub mode: FileMode,
    pub path: PathBuf,
    pub metadata: Metadata,
}

impl WorkingTreeIterator {
    /// Create an iterator over the working tree rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            hash_algo: HashAlgorithm::Sha1,
        }
    }

    /// Override the hash algorithm used for content comparison.
    pub fn with_hash_algo(mut self, algo: HashAlgorithm) -> Self {
        self.hash_algo = algo;
        self
    }

    /// The working tree root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Enumerate the directory at `prefix` (repository-relative, "" for the
    /// root), sorted by name. The repository directory itself is skipped.
    pub(crate) fn level(&self, prefix: &BStr) -> Result<Vec<WorkNode>, MergeError> {
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.root.join(path_from_bytes(prefix))
        };

        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut nodes = Vec::new();
        for dirent in std::fs::read_dir(&dir)? {
            let dirent = dirent?;
            let name = os_to_bytes(&dirent.file_name());
            if prefix.is_empty() && name == arbor_repository::REPO_DIR {
                continue;
            }
            // DirEntry metadata does not traverse symlinks.
            let metadata = dirent.metadata()?;
            let mode = classify(&metadata);
            nodes.push(WorkNode {
                name,
                mode,
                path: dirent.path(),
                metadata,
            });
        }
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }

    /// Whether the on-disk entry kind differs from the given raw tree mode.
    ///
    /// An absent tree mode (0) always differs from an existing entry.
    pub(crate) fn mode_differs(node: &WorkNode, tree_mode: u32) -> bool {
        if tree_mode == 0 {
            return true;
        }
        let tree = FileMode::from_raw(tree_mode);
        if node.mode.is_tree() != tree.is_tree()
            || node.mode.is_symlink() != tree.is_symlink()
            || node.mode.is_gitlink() != tree.is_gitlink()
        {
            return true;
        }
        if node.mode.is_blob() && tree.is_blob() {
            return node.mode != tree;
        }
        false
    }

    /// Blob OID of the on-disk content.
    ///
    /// When `stat_hint` still matches the file's stat data, its OID is
    /// reused without re-hashing.
    pub(crate) fn content_oid(
        &self,
        node: &WorkNode,
        stat_hint: Option<&IndexEntry>,
    ) -> Result<ObjectId, MergeError> {
        if let Some(entry) = stat_hint {
            if entry.stat.matches(&node.metadata) {
                return Ok(entry.oid);
            }
        }

        let data = if node.mode.is_symlink() {
            let target = std::fs::read_link(&node.path)?;
            os_to_bytes(target.as_os_str()).to_vec()
        } else {
            std::fs::read(&node.path)?
        };

        Hasher::hash_object(self.hash_algo, "blob", &data)
            .map_err(|e| MergeError::Odb(arbor_odb::OdbError::Hash(e)))
    }
}

/// Classify on-disk metadata into a tree file mode.
fn classify(metadata: &Metadata) -> FileMode {
    let ft = metadata.file_type();
    if ft.is_dir() {
        return FileMode::Tree;
    }
    if ft.is_symlink() {
        return FileMode::Symlink;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 != 0 {
            return FileMode::Executable;
        }
    }
    FileMode::Regular
}

fn os_to_bytes(name: &OsStr) -> BString {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        BString::from(name.as_bytes())
    }
    #[cfg(not(unix))]
    {
        BString::from(name.to_string_lossy().as_bytes())
    }
}

/// Convert repository-relative path bytes into a filesystem path.
pub(crate) fn path_from_bytes(path: &BStr) -> PathBuf {
    #[cfg(unix)]
    {
        use std::os::unix::ffi::OsStrExt;
        PathBuf::from(OsStr::from_bytes(path))
    }
    #[cfg(not(unix))]
    {
        use bstr::ByteSlice;
        PathBuf::from(path.to_str_lossy().into_owned())
    }
}
