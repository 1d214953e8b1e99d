//! Three-way resolve merge.
//!
//! Given a common ancestor tree, an "ours" tree, and a "theirs" tree, the
//! [`ResolveMerger`] walks all three together with the dircache and
//! (optionally) the working tree, deciding per path between trivial
//! resolution, line-level content merge, and a staged conflict. Paths that
//! cannot be merged safely because the dircache or working tree diverges
//! from OURS abort the merge instead of conflicting.

pub mod content;
mod resolve;
mod walk;
pub mod worktree;

pub use content::{merge_content, MergeLabels};
pub use resolve::ResolveMerger;
pub use worktree::WorkingTreeIterator;

/// Conflict marker style.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictStyle {
    /// Show ours and theirs only.
    #[default]
    Merge,
    /// Include the base content between `|||||||` markers.
    Diff3,
}

impl ConflictStyle {
    /// Parse a config value (as used by `merge.conflictStyle`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "merge" => Some(Self::Merge),
            "diff3" => Some(Self::Diff3),
            _ => None,
        }
    }

    /// Canonical config name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Diff3 => "diff3",
        }
    }
}

/// Result of a three-way content merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentMergeResult {
    /// Clean merge, no conflicts.
    Clean(Vec<u8>),
    /// Conflict, markers included in the content.
    Conflict {
        /// Merged content including conflict markers.
        content: Vec<u8>,
        /// Number of conflict regions.
        conflict_count: usize,
    },
}

impl ContentMergeResult {
    /// The empty result recorded for unmergeable-mode conflicts. Consumers
    /// rely on the map key being present, so this is a value, not an
    /// absence.
    pub fn empty() -> Self {
        Self::Clean(Vec::new())
    }

    /// Whether the merge carried conflicts.
    pub fn has_conflicts(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// The merged content (with or without conflict markers).
    pub fn content(&self) -> &[u8] {
        match self {
            Self::Clean(data) => data,
            Self::Conflict { content, .. } => content,
        }
    }
}

/// Why a merge was aborted (distinct from a conflict).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The dircache entry diverges from OURS.
    DirtyIndex,
    /// The working-tree file diverges from OURS.
    DirtyWorktree,
    /// A scheduled deletion could not be performed.
    CouldNotDelete,
}

/// Side chosen by a merge filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterChoice {
    /// Keep our side.
    Ours,
    /// Take their side.
    Theirs,
}

/// Automatic conflict resolver: path → side to take.
pub type MergeFilter = Box<dyn FnMut(&bstr::BStr) -> FilterChoice>;

/// Errors from merge operations.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("repository has no working tree")]
    NoWorkTree,

    #[error(transparent)]
    Odb(#[from] arbor_odb::OdbError),

    #[error(transparent)]
    Index(#[from] arbor_index::IndexError),

    #[error(transparent)]
    Repo(#[from] arbor_repository::RepoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Default names written into conflict markers.
pub(crate) fn default_commit_names() -> [String; 3] {
    ["BASE".to_string(), "OURS".to_string(), "THEIRS".to_string()]
}
